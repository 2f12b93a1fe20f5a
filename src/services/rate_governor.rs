use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::models::sender::Sender;
use crate::services::warmup;

/// A sender's send window: eligible weekdays (0 = Monday .. 6 = Sunday)
/// and a local clock interval. The interval wraps midnight when the end
/// is at or before the start; equal start and end means the whole day.
#[derive(Debug, Clone)]
pub struct SendWindow {
    days: Vec<u32>,
    start: NaiveTime,
    end: NaiveTime,
    tz: Tz,
}

impl SendWindow {
    pub fn from_sender(sender: &Sender) -> Result<Self, EngineError> {
        let tz: Tz = sender.timezone.parse().map_err(|_| {
            EngineError::Validation(format!("invalid timezone '{}'", sender.timezone))
        })?;
        Ok(Self {
            days: sender.send_days.iter().map(|d| *d as u32).collect(),
            start: sender.window_start,
            end: sender.window_end,
            tz,
        })
    }

    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz).date_naive()
    }

    /// Membership is judged on the weekday of `now` in the window's zone
    /// and the local clock, half-open at the end.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        if !self.days.contains(&local.weekday().num_days_from_monday()) {
            return false;
        }
        let t = local.time();
        if self.start == self.end {
            true
        } else if self.start < self.end {
            t >= self.start && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    /// Next instant the window opens strictly after `after`: the next
    /// eligible weekday at the start clock time.
    pub fn next_opening(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let local = after.with_timezone(&self.tz);
        self.next_opening_on_or_after(local.date_naive(), Some(after))
    }

    /// Next opening on or after `date` (skipping any instant at or
    /// before `not_before`).
    pub fn next_opening_on_or_after(
        &self,
        date: NaiveDate,
        not_before: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        let mut day = date;
        // Eight iterations always reach an eligible weekday; DST gaps at
        // the start time push to the following day.
        for _ in 0..9 {
            if self.days.contains(&day.weekday().num_days_from_monday()) {
                if let Some(opening) = self.tz.from_local_datetime(&day.and_time(self.start)).earliest()
                {
                    let opening = opening.with_timezone(&Utc);
                    if not_before.map_or(true, |floor| opening > floor) {
                        return opening;
                    }
                }
            }
            day = day + Duration::days(1);
        }
        // Unreachable with a non-empty day set; fall back to a day out.
        Utc::now() + Duration::days(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Paused,
    Window,
    Quota,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Paused => "paused",
            DenyReason::Window => "window",
            DenyReason::Quota => "quota",
        }
    }
}

/// A reserved slot against a sender's daily cap. Consumed by `commit`
/// on a successful send or returned by `release` on failure.
#[derive(Debug, Clone)]
pub struct SlotGrant {
    pub sender_email: String,
    pub date: NaiveDate,
}

#[derive(Debug)]
pub enum SlotDecision {
    Granted(SlotGrant),
    Denied {
        reason: DenyReason,
        next_eligible_at: Option<DateTime<Utc>>,
    },
}

/// Per-sender quota keeper. Committed counts live in `warmup_counts`;
/// reservations for in-flight sends are in-memory only and are rebuilt
/// at startup from `in_flight` enrollments.
pub struct RateGovernor {
    pool: Arc<PgPool>,
    pending: Mutex<HashMap<String, i32>>,
}

impl RateGovernor {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Seed pending reservations from enrollments that were mid-dispatch
    /// when the previous process stopped.
    pub async fn reconstruct_pending(&self) -> Result<(), EngineError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT s.sender_email, COUNT(*)
            FROM enrollments e
            JOIN sequences s ON s.id = e.sequence_id
            WHERE e.status = 'in_flight'
            GROUP BY s.sender_email
            "#,
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        let mut pending = self.pending.lock().await;
        pending.clear();
        for (sender_email, count) in rows {
            pending.insert(sender_email, count as i32);
        }
        Ok(())
    }

    /// Two-phase slot request: checks hold flag, window, and quota, then
    /// reserves. The pending map's lock covers check-and-reserve so
    /// concurrent requests for one sender cannot both squeeze into the
    /// last slot.
    pub async fn request_slot(
        &self,
        sender: &Sender,
        now: DateTime<Utc>,
    ) -> Result<SlotDecision, EngineError> {
        if sender.on_hold {
            return Ok(SlotDecision::Denied {
                reason: DenyReason::Paused,
                next_eligible_at: None,
            });
        }

        let window = SendWindow::from_sender(sender)?;
        if !window.contains(now) {
            return Ok(SlotDecision::Denied {
                reason: DenyReason::Window,
                next_eligible_at: Some(window.next_opening(now)),
            });
        }

        let date = window.local_date(now);
        let cap = warmup::effective_cap(sender, date);

        let committed: Option<i32> =
            sqlx::query_scalar("SELECT count FROM warmup_counts WHERE sender_email = $1 AND date = $2")
                .bind(&sender.email)
                .bind(date)
                .fetch_optional(self.pool.as_ref())
                .await?;

        // Check-and-reserve is atomic per sender because the scheduler
        // serializes everything for one sender; this lock only protects
        // the map against other senders' bookkeeping.
        let mut pending = self.pending.lock().await;
        let reserved = *pending.get(&sender.email).unwrap_or(&0);
        if committed.unwrap_or(0) + reserved >= cap {
            return Ok(SlotDecision::Denied {
                reason: DenyReason::Quota,
                next_eligible_at: Some(
                    window.next_opening_on_or_after(date + Duration::days(1), None),
                ),
            });
        }

        *pending.entry(sender.email.clone()).or_insert(0) += 1;
        Ok(SlotDecision::Granted(SlotGrant {
            sender_email: sender.email.clone(),
            date,
        }))
    }

    /// Consume a grant after a successful send.
    pub async fn commit(&self, grant: &SlotGrant) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            INSERT INTO warmup_counts (sender_email, date, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (sender_email, date) DO UPDATE SET count = warmup_counts.count + 1
            "#,
        )
        .bind(&grant.sender_email)
        .bind(grant.date)
        .execute(self.pool.as_ref())
        .await?;

        self.drop_reservation(&grant.sender_email).await;
        Ok(())
    }

    /// Return a grant unused after a failed send.
    pub async fn release(&self, grant: &SlotGrant) {
        self.drop_reservation(&grant.sender_email).await;
    }

    async fn drop_reservation(&self, sender_email: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(count) = pending.get_mut(sender_email) {
            *count -= 1;
            if *count <= 0 {
                pending.remove(sender_email);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(days: &[u32], start: &str, end: &str, tz: &str) -> SendWindow {
        SendWindow {
            days: days.to_vec(),
            start: NaiveTime::parse_from_str(start, "%H:%M").unwrap(),
            end: NaiveTime::parse_from_str(end, "%H:%M").unwrap(),
            tz: tz.parse().unwrap(),
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_weekday_membership() {
        // Mon-Fri 09:00-17:00 UTC. 2025-06-02 is a Monday.
        let w = window(&[0, 1, 2, 3, 4], "09:00", "17:00", "UTC");
        assert!(w.contains(utc("2025-06-02T09:00:00Z")));
        assert!(w.contains(utc("2025-06-02T16:59:00Z")));
        assert!(!w.contains(utc("2025-06-02T08:59:00Z")));
        // Saturday.
        assert!(!w.contains(utc("2025-06-07T12:00:00Z")));
    }

    #[test]
    fn test_closing_minute_excluded() {
        let w = window(&[0, 1, 2, 3, 4], "09:00", "17:00", "UTC");
        assert!(!w.contains(utc("2025-06-02T17:00:00Z")));
        // Next opening is Tuesday 09:00.
        assert_eq!(
            w.next_opening(utc("2025-06-02T17:00:00Z")),
            utc("2025-06-03T09:00:00Z")
        );
    }

    #[test]
    fn test_overnight_window() {
        // Fri-Sat 22:00-02:00 in Denver (UTC-6 in June).
        let w = window(&[4, 5], "22:00", "02:00", "America/Denver");
        // Sat 01:30 local = Sat 07:30 UTC.
        assert!(w.contains(utc("2025-06-07T07:30:00Z")));
        // Sat 03:00 local is outside.
        assert!(!w.contains(utc("2025-06-07T09:00:00Z")));
        // Sun 01:30 local: Sunday is not an eligible weekday.
        assert!(!w.contains(utc("2025-06-08T07:30:00Z")));
    }

    #[test]
    fn test_overnight_reschedule_to_next_friday() {
        let w = window(&[4, 5], "22:00", "02:00", "America/Denver");
        // From Sun 01:30 local the next opening is Friday 22:00 local
        // (2025-06-13T22:00 Denver = 2025-06-14T04:00Z).
        let next = w.next_opening(utc("2025-06-08T07:30:00Z"));
        assert_eq!(next, utc("2025-06-14T04:00:00Z"));
    }

    #[test]
    fn test_next_opening_later_same_day() {
        let w = window(&[0, 1, 2, 3, 4], "09:00", "17:00", "UTC");
        assert_eq!(
            w.next_opening(utc("2025-06-02T05:00:00Z")),
            utc("2025-06-02T09:00:00Z")
        );
    }

    #[test]
    fn test_equal_bounds_is_all_day() {
        let w = window(&[0, 1, 2, 3, 4, 5, 6], "00:00", "00:00", "UTC");
        assert!(w.contains(utc("2025-06-02T23:59:00Z")));
        assert!(w.contains(utc("2025-06-02T00:00:00Z")));
    }

    #[test]
    fn test_next_opening_on_next_calendar_day() {
        let w = window(&[0, 1, 2, 3, 4], "09:00", "17:00", "UTC");
        // Quota exhausted Monday: next slot is Tuesday 09:00 even though
        // Monday's window is still open.
        let next = w.next_opening_on_or_after("2025-06-03".parse().unwrap(), None);
        assert_eq!(next, utc("2025-06-03T09:00:00Z"));
        // Friday quota exhaustion rolls over the weekend.
        let next = w.next_opening_on_or_after("2025-06-07".parse().unwrap(), None);
        assert_eq!(next, utc("2025-06-09T09:00:00Z"));
    }

    #[test]
    fn test_timezone_shift() {
        // 09:00-17:00 in New York (UTC-4 in June): 13:00Z opens.
        let w = window(&[0, 1, 2, 3, 4], "09:00", "17:00", "America/New_York");
        assert!(!w.contains(utc("2025-06-02T12:59:00Z")));
        assert!(w.contains(utc("2025-06-02T13:00:00Z")));
    }
}
