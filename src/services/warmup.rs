use chrono::NaiveDate;

use crate::models::sender::Sender;

/// Per-day send caps while an inbox builds reputation. Days past the end
/// of a table fall through to the sender's steady-state daily cap.
const STANDARD: &[i32] = &[
    5, 7, 10, 12, 15, 18, 22, 26, 30, 35, 40, 45, 50, 55, 60, 65, 70, 75, 80, 85, 90, 95, 100,
];

const CONSERVATIVE: &[i32] = &[
    2, 3, 4, 5, 6, 8, 10, 12, 14, 16, 18, 20, 22, 25, 28, 31, 34, 37, 40, 44, 48, 52, 56, 60, 65,
    70, 75, 80, 85, 90,
];

const AGGRESSIVE: &[i32] = &[10, 15, 20, 30, 40, 50, 65, 80, 100, 120];

pub fn ramp_table(key: &str) -> &'static [i32] {
    match key {
        "conservative" => CONSERVATIVE,
        "aggressive" => AGGRESSIVE,
        _ => STANDARD,
    }
}

/// Daily cap in effect for `sender` on `date`. With warmup disabled this
/// is the steady-state cap; during warmup the ramp value, clamped so a
/// hot ramp never exceeds the sender's own cap.
pub fn effective_cap(sender: &Sender, date: NaiveDate) -> i32 {
    if !sender.warmup_enabled {
        return sender.daily_cap;
    }
    let Some(start) = sender.warmup_start_date else {
        return sender.daily_cap;
    };
    let day = (date - start).num_days().max(0) as usize;
    let table = ramp_table(&sender.ramp_key);
    match table.get(day) {
        Some(cap) => (*cap).min(sender.daily_cap),
        None => sender.daily_cap,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn sender(warmup: bool, start: Option<&str>, ramp: &str, cap: i32) -> Sender {
        Sender {
            email: "jo@vendor.com".to_string(),
            name: "Jo".to_string(),
            title: None,
            phone: None,
            signature_rich: String::new(),
            signature_plain: String::new(),
            warmup_enabled: warmup,
            warmup_start_date: start.map(|s| s.parse().unwrap()),
            ramp_key: ramp.to_string(),
            daily_cap: cap,
            on_hold: false,
            send_days: vec![0, 1, 2, 3, 4],
            window_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            window_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            timezone: "UTC".to_string(),
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password_encrypted: None,
            encryption_key_id: None,
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn test_disabled_uses_daily_cap() {
        let s = sender(false, None, "standard", 50);
        assert_eq!(effective_cap(&s, date("2025-06-02")), 50);
    }

    #[test]
    fn test_ramp_day_zero() {
        let s = sender(true, Some("2025-06-02"), "standard", 50);
        assert_eq!(effective_cap(&s, date("2025-06-02")), 5);
    }

    #[test]
    fn test_ramp_progression() {
        let s = sender(true, Some("2025-06-02"), "standard", 50);
        assert_eq!(effective_cap(&s, date("2025-06-03")), 7);
        assert_eq!(effective_cap(&s, date("2025-06-06")), 15);
        assert_eq!(effective_cap(&s, date("2025-06-07")), 18);
    }

    #[test]
    fn test_ramp_clamped_to_daily_cap() {
        let s = sender(true, Some("2025-06-02"), "aggressive", 50);
        // Day 8 of the aggressive table is 100, above the sender's cap.
        assert_eq!(effective_cap(&s, date("2025-06-10")), 50);
    }

    #[test]
    fn test_past_table_end_uses_daily_cap() {
        let s = sender(true, Some("2025-01-01"), "aggressive", 150);
        assert_eq!(effective_cap(&s, date("2025-06-02")), 150);
    }

    #[test]
    fn test_start_in_future_pins_day_zero() {
        let s = sender(true, Some("2025-06-10"), "standard", 50);
        assert_eq!(effective_cap(&s, date("2025-06-02")), 5);
    }
}
