use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{self, EnrollmentUpdate};
use crate::error::EngineError;
use crate::models::enrollment::Enrollment;
use crate::models::log_entry::{Channel, LogStatus, NewLogEntry};
use crate::models::recipient::Recipient;
use crate::models::sender::Sender;
use crate::models::sequence::{SequenceSnapshot, Step};
use crate::services::channels::{ChannelSet, DispatchStatus, OutboundMessage};
use crate::services::personalizer::{self, AiClient};
use crate::services::rate_governor::{RateGovernor, SendWindow, SlotDecision};
use crate::services::signature;
use crate::services::template;

const BACKOFF_BASE_SECS: i64 = 300;
const BACKOFF_CAP_SECS: i64 = 21_600;

/// Resolves one due enrollment: materializes the step's payload, asks
/// the Rate Governor for a slot, invokes the channel adapter, records
/// the outcome, and computes the next due time.
pub struct StepExecutor {
    pool: Arc<PgPool>,
    governor: Arc<RateGovernor>,
    channels: Arc<ChannelSet>,
    ai: AiClient,
    max_attempts: i32,
}

impl StepExecutor {
    pub fn new(
        pool: Arc<PgPool>,
        governor: Arc<RateGovernor>,
        channels: Arc<ChannelSet>,
        ai: AiClient,
        max_attempts: i32,
    ) -> Self {
        Self {
            pool,
            governor,
            channels,
            ai,
            max_attempts,
        }
    }

    pub async fn execute(&self, enrollment: &Enrollment) -> Result<(), EngineError> {
        let now = Utc::now();
        let snapshot = db::load_snapshot(self.pool.as_ref(), enrollment.sequence_id).await?;

        let index = enrollment.step_index as usize;
        let Some(step) = snapshot.steps.get(index) else {
            // Steps were appended and then removed out from under us, or
            // the row predates a truncation. Nothing left to run.
            return self.persist(
                enrollment,
                EnrollmentUpdate {
                    step_index: enrollment.step_index,
                    due_at: enrollment.due_at,
                    status: "completed",
                    attempts: enrollment.attempts,
                    last_error: None,
                },
                None,
            )
            .await;
        };

        if let Step::Wait { delay_days } = step {
            return self
                .advance_past_wait(enrollment, &snapshot, now, *delay_days)
                .await;
        }

        let sender = db::get_sender(self.pool.as_ref(), &snapshot.sender_email).await?;
        let recipient = db::get_recipient(self.pool.as_ref(), enrollment.recipient_id).await?;

        // The browser channels carry their own hard daily cap, enforced
        // before the Rate Governor is consulted at all.
        if matches!(step, Step::NetworkConnect { .. } | Step::NetworkMessage { .. })
            && self.channels.network.at_daily_cap(&sender.email).await
        {
            let window = SendWindow::from_sender(&sender)?;
            let due = window.next_opening_on_or_after(
                window.local_date(now) + Duration::days(1),
                None,
            );
            return self.persist(
                enrollment,
                EnrollmentUpdate {
                    step_index: enrollment.step_index,
                    due_at: due.max(enrollment.due_at),
                    status: "pending",
                    attempts: enrollment.attempts,
                    last_error: None,
                },
                None,
            )
            .await;
        }

        let (message, subject, mut variant_tags) = match self
            .resolve_payload(step, &snapshot, &sender, &recipient, now)
            .await
        {
            Ok(resolved) => resolved,
            Err(EngineError::TemplateSyntax(detail)) => {
                // A template that cannot render will never render; fail
                // the enrollment rather than burn retries on it.
                return self
                    .record_permanent(
                        enrollment,
                        step,
                        &sender,
                        &recipient,
                        None,
                        "template_syntax_error",
                        &detail,
                    )
                    .await;
            }
            Err(EngineError::PermanentChannel(detail)) => {
                return self
                    .record_permanent(
                        enrollment,
                        step,
                        &sender,
                        &recipient,
                        None,
                        "permanent_channel_failure",
                        &detail,
                    )
                    .await;
            }
            Err(e) => return Err(e),
        };

        let grant = match self.governor.request_slot(&sender, now).await? {
            SlotDecision::Granted(grant) => grant,
            SlotDecision::Denied {
                reason,
                next_eligible_at,
            } => {
                let due = next_eligible_at.unwrap_or(now + Duration::minutes(15));
                tracing::debug!(
                    enrollment = %enrollment.id,
                    sender = %sender.email,
                    reason = reason.as_str(),
                    "slot denied, rescheduling"
                );
                return self.persist(
                    enrollment,
                    EnrollmentUpdate {
                        step_index: enrollment.step_index,
                        due_at: due.max(enrollment.due_at),
                        status: "pending",
                        attempts: enrollment.attempts,
                        last_error: None,
                    },
                    None,
                )
                .await;
            }
        };

        let channel = message.channel();
        let adapter = self.channels.adapter_for(channel);
        let outcome = adapter.dispatch(&message, &sender).await;

        match outcome.status {
            DispatchStatus::Sent => {
                self.governor.commit(&grant).await?;
                let next_index = enrollment.step_index + 1;
                let (status, due) = if next_index as usize >= snapshot.steps.len() {
                    ("completed", now)
                } else {
                    let pre_delay = snapshot.steps[next_index as usize].pre_delay_days();
                    if pre_delay > 0 {
                        ("waiting", now + Duration::days(pre_delay))
                    } else {
                        ("pending", now)
                    }
                };
                let entry = NewLogEntry {
                    enrollment_id: Some(enrollment.id),
                    step_index: enrollment.step_index,
                    channel,
                    sender_email: sender.email.clone(),
                    recipient_id: Some(recipient.id),
                    status: LogStatus::Sent,
                    external_ref: outcome.external_ref,
                    subject,
                    variant_tags: std::mem::take(&mut variant_tags),
                };
                self.persist(
                    enrollment,
                    EnrollmentUpdate {
                        step_index: next_index,
                        due_at: due.max(enrollment.due_at),
                        status,
                        attempts: 0,
                        last_error: None,
                    },
                    Some(entry),
                )
                .await
            }
            DispatchStatus::TransientFailure => {
                self.governor.release(&grant).await;
                let detail = outcome.detail.unwrap_or_else(|| "transient failure".to_string());
                let attempts = enrollment.attempts + 1;
                if attempts >= self.max_attempts {
                    return self
                        .record_permanent(
                            enrollment,
                            step,
                            &sender,
                            &recipient,
                            subject.as_deref(),
                            "transient_channel_failure",
                            &format!("retries exhausted: {}", detail),
                        )
                        .await;
                }
                let entry = NewLogEntry {
                    enrollment_id: Some(enrollment.id),
                    step_index: enrollment.step_index,
                    channel,
                    sender_email: sender.email.clone(),
                    recipient_id: Some(recipient.id),
                    status: LogStatus::TransientFailure,
                    external_ref: None,
                    subject,
                    variant_tags: std::mem::take(&mut variant_tags),
                };
                let due = now + backoff_delay(attempts);
                self.persist(
                    enrollment,
                    EnrollmentUpdate {
                        step_index: enrollment.step_index,
                        due_at: due.max(enrollment.due_at),
                        status: "pending",
                        attempts,
                        last_error: Some(("transient_channel_failure".to_string(), detail)),
                    },
                    Some(entry),
                )
                .await
            }
            DispatchStatus::PermanentFailure => {
                self.governor.release(&grant).await;
                let detail = outcome.detail.unwrap_or_else(|| "permanent failure".to_string());
                self.record_permanent(
                    enrollment,
                    step,
                    &sender,
                    &recipient,
                    subject.as_deref(),
                    "permanent_channel_failure",
                    &detail,
                )
                .await
            }
        }
    }

    /// A wait step advances immediately; the pause lands on the due time
    /// of the step that follows it.
    async fn advance_past_wait(
        &self,
        enrollment: &Enrollment,
        snapshot: &SequenceSnapshot,
        now: DateTime<Utc>,
        delay_days: i64,
    ) -> Result<(), EngineError> {
        let next_index = enrollment.step_index + 1;
        let (status, due) = if next_index as usize >= snapshot.steps.len() {
            ("completed", now)
        } else if delay_days > 0 {
            ("waiting", now + Duration::days(delay_days))
        } else {
            ("pending", now)
        };
        self.persist(
            enrollment,
            EnrollmentUpdate {
                step_index: next_index,
                due_at: due.max(enrollment.due_at),
                status,
                attempts: 0,
                last_error: None,
            },
            None,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_permanent(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        sender: &Sender,
        recipient: &Recipient,
        subject: Option<&str>,
        kind: &str,
        detail: &str,
    ) -> Result<(), EngineError> {
        let entry = NewLogEntry {
            enrollment_id: Some(enrollment.id),
            step_index: enrollment.step_index,
            channel: step.channel().unwrap_or(Channel::Email),
            sender_email: sender.email.clone(),
            recipient_id: Some(recipient.id),
            status: LogStatus::PermanentFailure,
            external_ref: None,
            subject: subject.map(str::to_string),
            variant_tags: Vec::new(),
        };
        self.persist(
            enrollment,
            EnrollmentUpdate {
                step_index: enrollment.step_index,
                due_at: enrollment.due_at,
                status: "failed",
                attempts: enrollment.attempts,
                last_error: Some((kind.to_string(), detail.to_string())),
            },
            Some(entry),
        )
        .await
    }

    async fn persist(
        &self,
        enrollment: &Enrollment,
        update: EnrollmentUpdate,
        log: Option<NewLogEntry>,
    ) -> Result<(), EngineError> {
        db::persist_result(
            self.pool.as_ref(),
            enrollment.id,
            enrollment.version,
            &update,
            log.as_ref(),
        )
        .await
    }

    /// Materialize the step into an outbound message. Returns the message,
    /// the rendered subject (email only), and variant tags for the log.
    async fn resolve_payload(
        &self,
        step: &Step,
        snapshot: &SequenceSnapshot,
        sender: &Sender,
        recipient: &Recipient,
        now: DateTime<Utc>,
    ) -> Result<(OutboundMessage, Option<String>, Vec<String>), EngineError> {
        let mut vars = base_variables(recipient, sender, snapshot, now);

        match step {
            Step::Email {
                template_key,
                subject,
                body,
                personalization_mode,
                ..
            } => {
                let personalization =
                    personalizer::personalize(recipient, *personalization_mode, &self.ai).await;
                let mut tags = Vec::new();
                if personalization.degraded {
                    tags.push("ai_fallback".to_string());
                }
                vars.extend(personalization.vars);

                let (subject_template, body_template) = match template_key {
                    Some(key) => {
                        let tpl = template::library(key).ok_or_else(|| {
                            EngineError::PermanentChannel(format!("unknown template '{}'", key))
                        })?;
                        (tpl.subject, tpl.body)
                    }
                    None => (
                        subject.clone().unwrap_or_default(),
                        body.clone().unwrap_or_default(),
                    ),
                };

                let body_template = match personalization.replacement_body {
                    Some(generated) => paragraphs_to_html(&generated),
                    None => body_template,
                };

                let rendered_subject = template::render(&subject_template, &vars)?;
                let rendered_body = template::render(&body_template, &vars)?;
                let plain_body = signature::html_to_plain(&rendered_body);
                let (rich, plain) =
                    signature::attach_signature(sender, &rendered_body, &plain_body);

                let to_name = format!(
                    "{} {}",
                    recipient.first_name.as_deref().unwrap_or(""),
                    recipient.last_name.as_deref().unwrap_or("")
                )
                .trim()
                .to_string();

                Ok((
                    OutboundMessage::Email {
                        to_email: recipient.email.clone(),
                        to_name: if to_name.is_empty() { None } else { Some(to_name) },
                        subject: rendered_subject.clone(),
                        rich_body: rich,
                        plain_body: plain,
                    },
                    Some(rendered_subject),
                    tags,
                ))
            }
            Step::Call { script, .. } => {
                let to_phone = recipient
                    .phone
                    .clone()
                    .ok_or_else(|| EngineError::PermanentChannel("recipient has no phone number".to_string()))?;
                let rendered = template::render(script, &vars)?;
                Ok((
                    OutboundMessage::Call {
                        to_phone,
                        script: rendered,
                    },
                    None,
                    Vec::new(),
                ))
            }
            Step::NetworkConnect { message, .. } => {
                let profile_url = recipient.linkedin_url.clone().ok_or_else(|| {
                    EngineError::PermanentChannel("recipient has no profile URL".to_string())
                })?;
                let rendered = template::render(message, &vars)?;
                Ok((
                    OutboundMessage::NetworkConnect {
                        profile_url,
                        message: rendered,
                    },
                    None,
                    Vec::new(),
                ))
            }
            Step::NetworkMessage { message, .. } => {
                let profile_url = recipient.linkedin_url.clone().ok_or_else(|| {
                    EngineError::PermanentChannel("recipient has no profile URL".to_string())
                })?;
                let rendered = template::render(message, &vars)?;
                Ok((
                    OutboundMessage::NetworkMessage {
                        profile_url,
                        message: rendered,
                    },
                    None,
                    Vec::new(),
                ))
            }
            Step::Wait { .. } => Err(EngineError::Internal(
                "wait steps do not produce payloads".to_string(),
            )),
        }
    }
}

/// Recipient, sender, and constant variables, in ascending precedence.
pub fn base_variables(
    recipient: &Recipient,
    sender: &Sender,
    snapshot: &SequenceSnapshot,
    now: DateTime<Utc>,
) -> HashMap<String, String> {
    let mut vars = recipient.variables();
    vars.extend(sender.variables());
    vars.insert("current_date".to_string(), now.format("%B %-d, %Y").to_string());
    vars.insert("campaign_name".to_string(), snapshot.name.clone());
    vars
}

/// Delay before retry `attempt` (1-based): 5 min doubling per attempt,
/// capped at 6 h, with ±20% jitter so a burst of failures fans out.
pub fn backoff_delay(attempt: i32) -> Duration {
    let exponent = (attempt - 1).clamp(0, 30) as u32;
    let base = BACKOFF_BASE_SECS.saturating_mul(1_i64 << exponent.min(16));
    let capped = base.min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let secs = (capped as f64 * (1.0 + jitter)).max(1.0) as i64;
    Duration::seconds(secs)
}

/// Un-jittered backoff, used to reason about the schedule.
pub fn backoff_base(attempt: i32) -> i64 {
    let exponent = (attempt - 1).clamp(0, 30) as u32;
    BACKOFF_BASE_SECS
        .saturating_mul(1_i64 << exponent.min(16))
        .min(BACKOFF_CAP_SECS)
}

fn paragraphs_to_html(text: &str) -> String {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| format!("<p>{}</p>", p.replace('\n', "<br/>")))
        .collect::<Vec<_>>()
        .join("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use uuid::Uuid;

    #[test]
    fn test_backoff_monotone_and_capped() {
        for attempt in 1..20 {
            assert!(backoff_base(attempt + 1) >= backoff_base(attempt));
        }
        assert_eq!(backoff_base(1), 300);
        assert_eq!(backoff_base(2), 600);
        assert_eq!(backoff_base(3), 1200);
        assert_eq!(backoff_base(12), BACKOFF_CAP_SECS);
        assert_eq!(backoff_base(30), BACKOFF_CAP_SECS);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        for attempt in 1..8 {
            let base = backoff_base(attempt);
            for _ in 0..20 {
                let delay = backoff_delay(attempt).num_seconds();
                assert!(delay >= (base as f64 * 0.79) as i64);
                assert!(delay <= (base as f64 * 1.21) as i64);
            }
        }
    }

    #[test]
    fn test_paragraphs_to_html() {
        let html = paragraphs_to_html("First line.\n\nSecond para,\nwrapped.");
        assert_eq!(html, "<p>First line.</p><p>Second para,<br/>wrapped.</p>");
    }

    #[test]
    fn test_base_variables_precedence() {
        let recipient = Recipient {
            id: Uuid::new_v4(),
            email: "mia@acme.io".to_string(),
            first_name: Some("Mia".to_string()),
            last_name: None,
            title: None,
            phone: None,
            linkedin_url: None,
            company_name: Some("Acme".to_string()),
            industry: None,
            attributes: serde_json::json!({"sender_name": "spoofed"}),
            created_at: Utc::now(),
        };
        let sender = Sender {
            email: "jo@vendor.com".to_string(),
            name: "Jo".to_string(),
            title: None,
            phone: None,
            signature_rich: String::new(),
            signature_plain: String::new(),
            warmup_enabled: false,
            warmup_start_date: None,
            ramp_key: "standard".to_string(),
            daily_cap: 50,
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
        };
        let snapshot = SequenceSnapshot {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            name: "Q3 logistics push".to_string(),
            sender_email: sender.email.clone(),
            steps: vec![],
        };
        let vars = base_variables(&recipient, &sender, &snapshot, Utc::now());
        // Sender fields override recipient enrichment attempts at the
        // same names.
        assert_eq!(vars.get("sender_name").unwrap(), "Jo");
        assert_eq!(vars.get("campaign_name").unwrap(), "Q3 logistics push");
        assert!(vars.contains_key("current_date"));
    }
}
