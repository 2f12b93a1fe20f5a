use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::error::EngineError;
use crate::models::log_entry::{Channel, LogStatus, NewLogEntry};

/// What happened to an incoming provider callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookDisposition {
    Recorded,
    /// Same (provider, event_id) seen before; accepted and discarded.
    Duplicate,
    /// No log entry matches the external reference; accepted, nothing
    /// to link to.
    Unmatched,
}

#[derive(Debug, Deserialize)]
pub struct EmailWebhookEvent {
    pub provider: String,
    pub event_id: String,
    /// delivered | opened | bounced | replied
    pub event: String,
    /// Provider message id from the original send.
    pub external_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct VoiceWebhookEvent {
    pub provider: String,
    pub event_id: String,
    /// call.started | call.completed | call.failed
    pub event: String,
    pub call_id: String,
}

pub async fn process_email_event(
    pool: &PgPool,
    event: &EmailWebhookEvent,
) -> Result<WebhookDisposition, EngineError> {
    let status = match event.event.as_str() {
        "delivered" => LogStatus::Delivered,
        "opened" => LogStatus::Opened,
        "bounced" => LogStatus::Bounced,
        "replied" => LogStatus::Replied,
        other => {
            return Err(EngineError::Validation(format!(
                "unknown email event '{}'",
                other
            )))
        }
    };

    if !db::record_webhook_event(pool, &event.provider, &event.event_id).await? {
        tracing::debug!(
            provider = %event.provider,
            event_id = %event.event_id,
            "duplicate email webhook discarded"
        );
        return Ok(WebhookDisposition::Duplicate);
    }

    let Some(origin) =
        db::find_log_by_external_ref(pool, Channel::Email.as_str(), &event.external_ref).await?
    else {
        tracing::warn!(external_ref = %event.external_ref, "email webhook matched no send");
        return Ok(WebhookDisposition::Unmatched);
    };

    db::insert_log(
        pool,
        &NewLogEntry {
            enrollment_id: origin.enrollment_id,
            step_index: origin.step_index,
            channel: Channel::Email,
            sender_email: origin.sender_email.clone(),
            recipient_id: origin.recipient_id,
            status,
            external_ref: Some(event.external_ref.clone()),
            subject: origin.subject.clone(),
            variant_tags: Vec::new(),
        },
    )
    .await?;

    Ok(WebhookDisposition::Recorded)
}

pub async fn process_voice_event(
    pool: &PgPool,
    event: &VoiceWebhookEvent,
) -> Result<WebhookDisposition, EngineError> {
    let status = match event.event.as_str() {
        "call.started" => LogStatus::CallStarted,
        "call.completed" => LogStatus::CallCompleted,
        "call.failed" => LogStatus::CallFailed,
        other => {
            return Err(EngineError::Validation(format!(
                "unknown voice event '{}'",
                other
            )))
        }
    };

    if !db::record_webhook_event(pool, &event.provider, &event.event_id).await? {
        tracing::debug!(
            provider = %event.provider,
            event_id = %event.event_id,
            "duplicate voice webhook discarded"
        );
        return Ok(WebhookDisposition::Duplicate);
    }

    let Some(origin) =
        db::find_log_by_external_ref(pool, Channel::Call.as_str(), &event.call_id).await?
    else {
        tracing::warn!(call_id = %event.call_id, "voice webhook matched no call");
        return Ok(WebhookDisposition::Unmatched);
    };

    db::insert_log(
        pool,
        &NewLogEntry {
            enrollment_id: origin.enrollment_id,
            step_index: origin.step_index,
            channel: Channel::Call,
            sender_email: origin.sender_email.clone(),
            recipient_id: origin.recipient_id,
            status,
            external_ref: Some(event.call_id.clone()),
            subject: None,
            variant_tags: Vec::new(),
        },
    )
    .await?;

    // A finished call means there is no point sitting out the rest of
    // the pre-step pause; pull the next touch forward.
    if status == LogStatus::CallCompleted {
        if let Some(enrollment_id) = origin.enrollment_id {
            advance_enrollment(pool, enrollment_id).await?;
        }
    }

    Ok(WebhookDisposition::Recorded)
}

async fn advance_enrollment(pool: &PgPool, enrollment_id: Uuid) -> Result<(), EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE enrollments
        SET due_at = NOW(), status = 'pending', version = version + 1, updated_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'waiting') AND due_at > NOW()
        "#,
    )
    .bind(enrollment_id)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        tracing::info!(enrollment = %enrollment_id, "call completed, next step pulled forward");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_payload_parses() {
        let event: EmailWebhookEvent = serde_json::from_value(serde_json::json!({
            "provider": "smtp-relay",
            "event_id": "ev-123",
            "event": "delivered",
            "external_ref": "msg-9"
        }))
        .unwrap();
        assert_eq!(event.event, "delivered");
    }

    #[test]
    fn test_voice_payload_parses() {
        let event: VoiceWebhookEvent = serde_json::from_value(serde_json::json!({
            "provider": "voicereach",
            "event_id": "ev-7",
            "event": "call.completed",
            "call_id": "c-7"
        }))
        .unwrap();
        assert_eq!(event.call_id, "c-7");
    }
}
