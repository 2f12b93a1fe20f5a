use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::enrollment::Enrollment;
use crate::models::log_entry::{LogEntry, NewLogEntry};
use crate::models::recipient::Recipient;
use crate::models::sender::Sender;
use crate::models::sequence::{SequenceSnapshot, Step};

const ENROLLMENT_COLUMNS: &str = "id, recipient_id, sequence_id, step_index, due_at, status, \
     attempts, version, last_error_kind, last_error_message, updated_at";

pub async fn get_sender(pool: &PgPool, email: &str) -> Result<Sender, EngineError> {
    sqlx::query_as::<_, Sender>("SELECT * FROM senders WHERE email = $1")
        .bind(email)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("sender"))
}

pub async fn get_recipient(pool: &PgPool, id: Uuid) -> Result<Recipient, EngineError> {
    sqlx::query_as::<_, Recipient>("SELECT * FROM recipients WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or(EngineError::NotFound("recipient"))
}

/// Load a sequence row together with its ordered steps.
pub async fn load_snapshot(pool: &PgPool, sequence_id: Uuid) -> Result<SequenceSnapshot, EngineError> {
    let row = sqlx::query(
        "SELECT id, campaign_id, name, sender_email FROM sequences WHERE id = $1",
    )
    .bind(sequence_id)
    .fetch_optional(pool)
    .await?
    .ok_or(EngineError::NotFound("sequence"))?;

    let step_rows: Vec<(i32, serde_json::Value)> = sqlx::query_as(
        "SELECT step_index, payload_json FROM sequence_steps WHERE sequence_id = $1 ORDER BY step_index ASC",
    )
    .bind(sequence_id)
    .fetch_all(pool)
    .await?;

    let mut steps = Vec::with_capacity(step_rows.len());
    for (index, payload) in step_rows {
        let step: Step = serde_json::from_value(payload).map_err(|e| {
            EngineError::Internal(format!("corrupt step {} in sequence {}: {}", index, sequence_id, e))
        })?;
        steps.push(step);
    }

    Ok(SequenceSnapshot {
        id: row.get("id"),
        campaign_id: row.get("campaign_id"),
        name: row.get("name"),
        sender_email: row.get("sender_email"),
        steps,
    })
}

/// Atomically claim due enrollments, flipping them to `in_flight`.
/// `FOR UPDATE SKIP LOCKED` keeps concurrent workers off the same rows;
/// the ordering makes same-due-at ties resolve by enrollment id.
pub async fn claim_due_enrollments(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Enrollment>, EngineError> {
    let query = format!(
        r#"
        WITH claimed AS (
            SELECT id FROM enrollments
            WHERE status IN ('pending', 'waiting') AND due_at <= $1
            ORDER BY due_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE enrollments
        SET status = 'in_flight', version = version + 1, updated_at = NOW()
        FROM claimed
        WHERE enrollments.id = claimed.id
        RETURNING {}
        "#,
        ENROLLMENT_COLUMNS
            .split(", ")
            .map(|c| format!("enrollments.{}", c))
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(sqlx::query_as::<_, Enrollment>(&query)
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?)
}

/// New enrollment state computed by the step executor.
#[derive(Debug, Clone)]
pub struct EnrollmentUpdate {
    pub step_index: i32,
    pub due_at: DateTime<Utc>,
    pub status: &'static str,
    pub attempts: i32,
    pub last_error: Option<(String, String)>,
}

/// Persist an execution result and its log entry in one transaction,
/// guarded by the row version taken at claim time. A failed guard means
/// another worker got there first; the caller abandons the claim.
pub async fn persist_result(
    pool: &PgPool,
    enrollment_id: Uuid,
    expected_version: i64,
    update: &EnrollmentUpdate,
    log: Option<&NewLogEntry>,
) -> Result<(), EngineError> {
    let mut tx = pool.begin().await?;

    let (error_kind, error_message) = match &update.last_error {
        Some((kind, message)) => (Some(kind.as_str()), Some(message.as_str())),
        None => (None, None),
    };

    let result = sqlx::query(
        r#"
        UPDATE enrollments
        SET step_index = $3, due_at = $4, status = $5, attempts = $6,
            last_error_kind = $7, last_error_message = $8,
            version = version + 1, updated_at = NOW()
        WHERE id = $1 AND version = $2
        "#,
    )
    .bind(enrollment_id)
    .bind(expected_version)
    .bind(update.step_index)
    .bind(update.due_at)
    .bind(update.status)
    .bind(update.attempts)
    .bind(error_kind)
    .bind(error_message)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(EngineError::ConcurrencyConflict);
    }

    if let Some(entry) = log {
        insert_log(&mut *tx, entry).await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn insert_log<'e, E>(executor: E, entry: &NewLogEntry) -> Result<Uuid, EngineError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO log_entries
            (id, enrollment_id, step_index, channel, sender_email, recipient_id,
             status, external_ref, subject, timestamp, variant_tags)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW(), $10)
        "#,
    )
    .bind(id)
    .bind(entry.enrollment_id)
    .bind(entry.step_index)
    .bind(entry.channel.as_str())
    .bind(&entry.sender_email)
    .bind(entry.recipient_id)
    .bind(entry.status.as_str())
    .bind(&entry.external_ref)
    .bind(&entry.subject)
    .bind(serde_json::to_value(&entry.variant_tags).unwrap_or_else(|_| serde_json::json!([])))
    .execute(executor)
    .await?;
    Ok(id)
}

pub async fn find_log_by_external_ref(
    pool: &PgPool,
    channel: &str,
    external_ref: &str,
) -> Result<Option<LogEntry>, EngineError> {
    Ok(sqlx::query_as::<_, LogEntry>(
        r#"
        SELECT * FROM log_entries
        WHERE channel = $1 AND external_ref = $2
        ORDER BY timestamp ASC
        LIMIT 1
        "#,
    )
    .bind(channel)
    .bind(external_ref)
    .fetch_optional(pool)
    .await?)
}

pub async fn get_enrollment(pool: &PgPool, id: Uuid) -> Result<Enrollment, EngineError> {
    sqlx::query_as::<_, Enrollment>(&format!(
        "SELECT {} FROM enrollments WHERE id = $1",
        ENROLLMENT_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(EngineError::NotFound("enrollment"))
}

/// Revert `in_flight` rows left behind by a dead worker. Attempts tick
/// up so a row that keeps dying eventually exhausts its retries.
pub async fn revert_stale_in_flight(
    pool: &PgPool,
    stale_threshold_secs: i64,
) -> Result<u64, EngineError> {
    let result = sqlx::query(
        r#"
        UPDATE enrollments
        SET status = 'pending', attempts = attempts + 1,
            version = version + 1, updated_at = NOW()
        WHERE status = 'in_flight'
          AND updated_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(stale_threshold_secs as f64)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn count_in_flight(pool: &PgPool, sequence_id: Uuid) -> Result<i64, EngineError> {
    Ok(sqlx::query_scalar(
        "SELECT COUNT(*) FROM enrollments WHERE sequence_id = $1 AND status = 'in_flight'",
    )
    .bind(sequence_id)
    .fetch_one(pool)
    .await?)
}

pub async fn status_counts(
    pool: &PgPool,
    sequence_id: Uuid,
) -> Result<Vec<(String, i64)>, EngineError> {
    Ok(sqlx::query_as(
        "SELECT status, COUNT(*) FROM enrollments WHERE sequence_id = $1 GROUP BY status",
    )
    .bind(sequence_id)
    .fetch_all(pool)
    .await?)
}

/// First insert wins; a second delivery of the same provider event is
/// the idempotent duplicate case.
pub async fn record_webhook_event(
    pool: &PgPool,
    provider: &str,
    provider_event_id: &str,
) -> Result<bool, EngineError> {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_events (provider, provider_event_id)
        VALUES ($1, $2)
        ON CONFLICT (provider, provider_event_id) DO NOTHING
        "#,
    )
    .bind(provider)
    .bind(provider_event_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}
