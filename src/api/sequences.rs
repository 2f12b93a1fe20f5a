use actix_web::{web, HttpResponse};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;
use validator::Validate;

use crate::db;
use crate::error::EngineError;
use crate::models::sequence::Step;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/sequences")
            .route("", web::post().to(create_sequence))
            .route("/{id}", web::put().to(replace_steps))
            .route("/{id}/enrollments", web::post().to(enroll_batch))
            .route("/{id}/status", web::get().to(sequence_status)),
    );
}

#[derive(Debug, Deserialize, Validate)]
struct CreateSequenceRequest {
    campaign_id: Uuid,
    #[validate(length(min = 1, max = 200))]
    name: String,
    #[validate(email)]
    sender_email: String,
    steps: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ReplaceStepsRequest {
    steps: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    recipient_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct SequenceResponse {
    id: Uuid,
    campaign_id: Uuid,
    name: String,
    sender_email: String,
    steps: Vec<Step>,
}

fn parse_steps(raw: &[serde_json::Value]) -> Result<Vec<Step>, EngineError> {
    if raw.is_empty() {
        return Err(EngineError::Validation(
            "a sequence needs at least one step".to_string(),
        ));
    }
    let mut steps = Vec::with_capacity(raw.len());
    for (index, value) in raw.iter().enumerate() {
        let step: Step = serde_json::from_value(value.clone())
            .map_err(|e| EngineError::Validation(format!("step {}: {}", index, e)))?;
        step.validate()
            .map_err(|e| EngineError::Validation(format!("step {}: {}", index, e)))?;
        steps.push(step);
    }
    Ok(steps)
}

async fn insert_steps(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    sequence_id: Uuid,
    steps: &[Step],
) -> Result<(), EngineError> {
    for (index, step) in steps.iter().enumerate() {
        sqlx::query(
            "INSERT INTO sequence_steps (sequence_id, step_index, kind, payload_json) VALUES ($1, $2, $3, $4)",
        )
        .bind(sequence_id)
        .bind(index as i32)
        .bind(step.kind_str())
        .bind(serde_json::to_value(step).map_err(|e| EngineError::Internal(e.to_string()))?)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn create_sequence(
    pool: web::Data<PgPool>,
    body: web::Json<CreateSequenceRequest>,
) -> Result<HttpResponse, EngineError> {
    body.validate()
        .map_err(|e| EngineError::Validation(e.to_string()))?;
    let steps = parse_steps(&body.steps)?;

    // The sender must exist; a sequence without one can never send.
    db::get_sender(pool.get_ref(), &body.sender_email).await?;

    let sequence_id = Uuid::new_v4();
    let mut tx = pool.get_ref().begin().await?;
    sqlx::query(
        "INSERT INTO sequences (id, campaign_id, name, sender_email, created_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(sequence_id)
    .bind(body.campaign_id)
    .bind(&body.name)
    .bind(&body.sender_email)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    insert_steps(&mut tx, sequence_id, &steps).await?;
    tx.commit().await?;

    Ok(HttpResponse::Created().json(SequenceResponse {
        id: sequence_id,
        campaign_id: body.campaign_id,
        name: body.name.clone(),
        sender_email: body.sender_email.clone(),
        steps,
    }))
}

async fn replace_steps(
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
    body: web::Json<ReplaceStepsRequest>,
) -> Result<HttpResponse, EngineError> {
    let sequence_id = path.into_inner();
    let steps = parse_steps(&body.steps)?;

    // Replacing steps under an enrollment that is mid-dispatch would
    // invalidate its snapshot.
    let in_flight = db::count_in_flight(pool.get_ref(), sequence_id).await?;
    if in_flight > 0 {
        return Err(EngineError::Conflict(format!(
            "sequence has {} in-flight enrollments",
            in_flight
        )));
    }

    let mut tx = pool.get_ref().begin().await?;
    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sequences WHERE id = $1")
        .bind(sequence_id)
        .fetch_one(&mut *tx)
        .await?;
    if exists == 0 {
        return Err(EngineError::NotFound("sequence"));
    }
    sqlx::query("DELETE FROM sequence_steps WHERE sequence_id = $1")
        .bind(sequence_id)
        .execute(&mut *tx)
        .await?;
    insert_steps(&mut tx, sequence_id, &steps).await?;
    tx.commit().await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "id": sequence_id,
        "steps": steps.len()
    })))
}

async fn enroll_batch(
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
    body: web::Json<EnrollRequest>,
) -> Result<HttpResponse, EngineError> {
    let sequence_id = path.into_inner();
    if body.recipient_ids.is_empty() {
        return Err(EngineError::Validation("recipient_ids is empty".to_string()));
    }

    let snapshot = db::load_snapshot(pool.get_ref(), sequence_id).await?;
    let first_delay = snapshot
        .steps
        .first()
        .map(Step::pre_delay_days)
        .ok_or_else(|| EngineError::Validation("sequence has no steps".to_string()))?;
    let due_at = Utc::now() + Duration::days(first_delay);

    let mut created = 0u64;
    for recipient_id in &body.recipient_ids {
        // The partial unique index swallows re-enrollments of anyone
        // who is still live in this sequence.
        let result = sqlx::query(
            r#"
            INSERT INTO enrollments (id, recipient_id, sequence_id, step_index, due_at, status)
            SELECT $1, r.id, $2, 0, $3, 'pending'
            FROM recipients r WHERE r.id = $4
            ON CONFLICT (recipient_id, sequence_id)
                WHERE status IN ('pending', 'in_flight', 'waiting')
                DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(sequence_id)
        .bind(due_at)
        .bind(recipient_id)
        .execute(pool.get_ref())
        .await?;
        created += result.rows_affected();
    }

    Ok(HttpResponse::Created().json(serde_json::json!({
        "sequence_id": sequence_id,
        "created": created
    })))
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct FailureRow {
    id: Uuid,
    recipient_id: Uuid,
    last_error_kind: Option<String>,
    last_error_message: Option<String>,
}

async fn sequence_status(
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, EngineError> {
    let sequence_id = path.into_inner();
    db::load_snapshot(pool.get_ref(), sequence_id).await?;

    let counts = db::status_counts(pool.get_ref(), sequence_id).await?;
    let mut by_status = serde_json::Map::new();
    for (status, count) in counts {
        by_status.insert(status, serde_json::json!(count));
    }

    let failures = sqlx::query_as::<_, FailureRow>(
        r#"
        SELECT id, recipient_id, last_error_kind, last_error_message
        FROM enrollments
        WHERE sequence_id = $1 AND status = 'failed'
        ORDER BY updated_at DESC
        LIMIT 50
        "#,
    )
    .bind(sequence_id)
    .fetch_all(pool.get_ref())
    .await?;

    Ok(HttpResponse::Ok().json(serde_json::json!({
        "sequence_id": sequence_id,
        "counts": by_status,
        "failures": failures
    })))
}
