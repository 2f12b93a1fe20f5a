use actix_web::{web, HttpResponse};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::EngineError;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/enrollments").route("/{id}/retry", web::post().to(retry_enrollment)),
    );
}

/// Manual reset of a failed enrollment: attempts cleared, due now. The
/// step index stays where it was, so the failed step runs again.
async fn retry_enrollment(
    pool: web::Data<PgPool>,
    path: web::Path<Uuid>,
) -> Result<HttpResponse, EngineError> {
    let enrollment_id = path.into_inner();
    let result = sqlx::query(
        r#"
        UPDATE enrollments
        SET status = 'pending', attempts = 0, due_at = NOW(),
            last_error_kind = NULL, last_error_message = NULL,
            version = version + 1, updated_at = NOW()
        WHERE id = $1 AND status = 'failed'
        "#,
    )
    .bind(enrollment_id)
    .execute(pool.get_ref())
    .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::Conflict(
            "enrollment not found or not in a failed state".to_string(),
        ));
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "id": enrollment_id,
        "status": "pending"
    })))
}
