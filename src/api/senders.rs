use actix_web::{web, HttpResponse};
use sqlx::PgPool;

use crate::error::EngineError;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/senders")
            .route("/{email}/hold", web::post().to(hold_sender))
            .route("/{email}/hold", web::delete().to(release_sender)),
    );
}

async fn set_hold(pool: &PgPool, email: &str, on_hold: bool) -> Result<HttpResponse, EngineError> {
    let result = sqlx::query("UPDATE senders SET on_hold = $1 WHERE email = $2")
        .bind(on_hold)
        .bind(email)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(EngineError::NotFound("sender"));
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "email": email,
        "on_hold": on_hold
    })))
}

async fn hold_sender(
    pool: web::Data<PgPool>,
    path: web::Path<String>,
) -> Result<HttpResponse, EngineError> {
    set_hold(pool.get_ref(), &path.into_inner(), true).await
}

async fn release_sender(
    pool: web::Data<PgPool>,
    path: web::Path<String>,
) -> Result<HttpResponse, EngineError> {
    set_hold(pool.get_ref(), &path.into_inner(), false).await
}
