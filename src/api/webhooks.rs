use actix_web::{web, HttpResponse};
use sqlx::PgPool;

use crate::error::EngineError;
use crate::services::event_log::{
    self, EmailWebhookEvent, VoiceWebhookEvent, WebhookDisposition,
};

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/webhooks")
            .route("/email", web::post().to(email_webhook))
            .route("/voice", web::post().to(voice_webhook)),
    );
}

fn disposition_response(disposition: WebhookDisposition) -> HttpResponse {
    let label = match disposition {
        WebhookDisposition::Recorded => "recorded",
        WebhookDisposition::Duplicate => "duplicate",
        WebhookDisposition::Unmatched => "unmatched",
    };
    // Duplicates are accepted quietly; providers retry on anything else.
    HttpResponse::Ok().json(serde_json::json!({ "status": label }))
}

async fn email_webhook(
    pool: web::Data<PgPool>,
    body: web::Json<EmailWebhookEvent>,
) -> Result<HttpResponse, EngineError> {
    let disposition = event_log::process_email_event(pool.get_ref(), &body).await?;
    Ok(disposition_response(disposition))
}

async fn voice_webhook(
    pool: web::Data<PgPool>,
    body: web::Json<VoiceWebhookEvent>,
) -> Result<HttpResponse, EngineError> {
    let disposition = event_log::process_voice_event(pool.get_ref(), &body).await?;
    Ok(disposition_response(disposition))
}
