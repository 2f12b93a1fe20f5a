use actix_web::{web, HttpResponse};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db;
use crate::error::EngineError;
use crate::models::log_entry::{Channel, LogStatus, NewLogEntry};
use crate::models::recipient::Recipient;
use crate::models::sender::Sender;
use crate::models::sequence::{SequenceSnapshot, Step};
use crate::services::channels::{
    email::EmailAdapter, ChannelAdapter, DispatchStatus, OutboundMessage,
};
use crate::services::personalizer;
use crate::services::signature;
use crate::services::step_executor::base_variables;
use crate::services::template;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/render/preview", web::post().to(render_preview))
        .route("/send/test", web::post().to(send_test));
}

#[derive(Debug, Deserialize)]
struct PreviewRequest {
    sequence_id: Uuid,
    step_index: i32,
    recipient_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct TestSendRequest {
    sequence_id: Uuid,
    step_index: i32,
    recipient_id: Uuid,
    to_email: String,
}

#[derive(Debug, Serialize)]
struct RenderedEmail {
    subject: String,
    rich_body: String,
    plain_body: String,
    /// Referenced variables the bag does not cover; these render empty.
    unknown_variables: Vec<String>,
}

/// Render a step for a recipient without AI calls or sending. The
/// generated variables come from the deterministic signal library in
/// every mode, so previews are cheap and repeatable.
async fn render_step(
    pool: &PgPool,
    sequence_id: Uuid,
    step_index: i32,
    recipient_id: Uuid,
) -> Result<(RenderedEmail, SequenceSnapshot, Sender, Recipient), EngineError> {
    let snapshot = db::load_snapshot(pool, sequence_id).await?;
    let step = snapshot
        .steps
        .get(step_index as usize)
        .ok_or(EngineError::NotFound("step"))?;

    let Step::Email {
        template_key,
        subject,
        body,
        ..
    } = step
    else {
        return Err(EngineError::Validation(
            "only email steps can be rendered as a preview".to_string(),
        ));
    };

    let sender = db::get_sender(pool, &snapshot.sender_email).await?;
    let recipient = db::get_recipient(pool, recipient_id).await?;

    let mut vars = base_variables(&recipient, &sender, &snapshot, Utc::now());
    vars.extend(personalizer::signal_based_vars(&recipient));

    let (subject_template, body_template) = match template_key {
        Some(key) => {
            let tpl = template::library(key)
                .ok_or_else(|| EngineError::Validation(format!("unknown template '{}'", key)))?;
            (tpl.subject, tpl.body)
        }
        None => (
            subject.clone().unwrap_or_default(),
            body.clone().unwrap_or_default(),
        ),
    };

    let mut unknown = template::scan_unknown(&subject_template, &vars);
    for name in template::scan_unknown(&body_template, &vars) {
        if !unknown.contains(&name) {
            unknown.push(name);
        }
    }

    let rendered_subject = template::render(&subject_template, &vars)?;
    let rendered_body = template::render(&body_template, &vars)?;
    let plain_body = signature::html_to_plain(&rendered_body);
    let (rich, plain) = signature::attach_signature(&sender, &rendered_body, &plain_body);

    Ok((
        RenderedEmail {
            subject: rendered_subject,
            rich_body: rich,
            plain_body: plain,
            unknown_variables: unknown,
        },
        snapshot,
        sender,
        recipient,
    ))
}

async fn render_preview(
    pool: web::Data<PgPool>,
    body: web::Json<PreviewRequest>,
) -> Result<HttpResponse, EngineError> {
    let (rendered, _, _, _) = render_step(
        pool.get_ref(),
        body.sequence_id,
        body.step_index,
        body.recipient_id,
    )
    .await?;
    Ok(HttpResponse::Ok().json(rendered))
}

/// Send a rendered preview to an arbitrary address. Bypasses the Rate
/// Governor entirely; the logged entry is tagged so test traffic is
/// distinguishable and never counts toward warmup.
async fn send_test(
    pool: web::Data<PgPool>,
    body: web::Json<TestSendRequest>,
) -> Result<HttpResponse, EngineError> {
    let (rendered, _snapshot, sender, recipient) = render_step(
        pool.get_ref(),
        body.sequence_id,
        body.step_index,
        body.recipient_id,
    )
    .await?;

    let message = OutboundMessage::Email {
        to_email: body.to_email.clone(),
        to_name: None,
        subject: rendered.subject.clone(),
        rich_body: rendered.rich_body.clone(),
        plain_body: rendered.plain_body.clone(),
    };

    let adapter = EmailAdapter::new();
    let outcome = adapter.dispatch(&message, &sender).await;

    let status = match outcome.status {
        DispatchStatus::Sent => LogStatus::Sent,
        DispatchStatus::TransientFailure => LogStatus::TransientFailure,
        DispatchStatus::PermanentFailure => LogStatus::PermanentFailure,
    };

    db::insert_log(
        pool.get_ref(),
        &NewLogEntry {
            enrollment_id: None,
            step_index: body.step_index,
            channel: Channel::Email,
            sender_email: sender.email.clone(),
            recipient_id: Some(recipient.id),
            status,
            external_ref: outcome.external_ref,
            subject: Some(rendered.subject.clone()),
            variant_tags: vec!["test_send".to_string()],
        },
    )
    .await?;

    match outcome.status {
        DispatchStatus::Sent => Ok(HttpResponse::Ok().json(serde_json::json!({
            "sent": true,
            "to": body.to_email
        }))),
        _ => Ok(HttpResponse::BadGateway().json(serde_json::json!({
            "sent": false,
            "detail": outcome.detail
        }))),
    }
}
