use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;

use crate::models::sender::Sender;
use crate::services::channels::{ChannelAdapter, DispatchOutcome, OutboundMessage};
use crate::services::encryption::EncryptionService;

const SEND_DEADLINE: Duration = Duration::from_secs(30);

/// SMTP adapter. One attempt per dispatch; retry is the scheduler's call.
pub struct EmailAdapter;

impl EmailAdapter {
    pub fn new() -> Self {
        Self
    }

    fn smtp_password(&self, sender: &Sender) -> Result<String, String> {
        let encrypted = sender
            .smtp_password_encrypted
            .as_ref()
            .ok_or("no SMTP password configured")?;
        let service = EncryptionService::new().map_err(|e| e.to_string())?;
        service.decrypt(encrypted)
    }
}

impl Default for EmailAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelAdapter for EmailAdapter {
    async fn dispatch(&self, message: &OutboundMessage, sender: &Sender) -> DispatchOutcome {
        let OutboundMessage::Email {
            to_email,
            to_name,
            subject,
            rich_body,
            plain_body,
        } = message
        else {
            return DispatchOutcome::permanent("email adapter received a non-email payload");
        };

        let from = format!("{} <{}>", sender.name, sender.email);
        let to = match to_name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, to_email),
            _ => to_email.clone(),
        };

        let from_mailbox = match from.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => return DispatchOutcome::permanent(format!("invalid from address: {}", e)),
        };
        let to_mailbox = match to.parse() {
            Ok(mailbox) => mailbox,
            Err(e) => return DispatchOutcome::permanent(format!("invalid to address: {}", e)),
        };

        let email = match Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(subject)
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(rich_body.clone()),
                    ),
            ) {
            Ok(email) => email,
            Err(e) => return DispatchOutcome::permanent(format!("failed to build email: {}", e)),
        };

        let password = match self.smtp_password(sender) {
            Ok(password) => password,
            Err(e) => return DispatchOutcome::permanent(format!("smtp credentials: {}", e)),
        };

        let mailer: AsyncSmtpTransport<Tokio1Executor> =
            match AsyncSmtpTransport::<Tokio1Executor>::relay(&sender.smtp_host) {
                Ok(builder) => builder
                    .credentials(Credentials::new(sender.smtp_username.clone(), password))
                    .port(sender.smtp_port as u16)
                    .build(),
                Err(e) => {
                    return DispatchOutcome::transient(format!("failed to create transport: {}", e))
                }
            };

        match tokio::time::timeout(SEND_DEADLINE, mailer.send(email)).await {
            Ok(Ok(response)) => {
                let message_id = response.message().collect::<Vec<_>>().join("");
                let external_ref = if message_id.is_empty() {
                    None
                } else {
                    Some(message_id)
                };
                DispatchOutcome::sent(external_ref)
            }
            Ok(Err(e)) => {
                if e.is_permanent() {
                    DispatchOutcome::permanent(format!("SMTP rejected: {}", e))
                } else {
                    DispatchOutcome::transient(format!("SMTP error: {}", e))
                }
            }
            Err(_) => DispatchOutcome::transient("SMTP send timed out"),
        }
    }
}
