pub mod email;
pub mod network;
pub mod voice;

use async_trait::async_trait;

use crate::models::log_entry::Channel;
use crate::models::sender::Sender;

/// Channel-specific payload resolved by the step executor.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Email {
        to_email: String,
        to_name: Option<String>,
        subject: String,
        rich_body: String,
        plain_body: String,
    },
    Call {
        to_phone: String,
        script: String,
    },
    NetworkConnect {
        profile_url: String,
        message: String,
    },
    NetworkMessage {
        profile_url: String,
        message: String,
    },
}

impl OutboundMessage {
    pub fn channel(&self) -> Channel {
        match self {
            OutboundMessage::Email { .. } => Channel::Email,
            OutboundMessage::Call { .. } => Channel::Call,
            OutboundMessage::NetworkConnect { .. } => Channel::NetworkConnect,
            OutboundMessage::NetworkMessage { .. } => Channel::NetworkMessage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent,
    TransientFailure,
    PermanentFailure,
}

/// Terminal report of one dispatch attempt. Adapters classify provider
/// responses; retry policy belongs to the scheduler, never to adapters.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub external_ref: Option<String>,
    pub detail: Option<String>,
}

impl DispatchOutcome {
    pub fn sent(external_ref: Option<String>) -> Self {
        Self {
            status: DispatchStatus::Sent,
            external_ref,
            detail: None,
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::TransientFailure,
            external_ref: None,
            detail: Some(detail.into()),
        }
    }

    pub fn permanent(detail: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::PermanentFailure,
            external_ref: None,
            detail: Some(detail.into()),
        }
    }
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    async fn dispatch(&self, message: &OutboundMessage, sender: &Sender) -> DispatchOutcome;
}

/// Map a provider HTTP status to a dispatch status. Accept codes count
/// as sent even with an empty body (a bare 202 means "queued"); 408 and
/// 429 are retryable, other 4xx are not, 5xx always are.
pub fn classify_http_status(status: u16) -> DispatchStatus {
    match status {
        200..=299 => DispatchStatus::Sent,
        408 | 429 => DispatchStatus::TransientFailure,
        400..=499 => DispatchStatus::PermanentFailure,
        _ => DispatchStatus::TransientFailure,
    }
}

/// The four adapters behind one lookup, owned by the worker.
pub struct ChannelSet {
    pub email: email::EmailAdapter,
    pub voice: voice::VoiceAdapter,
    pub network: network::NetworkAdapter,
}

impl ChannelSet {
    pub fn adapter_for(&self, channel: Channel) -> &dyn ChannelAdapter {
        match channel {
            Channel::Email => &self.email,
            Channel::Call => &self.voice,
            Channel::NetworkConnect | Channel::NetworkMessage => &self.network,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_status() {
        assert_eq!(classify_http_status(200), DispatchStatus::Sent);
        // Ambiguous empty-body 202: the provider's accept semantics are
        // "queued", so it counts as sent.
        assert_eq!(classify_http_status(202), DispatchStatus::Sent);
        assert_eq!(classify_http_status(429), DispatchStatus::TransientFailure);
        assert_eq!(classify_http_status(408), DispatchStatus::TransientFailure);
        assert_eq!(classify_http_status(400), DispatchStatus::PermanentFailure);
        assert_eq!(classify_http_status(403), DispatchStatus::PermanentFailure);
        assert_eq!(classify_http_status(500), DispatchStatus::TransientFailure);
        assert_eq!(classify_http_status(503), DispatchStatus::TransientFailure);
    }
}
