use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Call,
    NetworkConnect,
    NetworkMessage,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Call => "call",
            Channel::NetworkConnect => "network_connect",
            Channel::NetworkMessage => "network_message",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome recorded on a log entry. Attempt outcomes come from the
/// executor; the rest arrive later through the webhook ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Sent,
    TransientFailure,
    PermanentFailure,
    Delivered,
    Opened,
    Bounced,
    Replied,
    CallStarted,
    CallCompleted,
    CallFailed,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Sent => "sent",
            LogStatus::TransientFailure => "transient_failure",
            LogStatus::PermanentFailure => "permanent_failure",
            LogStatus::Delivered => "delivered",
            LogStatus::Opened => "opened",
            LogStatus::Bounced => "bounced",
            LogStatus::Replied => "replied",
            LogStatus::CallStarted => "call_started",
            LogStatus::CallCompleted => "call_completed",
            LogStatus::CallFailed => "call_failed",
        }
    }
}

/// A log row about to be appended.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub enrollment_id: Option<Uuid>,
    pub step_index: i32,
    pub channel: Channel,
    pub sender_email: String,
    pub recipient_id: Option<Uuid>,
    pub status: LogStatus,
    pub external_ref: Option<String>,
    pub subject: Option<String>,
    pub variant_tags: Vec<String>,
}

/// Immutable attempt/event record. Rows are inserted once and never
/// updated; webhook events link back through `external_ref`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LogEntry {
    pub id: Uuid,
    pub enrollment_id: Option<Uuid>,
    pub step_index: i32,
    pub channel: String,
    pub sender_email: String,
    pub recipient_id: Option<Uuid>,
    pub status: String,
    pub external_ref: Option<String>,
    pub subject: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub variant_tags: serde_json::Value,
}
