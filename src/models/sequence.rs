use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::log_entry::Channel;

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Sequence {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub name: String,
    pub sender_email: String,
    pub created_at: DateTime<Utc>,
}

/// A sequence row together with its ordered steps, loaded in one shot.
/// Executors work against the snapshot taken when the enrollment comes due.
#[derive(Debug, Clone)]
pub struct SequenceSnapshot {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub name: String,
    pub sender_email: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonalizationMode {
    SignalBased,
    FullyPersonalized,
    OpenerOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Email {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        personalization_mode: PersonalizationMode,
        #[serde(default)]
        delay_days: i64,
    },
    Wait {
        delay_days: i64,
    },
    Call {
        script: String,
        #[serde(default)]
        delay_days: i64,
    },
    NetworkConnect {
        message: String,
        #[serde(default)]
        delay_days: i64,
    },
    NetworkMessage {
        message: String,
        #[serde(default)]
        delay_days: i64,
    },
}

impl Step {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Step::Email { .. } => "email",
            Step::Wait { .. } => "wait",
            Step::Call { .. } => "call",
            Step::NetworkConnect { .. } => "network_connect",
            Step::NetworkMessage { .. } => "network_message",
        }
    }

    /// Pre-step pause in days. For `wait` this is the wait itself.
    pub fn delay_days(&self) -> i64 {
        match self {
            Step::Email { delay_days, .. }
            | Step::Wait { delay_days }
            | Step::Call { delay_days, .. }
            | Step::NetworkConnect { delay_days, .. }
            | Step::NetworkMessage { delay_days, .. } => *delay_days,
        }
    }

    /// Pause applied before this step runs, when a previous step hands
    /// over to it. A wait step's delay is not a pre-pause; it is applied
    /// when the wait itself executes.
    pub fn pre_delay_days(&self) -> i64 {
        match self {
            Step::Wait { .. } => 0,
            other => other.delay_days(),
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        match self {
            Step::Email { .. } => Some(Channel::Email),
            Step::Wait { .. } => None,
            Step::Call { .. } => Some(Channel::Call),
            Step::NetworkConnect { .. } => Some(Channel::NetworkConnect),
            Step::NetworkMessage { .. } => Some(Channel::NetworkMessage),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.delay_days() < 0 {
            return Err(EngineError::Validation("delay_days must be >= 0".to_string()));
        }
        if let Step::Email {
            template_key, body, ..
        } = self
        {
            if template_key.is_none() && body.is_none() {
                return Err(EngineError::Validation(
                    "email step needs a template_key or an inline body".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_json_tagging() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "kind": "email",
            "subject": "Hi {{first_name}}",
            "body": "Quick note",
            "personalization_mode": "signal_based"
        }))
        .unwrap();
        assert_eq!(step.kind_str(), "email");
        assert_eq!(step.delay_days(), 0);

        let wait: Step = serde_json::from_value(serde_json::json!({
            "kind": "wait",
            "delay_days": 3
        }))
        .unwrap();
        assert_eq!(wait.delay_days(), 3);
        assert!(wait.channel().is_none());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let result: Result<Step, _> = serde_json::from_value(serde_json::json!({
            "kind": "carrier_pigeon",
            "message": "coo"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_wait_delay_is_not_a_pre_pause() {
        let wait = Step::Wait { delay_days: 3 };
        assert_eq!(wait.delay_days(), 3);
        assert_eq!(wait.pre_delay_days(), 0);

        let call = Step::Call {
            script: "Hi {{first_name}}".into(),
            delay_days: 2,
        };
        assert_eq!(call.pre_delay_days(), 2);
    }

    #[test]
    fn test_negative_delay_rejected() {
        let step = Step::Wait { delay_days: -1 };
        assert!(step.validate().is_err());
    }

    #[test]
    fn test_email_needs_content() {
        let step = Step::Email {
            template_key: None,
            subject: Some("s".into()),
            body: None,
            personalization_mode: PersonalizationMode::SignalBased,
            delay_days: 0,
        };
        assert!(step.validate().is_err());
    }
}
