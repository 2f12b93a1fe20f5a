use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Enrollment {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub sequence_id: Uuid,
    pub step_index: i32,
    pub due_at: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
    pub version: i64,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    InFlight,
    Waiting,
    Completed,
    Paused,
    Failed,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Pending => "pending",
            EnrollmentStatus::InFlight => "in_flight",
            EnrollmentStatus::Waiting => "waiting",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Failed => "failed",
        }
    }

    /// Live enrollments still occupy the (recipient, sequence) slot.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Pending | EnrollmentStatus::InFlight | EnrollmentStatus::Waiting
        )
    }
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_statuses() {
        assert!(EnrollmentStatus::Pending.is_live());
        assert!(EnrollmentStatus::InFlight.is_live());
        assert!(EnrollmentStatus::Waiting.is_live());
        assert!(!EnrollmentStatus::Completed.is_live());
        assert!(!EnrollmentStatus::Paused.is_live());
        assert!(!EnrollmentStatus::Failed.is_live());
    }
}
