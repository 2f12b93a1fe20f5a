use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use thiserror::Error;

/// Error taxonomy for the sequence engine.
///
/// Rate-limit denials are deliberately absent: a denied slot is a
/// scheduling directive (`SlotDecision::Denied`), not a failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("unclosed '{{{{' in template: {0}")]
    TemplateSyntax(String),

    #[error("transient channel failure: {0}")]
    TransientChannel(String),

    #[error("permanent channel failure: {0}")]
    PermanentChannel(String),

    /// Optimistic-guard failure; the worker abandons the claim silently.
    #[error("enrollment was modified concurrently")]
    ConcurrencyConflict,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation_error",
            EngineError::TemplateSyntax(_) => "template_syntax_error",
            EngineError::TransientChannel(_) => "transient_channel_failure",
            EngineError::PermanentChannel(_) => "permanent_channel_failure",
            EngineError::ConcurrencyConflict => "concurrency_conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::Database(_) => "database_error",
            EngineError::Internal(_) => "internal_error",
        }
    }
}

impl ResponseError for EngineError {
    fn status_code(&self) -> StatusCode {
        match self {
            EngineError::Validation(_) | EngineError::TemplateSyntax(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) | EngineError::ConcurrencyConflict => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(EngineError::Validation("bad".into()).kind(), "validation_error");
        assert_eq!(EngineError::ConcurrencyConflict.kind(), "concurrency_conflict");
        assert_eq!(
            EngineError::TemplateSyntax("line 3".into()).kind(),
            "template_syntax_error"
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            EngineError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(EngineError::NotFound("sequence").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            EngineError::Conflict("sequence has in-flight enrollments".into()).status_code(),
            StatusCode::CONFLICT
        );
    }
}
