//! Application-wide error types.
//!
//! Every failure the engine can produce is one of these variants, so callers
//! (and the HTTP boundary) can branch on the failure kind instead of string
//! matching. `Gateway`, `GatewayTimeout` and `OracleTimeout` are retryable;
//! everything else requires the caller to change something first.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("illegal transition for {entity}: {from} -> {to}")]
    IllegalTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("operation not valid in current state: {0}")]
    WrongState(String),

    #[error("a vote has already been cast for this milestone")]
    AlreadyVoted,

    #[error("milestone funds have already been released")]
    AlreadyReleased,

    #[error("milestone is not open for voting")]
    MilestoneNotVotable,

    #[error("milestone has not been approved for release")]
    NotApproved,

    #[error("escrow balance is below the milestone amount: {0}")]
    InsufficientEscrow(String),

    #[error("caller is not the campaign creator")]
    NotCreator,

    #[error("voter is not a backer of this campaign")]
    NotABacker,

    #[error("oracle is not authorized to submit verdicts")]
    UnauthorizedOracle,

    #[error("caller is not authorized")]
    Unauthorized,

    #[error("contract call failed: {0}")]
    Gateway(String),

    #[error("contract call timed out after {0}s")]
    GatewayTimeout(u64),

    #[error("proof evaluation timed out after {0}s")]
    OracleTimeout(u64),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Stable machine-readable kind, included in every error response.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::IllegalTransition { .. } => "illegal_transition",
            Self::WrongState(_) => "wrong_state",
            Self::AlreadyVoted => "already_voted",
            Self::AlreadyReleased => "already_released",
            Self::MilestoneNotVotable => "milestone_not_votable",
            Self::NotApproved => "not_approved",
            Self::InsufficientEscrow(_) => "insufficient_escrow",
            Self::NotCreator => "not_creator",
            Self::NotABacker => "not_a_backer",
            Self::UnauthorizedOracle => "unauthorized_oracle",
            Self::Unauthorized => "unauthorized",
            Self::Gateway(_) => "gateway_error",
            Self::GatewayTimeout(_) => "gateway_timeout",
            Self::OracleTimeout(_) => "oracle_timeout",
            Self::Http(_) => "http_error",
            Self::Database(_) => "database_error",
            Self::Migrate(_) => "migration_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Whether a retry with unchanged input can succeed. Retries of gateway
    /// failures must reuse the idempotency key of the original attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Gateway(_) | Self::GatewayTimeout(_) | Self::OracleTimeout(_)
        )
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::IllegalTransition { .. }
            | Self::WrongState(_)
            | Self::AlreadyVoted
            | Self::AlreadyReleased
            | Self::MilestoneNotVotable
            | Self::NotApproved
            | Self::InsufficientEscrow(_) => StatusCode::CONFLICT,
            Self::NotCreator | Self::NotABacker | Self::UnauthorizedOracle | Self::Unauthorized => {
                StatusCode::FORBIDDEN
            }
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::GatewayTimeout(_) | Self::OracleTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Http(_) | Self::Database(_) | Self::Migrate(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        // Storage failures carry connection strings and SQL fragments; those
        // never cross the API boundary.
        let message = match &self {
            Self::Database(_) | Self::Migrate(_) => "internal storage error".to_string(),
            Self::Http(_) => "internal client error".to_string(),
            other => other.to_string(),
        };

        let body = serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": message,
                "retryable": self.is_retryable(),
            }
        });

        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_failures_are_retryable() {
        assert!(EngineError::Gateway("boom".into()).is_retryable());
        assert!(EngineError::GatewayTimeout(60).is_retryable());
        assert!(!EngineError::AlreadyReleased.is_retryable());
        assert!(!EngineError::Validation("bad".into()).is_retryable());
    }

    #[test]
    fn conflict_class_maps_to_409() {
        assert_eq!(
            EngineError::AlreadyVoted.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::AlreadyReleased.status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            EngineError::NotApproved.status_code(),
            StatusCode::CONFLICT
        );
    }
}
