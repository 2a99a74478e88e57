use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;
use thiserror::Error;

use crate::flags::flag_models::{FlagId, RuleId, RuleType};
use crate::store::StoreError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum FlagError {
    #[error("Flag not found: {0}")]
    FlagNotFound(String),
    #[error("Rule not found: {0}")]
    RuleNotFound(RuleId),
    #[error("Flag with name '{0}' already exists")]
    DuplicateFlag(String),
    #[error("Rule {rule_type} = {value} already exists on flag {flag_id}")]
    DuplicateRule {
        flag_id: FlagId,
        rule_type: RuleType,
        value: String,
    },
    #[error("Rollout percentage must be between 0 and 100, got {0}")]
    InvalidRolloutPercentage(i32),
    #[error("Invalid flag name: {0}")]
    InvalidFlagName(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Analytics window must be between 1 and 8784 hours, got {0}")]
    InvalidAnalyticsWindow(i64),
    #[error("failed to decode request: {0}")]
    RequestDecodingError(String),
    #[error("failed to parse request: {0}")]
    RequestParsingError(#[from] serde_json::Error),
    #[error("No user_id in request")]
    MissingSubjectId,
    #[error("Database unavailable")]
    DatabaseUnavailable,
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Timed out loading flags from the database")]
    TimeoutError,
}

impl FlagError {
    fn error_metadata(&self) -> (&'static str, StatusCode) {
        match self {
            FlagError::FlagNotFound(_) => ("flag_not_found", StatusCode::NOT_FOUND),
            FlagError::RuleNotFound(_) => ("rule_not_found", StatusCode::NOT_FOUND),

            FlagError::DuplicateFlag(_) => ("duplicate_flag", StatusCode::CONFLICT),
            FlagError::DuplicateRule { .. } => ("duplicate_rule", StatusCode::CONFLICT),

            FlagError::InvalidRolloutPercentage(_) => {
                ("invalid_rollout_percentage", StatusCode::BAD_REQUEST)
            }
            FlagError::InvalidFlagName(_) => ("invalid_flag_name", StatusCode::BAD_REQUEST),
            FlagError::BadRequest(_) => ("bad_request", StatusCode::BAD_REQUEST),
            FlagError::InvalidAnalyticsWindow(_) => {
                ("invalid_analytics_window", StatusCode::BAD_REQUEST)
            }
            FlagError::RequestDecodingError(_) => ("request_decoding_error", StatusCode::BAD_REQUEST),
            FlagError::RequestParsingError(_) => ("request_parsing_error", StatusCode::BAD_REQUEST),
            FlagError::MissingSubjectId => ("missing_user_id", StatusCode::BAD_REQUEST),

            FlagError::DatabaseError(_) => ("database_error", StatusCode::INTERNAL_SERVER_ERROR),

            FlagError::DatabaseUnavailable => {
                ("database_unavailable", StatusCode::SERVICE_UNAVAILABLE)
            }
            FlagError::TimeoutError => ("timeout", StatusCode::SERVICE_UNAVAILABLE),
        }
    }

    /// Short error code, also used as a metric label.
    pub fn error_code(&self) -> &'static str {
        self.error_metadata().0
    }

    pub fn status_code(&self) -> StatusCode {
        self.error_metadata().1
    }

    /// Whether the caller can expect a retry to succeed.
    pub fn is_retryable(&self) -> bool {
        self.status_code() == StatusCode::SERVICE_UNAVAILABLE
    }
}

impl IntoResponse for FlagError {
    fn into_response(self) -> Response {
        let (code, status) = self.error_metadata();
        let message = match &self {
            FlagError::DatabaseError(_) => {
                tracing::error!("Internal server error: {}", self);
                "An internal server error occurred. Please try again later.".to_string()
            }
            FlagError::DatabaseUnavailable | FlagError::TimeoutError => {
                tracing::warn!("Flag store unavailable: {}", self);
                "The flag store is temporarily unavailable. Please try again later.".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                success: false,
                error: code,
                message,
            }),
        )
            .into_response()
    }
}

impl From<StoreError> for FlagError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => {
                tracing::warn!("Flag store unavailable: {}", msg);
                FlagError::DatabaseUnavailable
            }
            StoreError::UniqueViolation(constraint) => {
                FlagError::DatabaseError(format!("unique constraint violated: {constraint}"))
            }
            StoreError::DataParsing(msg) => FlagError::DatabaseError(msg),
            StoreError::Database(e) => FlagError::DatabaseError(e.to_string()),
        }
    }
}
