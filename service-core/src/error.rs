use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use once_cell::sync::OnceCell;
use serde::Serialize;
use thiserror::Error;

use crate::config::Environment;

static RESPONSE_ENVIRONMENT: OnceCell<Environment> = OnceCell::new();

/// Set the environment that decides how much detail error responses carry.
///
/// Only the first call wins. Until it is called, responses behave as in production.
pub fn set_response_environment(environment: Environment) {
    let _ = RESPONSE_ENVIRONMENT.set(environment);
}

fn response_environment() -> Environment {
    RESPONSE_ENVIRONMENT
        .get()
        .copied()
        .unwrap_or(Environment::Production)
}

/// Failure kinds callers can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    Conflict,
    DependencyFailure,
    Fatal,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::DependencyFailure => "dependency_failure",
            ErrorKind::Fatal => "fatal",
            ErrorKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    /// A concurrent writer got there first. Starting over may succeed.
    #[error("Conflict: {0}")]
    Contention(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    /// Persisted state that cannot be interpreted. Never auto-healed.
    #[error("Fatal error: {0}")]
    Fatal(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),

    #[error("Service Unavailable")]
    ServiceUnavailable,

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::ValidationError(_) | AppError::BadRequest(_) => ErrorKind::Validation,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Conflict(_) | AppError::Contention(_) => ErrorKind::Conflict,
            AppError::DatabaseError(_) | AppError::ServiceUnavailable => {
                ErrorKind::DependencyFailure
            }
            AppError::Fatal(_) => ErrorKind::Fatal,
            AppError::InternalError(_) | AppError::ConfigError(_) => ErrorKind::Internal,
        }
    }

    /// Whether the whole operation may be attempted again from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Contention(_))
    }

    /// Message safe to hand to an untrusted caller.
    pub fn public_message(&self, environment: Environment) -> String {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::Validation | ErrorKind::Conflict => self.to_string(),
            _ if environment.is_development() => self.to_string(),
            ErrorKind::DependencyFailure => "Service dependency failure".to_string(),
            ErrorKind::Fatal | ErrorKind::Internal => "Internal server error".to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(anyhow::Error::new(err))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            kind: ErrorKind,
        }

        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Validation => match self {
                AppError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::BAD_REQUEST,
            },
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::DependencyFailure => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Fatal | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind().as_str(), "Request failed");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.public_message(response_environment()),
                kind: self.kind(),
            }),
        )
            .into_response()
    }
}
