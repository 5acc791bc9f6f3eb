use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Error surface for everything below the HTTP layer. Every lifecycle,
/// selector, arbiter, and config function returns `Result<T, SupervisorError>`
/// rather than panicking or bubbling up an opaque boxed error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    #[error("configuration is invalid: {0}")]
    ConfigInvalid(String),

    #[error("unknown model alias: {0}")]
    UnknownAlias(String),

    #[error("no hardware variant matches the online device set")]
    NoSuitableVariant,

    #[error("insufficient device memory")]
    InsufficientResources,

    #[error("startup lock timeout")]
    StartupLockTimeout,

    #[error("health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("health check timed out")]
    HealthCheckTimeout,

    #[error("failed to start process: {0}")]
    ProcessSpawnFailed(String),

    #[error("{0}")]
    ModeMismatch(String),

    #[error("request body must contain a 'model' field")]
    MissingModelField,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SupervisorError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SupervisorError::MissingModelField | SupervisorError::ModeMismatch(_) => {
                StatusCode::BAD_REQUEST
            }
            SupervisorError::UnknownAlias(_) | SupervisorError::ConfigInvalid(_) => {
                StatusCode::NOT_FOUND
            }
            SupervisorError::ConfigNotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::NoSuitableVariant
            | SupervisorError::InsufficientResources
            | SupervisorError::StartupLockTimeout
            | SupervisorError::HealthCheckFailed(_)
            | SupervisorError::HealthCheckTimeout => StatusCode::SERVICE_UNAVAILABLE,
            SupervisorError::ProcessSpawnFailed(_) | SupervisorError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            SupervisorError::ConfigNotFound(_) => "CONFIG_NOT_FOUND",
            SupervisorError::ConfigInvalid(_) => "CONFIG_INVALID",
            SupervisorError::UnknownAlias(_) => "UNKNOWN_ALIAS",
            SupervisorError::NoSuitableVariant => "NO_SUITABLE_VARIANT",
            SupervisorError::InsufficientResources => "INSUFFICIENT_RESOURCES",
            SupervisorError::StartupLockTimeout => "STARTUP_LOCK_TIMEOUT",
            SupervisorError::HealthCheckFailed(_) => "HEALTH_CHECK_FAILED",
            SupervisorError::HealthCheckTimeout => "HEALTH_CHECK_TIMEOUT",
            SupervisorError::ProcessSpawnFailed(_) => "PROCESS_SPAWN_FAILED",
            SupervisorError::ModeMismatch(_) => "MODE_MISMATCH",
            SupervisorError::MissingModelField => "MISSING_MODEL_FIELD",
            SupervisorError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_code: &'static str,
}

impl IntoResponse for SupervisorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
            error_code: self.error_code(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
