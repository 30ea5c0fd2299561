use axum::http::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;
use crate::registry::RegistryError;
use crate::snapshot::SnapshotError;
use crate::views::ViewError;

/// ServiceError
///
/// Every way a request can terminate unsuccessfully. The dispatcher turns each variant into
/// its status code; handlers return them with `?`.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No registered route matches any prefix of the path.
    #[error("no route matches the requested path")]
    NotFound,
    /// The path resolved, but nothing is registered for the request method.
    #[error("method not allowed on this path")]
    MethodNotAllowed,
    /// Missing required parameter or a handler-level validation failure.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// No proven credential, or a credential header that matched no account.
    #[error("authentication required")]
    Unauthenticated,
    /// A proven credential whose level is below what the route requires.
    #[error("insufficient authentication level")]
    Forbidden,
    /// The request body exceeds what the transport buffers.
    #[error("request body too large")]
    PayloadTooLarge,
    /// Serialization or storage failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        ServiceError::BadRequest(reason.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden => StatusCode::FORBIDDEN,
            ServiceError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message a client may see. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            ServiceError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ViewError> for ServiceError {
    fn from(err: ViewError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<SnapshotError> for ServiceError {
    fn from(err: SnapshotError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

impl From<bcrypt::BcryptError> for ServiceError {
    fn from(err: bcrypt::BcryptError) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

pub type ServiceResult<T = ()> = Result<T, ServiceError>;

/// StartupError
///
/// Anything that stops the service from coming up or from saving its state on the way down.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("could not hash the bootstrap admin password: {0}")]
    Bootstrap(#[from] bcrypt::BcryptError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
}
