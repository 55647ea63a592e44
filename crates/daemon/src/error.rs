//! Error taxonomy for the broker.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::ErrorBody;

use crate::db::StoreError;
use crate::notify::NotifyError;
use crate::platform::PlatformError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("no free port in range {min}-{max}")]
    ResourceExhausted { min: u16, max: u16 },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    #[error("orchestration platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("remote notification failed: {0}")]
    Notify(#[from] NotifyError),

    #[error("key generation failed: {0}")]
    KeyGen(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceExhausted,
    PermissionDenied,
    PreconditionFailed,
    InvalidRequest,
    ExternalSystem,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ResourceExhausted => "ResourceExhausted",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::PreconditionFailed => "PreconditionFailed",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::ExternalSystem => "ExternalSystemError",
        }
    }
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            BrokerError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            BrokerError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            BrokerError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BrokerError::Store(_)
            | BrokerError::Platform(_)
            | BrokerError::Notify(_)
            | BrokerError::KeyGen(_) => ErrorKind::ExternalSystem,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::ResourceExhausted => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorKind::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorKind::ExternalSystem => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            kind: self.kind().as_str().to_string(),
            message: self.to_string(),
        };
        (self.status_code(), Json(body)).into_response()
    }
}
