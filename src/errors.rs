//! The error taxonomy every component maps onto before it reaches a client.

use rocket::http::Status;
use rocket::serde::json::Json;
use thiserror::Error;

/// Errors raised anywhere in the broker. Each variant corresponds to one of
/// the error classes components are expected to report.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Invalid or missing token at handshake. Closes the connection.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Authenticated, but no permission on the target room.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Insufficient role for a requested mutation.
    #[error("operation forbidden: {0}")]
    OperationForbidden(String),

    /// Structural or semantic validation failed.
    #[error("operation invalid: {0}")]
    OperationInvalid(String),

    /// Durable commit failed due to a precondition.
    #[error("operation conflict: {0}")]
    OperationConflict(String),

    /// Unexpected error in the pipeline or fanout.
    #[error("internal fault: {0}")]
    InternalFault(String),

    /// HTTP ingress body could not be parsed.
    #[error("malformed ingress payload: {0}")]
    IngressMalformed(String),
}

impl BrokerError {
    /// HTTP status this error renders as when it surfaces at the ingress boundary.
    pub fn http_status(&self) -> Status {
        match self {
            BrokerError::AuthenticationFailed(_) => Status::Unauthorized,
            BrokerError::AccessDenied(_) => Status::Forbidden,
            BrokerError::OperationForbidden(_) => Status::Forbidden,
            BrokerError::OperationInvalid(_) => Status::BadRequest,
            BrokerError::OperationConflict(_) => Status::Conflict,
            BrokerError::InternalFault(_) => Status::InternalServerError,
            BrokerError::IngressMalformed(_) => Status::InternalServerError,
        }
    }

    /// The outbound socket event name this error maps to, for per-operation
    /// failures reported to the originating connection only.
    pub fn socket_event(&self) -> &'static str {
        match self {
            BrokerError::AuthenticationFailed(_) => "auth-error",
            BrokerError::AccessDenied(_) => "join-workspace-error",
            BrokerError::OperationForbidden(_) => "operation-forbidden",
            BrokerError::OperationInvalid(_) => "operation-error",
            BrokerError::OperationConflict(_) => "operation-failed",
            BrokerError::InternalFault(_) => "operation-failed",
            BrokerError::IngressMalformed(_) => "ingress-error",
        }
    }

    pub fn to_json(&self) -> (Status, Json<serde_json::Value>) {
        (
            self.http_status(),
            Json(serde_json::json!({"error": self.to_string()})),
        )
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(e: rusqlite::Error) -> Self {
        BrokerError::InternalFault(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::IngressMalformed(e.to_string())
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
