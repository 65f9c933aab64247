//! Error handling types for dapwire.
//!
//! Two families live here:
//! - [`WireError`]: transport and engine failures (I/O, fatal protocol
//!   mismatch, duplicate correlation ids).
//! - [`RpcError`]: the typed protocol error taxonomy that is carried inside
//!   error responses and resolved pending calls.

use std::fmt;
use std::sync::PoisonError;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::RequestId;

/// Wire error codes understood by the taxonomy.
pub struct ErrorCodes;

impl ErrorCodes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMETERS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Call arrived before the lifecycle-init handshake.
    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
    pub const UNKNOWN_ERROR: i32 = -32001;
    pub const REQUEST_CANCELLED: i32 = -32800;
    /// Unit was superseded by a newer one for the same method.
    pub const CONTENT_MODIFIED: i32 = -32801;
}

/// Semantic kind of a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ParseFault,
    InvalidRequest,
    MethodNotFound,
    InvalidParameters,
    InternalError,
    ServerNotInitialized,
    RequestCancelled,
    ContentModified,
    UnknownError,
}

impl ErrorKind {
    /// Map a wire code to its kind. Unrecognized codes return `None` so the
    /// caller can consult the host customizer before falling back.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            ErrorCodes::PARSE_ERROR => Some(Self::ParseFault),
            ErrorCodes::INVALID_REQUEST => Some(Self::InvalidRequest),
            ErrorCodes::METHOD_NOT_FOUND => Some(Self::MethodNotFound),
            ErrorCodes::INVALID_PARAMETERS => Some(Self::InvalidParameters),
            ErrorCodes::INTERNAL_ERROR => Some(Self::InternalError),
            ErrorCodes::SERVER_NOT_INITIALIZED => Some(Self::ServerNotInitialized),
            ErrorCodes::REQUEST_CANCELLED => Some(Self::RequestCancelled),
            ErrorCodes::CONTENT_MODIFIED => Some(Self::ContentModified),
            ErrorCodes::UNKNOWN_ERROR => Some(Self::UnknownError),
            _ => None,
        }
    }

    /// Canonical wire code for this kind.
    pub fn code(self) -> i32 {
        match self {
            Self::ParseFault => ErrorCodes::PARSE_ERROR,
            Self::InvalidRequest => ErrorCodes::INVALID_REQUEST,
            Self::MethodNotFound => ErrorCodes::METHOD_NOT_FOUND,
            Self::InvalidParameters => ErrorCodes::INVALID_PARAMETERS,
            Self::InternalError => ErrorCodes::INTERNAL_ERROR,
            Self::ServerNotInitialized => ErrorCodes::SERVER_NOT_INITIALIZED,
            Self::RequestCancelled => ErrorCodes::REQUEST_CANCELLED,
            Self::ContentModified => ErrorCodes::CONTENT_MODIFIED,
            Self::UnknownError => ErrorCodes::UNKNOWN_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ParseFault => "parse error",
            Self::InvalidRequest => "invalid request",
            Self::MethodNotFound => "method not found",
            Self::InvalidParameters => "invalid parameters",
            Self::InternalError => "internal error",
            Self::ServerNotInitialized => "server not initialized",
            Self::RequestCancelled => "request cancelled",
            Self::ContentModified => "content modified",
            Self::UnknownError => "unknown error",
        };
        f.write_str(name)
    }
}

/// Error payload as it appears on the wire (`{code, message, data?}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default = "ErrorBody::unknown_code")]
    pub code: i32,
    #[serde(default = "ErrorBody::unknown_message")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorBody {
    fn unknown_code() -> i32 {
        -1
    }

    fn unknown_message() -> String {
        "Unknown Error".to_string()
    }

    /// Fallback used when a failed response carries no decodable error.
    pub fn unknown() -> Self {
        Self {
            code: Self::unknown_code(),
            message: Self::unknown_message(),
            data: None,
        }
    }
}

/// Typed protocol error.
///
/// `code` keeps the raw wire code so errors built from unrecognized codes
/// round-trip without loss.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} ({code}): {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_fault(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseFault, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorKind::MethodNotFound,
            format!("Method not found - {}", method),
        )
    }

    pub fn invalid_parameters(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParameters, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn not_initialized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerNotInitialized, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::RequestCancelled, "Request was cancelled")
    }

    pub fn content_modified() -> Self {
        Self::new(
            ErrorKind::ContentModified,
            "Request was superseded by a newer request",
        )
    }

    /// Generic fallback for a code the taxonomy does not know.
    pub fn unknown(body: &ErrorBody) -> Self {
        Self {
            kind: ErrorKind::UnknownError,
            code: body.code,
            message: body.message.clone(),
            data: body.data.clone(),
        }
    }

    /// Wire representation of this error.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code,
            message: self.message.clone(),
            data: self.data.clone(),
        }
    }
}

/// Transport and engine failures.
#[derive(Debug, Error)]
pub enum WireError {
    /// Peer sent a top-level message kind this engine cannot speak.
    #[error("Message type {message_type} is not supported")]
    UnsupportedMessage { message_type: String },

    /// An outbound call id is already outstanding.
    #[error("Request id {0} is already pending")]
    DuplicateId(RequestId),

    /// A pipeline channel closed while the engine was still running.
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type WireResult<T> = Result<T, WireError>;

/// Recover the guard from a poisoned lock, logging which operation hit it.
pub trait LockResultExt<T> {
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "dapwire::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
