//! Error taxonomy for the realtime client.
//!
//! Every fallible operation returns [`Error`]. State-change events carry the
//! wire-level [`ErrorInfo`] instead, which is what the service sends in
//! `error` fields and what [`Error::info`] produces for local failures.

use serde::{Deserialize, Serialize};

use crate::encoding::EncodingError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Numeric error codes shared with the service.
pub mod codes {
    /// Malformed request.
    pub const BAD_REQUEST: u32 = 40000;
    /// Invalid argument supplied by the caller.
    pub const INVALID_ARGUMENT: u32 = 40003;
    /// Client id asserted by a message or token does not match the identity.
    pub const INCOMPATIBLE_CLIENT_ID: u32 = 40012;
    /// Encoded message data or `encoding` tag is invalid.
    pub const INVALID_MESSAGE_DATA: u32 = 40013;
    /// Credentials rejected.
    pub const INVALID_CREDENTIALS: u32 = 40101;
    /// First code of the token error range.
    pub const TOKEN_ERROR_START: u32 = 40140;
    /// Token expired.
    pub const TOKEN_EXPIRED: u32 = 40142;
    /// Last code of the token error range.
    pub const TOKEN_ERROR_END: u32 = 40149;
    /// Operation not permitted by the token's capability.
    pub const OPERATION_NOT_PERMITTED: u32 = 40160;
    /// Token request (callback, URL or exchange) failed.
    pub const TOKEN_REQUEST_FAILED: u32 = 40170;
    /// Token expired or missing and no means to obtain a new one.
    pub const NO_MEANS_TO_RENEW: u32 = 40171;
    /// Operation timed out.
    pub const TIMEOUT: u32 = 50003;
    /// Connection failed.
    pub const CONNECTION_FAILED: u32 = 80000;
    /// Connection suspended.
    pub const CONNECTION_SUSPENDED: u32 = 80002;
    /// Connection disconnected.
    pub const DISCONNECTED: u32 = 80003;
    /// Connection closed.
    pub const CONNECTION_CLOSED: u32 = 80017;
    /// Channel operation failed.
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;
    /// Channel attach timed out.
    pub const ATTACH_TIMEOUT: u32 = 90007;
    /// Inbound payload could not be decoded.
    pub const DECODE_FAILED: u32 = 92000;
}

/// Error details as carried on the wire and in state-change events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    /// Service error code (see [`codes`]).
    pub code: u32,
    /// HTTP-equivalent status.
    #[serde(default, alias = "status", skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Human-readable description.
    #[serde(default)]
    pub message: String,
}

impl ErrorInfo {
    /// Build an error info.
    pub fn new(code: u32, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Token errors can be recovered by obtaining a fresh token.
    pub fn is_token_error(&self) -> bool {
        (codes::TOKEN_ERROR_START..=codes::TOKEN_ERROR_END).contains(&self.code)
    }

    /// Capability errors deny an operation without affecting the connection.
    pub fn is_capability_error(&self) -> bool {
        (codes::OPERATION_NOT_PERMITTED..codes::OPERATION_NOT_PERMITTED + 10).contains(&self.code)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "[{} / {}] {}", self.code, status, self.message),
            None => write!(f, "[{}] {}", self.code, self.message),
        }
    }
}

/// Errors returned by client operations.
///
/// `Clone` so that a single failure can resolve every waiter coalesced onto
/// the same in-flight operation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Connectivity loss or transport-level failure. Recovered automatically.
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection-scope failure reported by the service or the state machine.
    #[error("connection error: {0}")]
    Connection(ErrorInfo),

    /// Token request failure or missing credentials.
    #[error("auth error: {0}")]
    Auth(ErrorInfo),

    /// A message or token asserts a client id incompatible with the identity.
    #[error("incompatible client id: expected '{expected}', got '{actual}'")]
    IncompatibleClientId {
        /// Identity configured or established on the connection.
        expected: String,
        /// Identity asserted by the message or token.
        actual: String,
    },

    /// Channel-scope failure (permission denied, attach rejected).
    #[error("channel '{channel}' error: {info}")]
    Channel {
        /// Channel name.
        channel: String,
        /// Reason reported by the service.
        info: ErrorInfo,
    },

    /// Payload transform failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A network-dependent operation did not complete in time.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Caller supplied an invalid argument or configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// State the entity was in.
        state: String,
    },

    /// REST collaborator returned an error response.
    #[error("REST request failed with status {status}: {info}")]
    Rest {
        /// HTTP status.
        status: u16,
        /// Error body, or a synthesised one if the body was not an error.
        info: ErrorInfo,
    },

    /// HTTP client failure before a response was received.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The client instance has been closed or its event loop has exited.
    #[error("client closed")]
    Closed,
}

impl Error {
    /// Wire-level representation of this error.
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::Transport(msg) => ErrorInfo::new(codes::DISCONNECTED, Some(400), msg.clone()),
            Self::Connection(info) | Self::Auth(info) | Self::Rest { info, .. } => info.clone(),
            Self::Channel { info, .. } => info.clone(),
            Self::IncompatibleClientId { .. } => {
                ErrorInfo::new(codes::INCOMPATIBLE_CLIENT_ID, Some(400), self.to_string())
            }
            Self::Encoding(e) => ErrorInfo::new(e.code(), Some(400), e.to_string()),
            Self::Timeout(msg) => ErrorInfo::new(codes::TIMEOUT, Some(504), msg.clone()),
            Self::InvalidArgument(msg) => {
                ErrorInfo::new(codes::INVALID_ARGUMENT, Some(400), msg.clone())
            }
            Self::InvalidState { .. } => {
                ErrorInfo::new(codes::CHANNEL_OPERATION_FAILED, Some(400), self.to_string())
            }
            Self::Http(msg) => ErrorInfo::new(codes::BAD_REQUEST, None, msg.clone()),
            Self::Closed => ErrorInfo::new(codes::CONNECTION_CLOSED, Some(400), "client closed"),
        }
    }

    /// Service error code for this error.
    pub fn code(&self) -> u32 {
        self.info().code
    }

    /// True for client id mismatches, whether detected locally or by the service.
    pub fn is_identity_error(&self) -> bool {
        self.code() == codes::INCOMPATIBLE_CLIENT_ID
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("invalid JSON: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_deserialize_accepts_status_alias() {
        let json = r#"{"code": 40160, "status": 401, "message": "denied"}"#;
        let info: ErrorInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.code, 40160);
        assert_eq!(info.status_code, Some(401));
        assert!(info.is_capability_error());
        assert!(!info.is_token_error());
    }

    #[test]
    fn test_token_error_range() {
        assert!(ErrorInfo::new(40140, Some(401), "").is_token_error());
        assert!(ErrorInfo::new(40142, Some(401), "").is_token_error());
        assert!(!ErrorInfo::new(40150, Some(401), "").is_token_error());
    }

    #[test]
    fn test_identity_error_code() {
        let err = Error::IncompatibleClientId {
            expected: "alice".into(),
            actual: "bob".into(),
        };
        assert!(err.is_identity_error());
        assert_eq!(err.info().status_code, Some(400));
    }

    #[test]
    fn test_display_includes_status() {
        let info = ErrorInfo::new(80003, Some(400), "gone");
        assert_eq!(info.to_string(), "[80003 / 400] gone");
    }
}
