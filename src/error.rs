use std::collections::BTreeMap;
use thiserror::Error;

pub const TIMEOUT_MESSAGE: &str = "The request took too long (timeout).";
pub const NETWORK_MESSAGE: &str = "Network failure or server unavailable.";
pub const UNKNOWN_MESSAGE: &str = "Unknown error";
pub const PAYLOAD_TOO_LARGE_MESSAGE: &str =
    "The file exceeds the maximum size allowed by the server.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally before any request was made.
    Validation,
    Timeout,
    Network,
    /// Non-2xx response from the backend.
    Http,
    /// The backend reported the session as `ERROR`.
    SessionFailed,
    /// A response arrived without a usable session identifier.
    MissingSession,
    Decode,
}

/// User-facing error shared by every fallible operation in the crate.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub field_errors: Option<BTreeMap<String, String>>,
    pub empty_body: bool,
}

impl ApiError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            field_errors: None,
            empty_body: false,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, TIMEOUT_MESSAGE)
    }

    pub fn network() -> Self {
        Self::new(ErrorKind::Network, NETWORK_MESSAGE)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ErrorKind::Http, message)
        }
    }

    /// Non-2xx response that carried no content at all.
    pub fn http_empty(status: u16) -> Self {
        Self {
            empty_body: true,
            ..Self::http(status, format!("Error {status}"))
        }
    }

    pub fn session_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionFailed, message)
    }

    pub fn missing_session(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingSession, message)
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Decode, message)
    }

    pub fn with_field_errors(mut self, field_errors: BTreeMap<String, String>) -> Self {
        self.field_errors = Some(field_errors);
        self
    }

    /// 401/403 with no body, seen while the backend is still settling session
    /// ownership. Polling treats this as a retryable condition.
    pub fn is_transient_auth_race(&self) -> bool {
        self.kind == ErrorKind::Http && self.empty_body && is_auth_status(self.status)
    }

    /// 401/403 carrying a body: the credential is no longer accepted.
    pub fn requires_sign_in(&self) -> bool {
        self.kind == ErrorKind::Http && !self.empty_body && is_auth_status(self.status)
    }
}

fn is_auth_status(status: Option<u16>) -> bool {
    matches!(status, Some(401 | 403))
}
