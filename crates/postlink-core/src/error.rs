//! Shared error type across postlink crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-facing error codes (stable API).
///
/// These are the strings carried inside an ERROR_RESPONSE envelope and the
/// only part of an error that crosses a context boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No registration admitted the request.
    NoListener,
    /// Observed origin did not match the configured domain pattern.
    DomainMismatch,
    /// Observed source context was not the expected one.
    WindowMismatch,
    /// No RESPONSE arrived within the configured window.
    Timeout,
    /// Target context destroyed mid-flight, or a function owner was torn down.
    ContextGone,
    /// A listener handler failed; reduced to message + kind before crossing.
    HandlerError,
    /// A relay could not forward.
    BridgeError,
    /// Malformed envelope (local decode failure, never sent on the wire).
    BadEnvelope,
    /// Invalid engine configuration (local only).
    Config,
    /// Internal engine failure.
    Internal,
}

impl ErrorKind {
    /// String representation used in wire payloads and assertions.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoListener => "NO_LISTENER",
            ErrorKind::DomainMismatch => "DOMAIN_MISMATCH",
            ErrorKind::WindowMismatch => "WINDOW_MISMATCH",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ContextGone => "CONTEXT_GONE",
            ErrorKind::HandlerError => "HANDLER_ERROR",
            ErrorKind::BridgeError => "BRIDGE_ERROR",
            ErrorKind::BadEnvelope => "BAD_ENVELOPE",
            ErrorKind::Config => "CONFIG",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, PostlinkError>;

/// Unified error type used by core and engine.
#[derive(Debug, Error)]
pub enum PostlinkError {
    #[error("no listener registered for '{0}'")]
    NoListener(String),
    #[error("domain mismatch: expected {expected}, observed {observed}")]
    DomainMismatch { expected: String, observed: String },
    #[error("window mismatch: unexpected source context")]
    WindowMismatch,
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("context gone: {0}")]
    ContextGone(String),
    #[error("handler error: {0}")]
    HandlerError(String),
    #[error("bridge error: {0}")]
    BridgeError(String),
    #[error("bad envelope: {0}")]
    BadEnvelope(String),
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
    /// An error received from the remote side, reconstituted from its wire
    /// descriptor. The original error value never crosses the boundary.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl PostlinkError {
    /// Map an error to its stable wire-facing kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PostlinkError::NoListener(_) => ErrorKind::NoListener,
            PostlinkError::DomainMismatch { .. } => ErrorKind::DomainMismatch,
            PostlinkError::WindowMismatch => ErrorKind::WindowMismatch,
            PostlinkError::Timeout(_) => ErrorKind::Timeout,
            PostlinkError::ContextGone(_) => ErrorKind::ContextGone,
            PostlinkError::HandlerError(_) => ErrorKind::HandlerError,
            PostlinkError::BridgeError(_) => ErrorKind::BridgeError,
            PostlinkError::BadEnvelope(_) => ErrorKind::BadEnvelope,
            PostlinkError::Config(_) => ErrorKind::Config,
            PostlinkError::Internal(_) => ErrorKind::Internal,
            PostlinkError::Remote { kind, .. } => *kind,
        }
    }

    /// Reduce to the descriptor that crosses the boundary.
    pub fn to_wire(&self) -> WireError {
        WireError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Serialized error descriptor carried in ERROR_RESPONSE data: message plus
/// kind, never the raw error object or a stack reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<WireError> for PostlinkError {
    fn from(w: WireError) -> Self {
        PostlinkError::Remote {
            kind: w.kind,
            message: w.message,
        }
    }
}
