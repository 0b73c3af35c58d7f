//! Error taxonomy for session orchestration
//!
//! Every failure site in the orchestrator maps to exactly one of these kinds.
//! Only `TransportFailure` is allowed to end a session; everything else is
//! contained at the stage where it happened and turned into an outbound
//! event or a fallback artifact.

use serde::{Deserialize, Serialize};

use crate::capabilities::{CapabilityError, Service};

/// Failure class, carried on outbound `error` events so clients and tests can
/// match on the class instead of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    CapabilityUnavailable,
    CapabilityFailure,
    TransportFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::CapabilityUnavailable => "capability_unavailable",
            ErrorKind::CapabilityFailure => "capability_failure",
            ErrorKind::TransportFailure => "transport_failure",
        }
    }
}

/// Errors that can occur while running a session
#[derive(Debug, Clone)]
pub enum SessionError {
    /// Malformed or empty input (bad control message, empty TTS text)
    Validation(String),
    /// A capability has no credentials/config and is running degraded
    CapabilityUnavailable { service: Service, reason: String },
    /// A call to a capability errored or timed out
    CapabilityFailure { service: Service, reason: String },
    /// The client connection is gone or unsendable
    TransportFailure(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation(_) => ErrorKind::Validation,
            SessionError::CapabilityUnavailable { .. } => ErrorKind::CapabilityUnavailable,
            SessionError::CapabilityFailure { .. } => ErrorKind::CapabilityFailure,
            SessionError::TransportFailure(_) => ErrorKind::TransportFailure,
        }
    }

    /// Whether this error must terminate the session
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::TransportFailure(_))
    }

    /// Map a capability error raised by `service` into the session taxonomy
    pub fn from_capability(service: Service, err: CapabilityError) -> Self {
        match err {
            CapabilityError::Unavailable(reason) => {
                SessionError::CapabilityUnavailable { service, reason }
            }
            other => SessionError::CapabilityFailure {
                service,
                reason: other.to_string(),
            },
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Validation(e) => write!(f, "Invalid input: {}", e),
            SessionError::CapabilityUnavailable { service, reason } => {
                write!(f, "{} unavailable: {}", service.label(), reason)
            }
            SessionError::CapabilityFailure { service, reason } => {
                write!(f, "{} failed: {}", service.label(), reason)
            }
            SessionError::TransportFailure(e) => write!(f, "Connection failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}
