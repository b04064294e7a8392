//! Error types for beachhead
//!
//! Two layers live here. [`BeachheadError`] covers start-up failures
//! (configuration, reading the ssh config file). [`ErrorDescriptor`] is what
//! every connection-manager operation hands back and keeps in its error slot;
//! callers branch on its [`ErrorKind`] instead of parsing text.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Main error type for process-level failures
#[derive(Debug, Error)]
pub enum BeachheadError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The ssh config file exists but could not be understood
    #[error("could not understand ssh config file {path}: {reason}")]
    SshConfig { path: String, reason: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Logging could not be initialised or reconfigured
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type alias using BeachheadError
pub type Result<T> = std::result::Result<T, BeachheadError>;

impl BeachheadError {
    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        BeachheadError::Config(msg.into())
    }

    /// Create an ssh config error for the given file
    pub fn ssh_config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        BeachheadError::SshConfig {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a logging error from a string
    pub fn logging(msg: impl Into<String>) -> Self {
        BeachheadError::Logging(msg.into())
    }
}

/// What went wrong with a connection-manager operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The operation was attempted out of order; the provider was never called
    PreconditionViolation,
    /// The symbolic host name has no known mapping
    ResolutionFailure,
    /// A stage timeout (tcp, auth, banner, exec) elapsed
    TimeoutExceeded,
    /// Credentials were refused or of an unsupported type
    AuthenticationRejected,
    /// Anything else the transport, session or channel layer reported
    ProviderFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::PreconditionViolation => "precondition violation",
            ErrorKind::ResolutionFailure => "resolution failure",
            ErrorKind::TimeoutExceeded => "timeout exceeded",
            ErrorKind::AuthenticationRejected => "authentication rejected",
            ErrorKind::ProviderFailure => "provider failure",
        };
        f.write_str(name)
    }
}

/// A failed operation: its kind plus free-text detail
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{kind}: {detail}")]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ErrorDescriptor {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn precondition(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::PreconditionViolation, detail)
    }

    pub fn resolution(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResolutionFailure, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::TimeoutExceeded, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationRejected, detail)
    }

    pub fn provider(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderFailure, detail)
    }
}

/// Result of a connection-manager operation
pub type Outcome<T = ()> = std::result::Result<T, ErrorDescriptor>;
