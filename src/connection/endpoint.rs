//! Resolved connection targets and the lookup service that produces them.

use std::fmt;
use std::path::PathBuf;

use serde::{Serialize, Serializer};

/// Credential used to authenticate a session
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password(String),
    IdentityFile(PathBuf),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::IdentityFile(path) => f.debug_tuple("IdentityFile").field(path).finish(),
        }
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("password"),
            Credential::IdentityFile(path) => write!(f, "identity file {}", path.display()),
        }
    }
}

impl Serialize for Credential {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// A resolved connection target. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub auth: Credential,
}

impl Endpoint {
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        auth: Credential,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            user: user.into(),
            auth,
        }
    }

    /// Same target, different port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.hostname, self.port)
    }
}

/// Maps a symbolic host name to connection parameters.
///
/// Implementations must answer deterministically for one configuration
/// snapshot. `None` means "unknown host".
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Endpoint>;

    /// Every symbolic name this resolver knows, sorted
    fn known_hosts(&self) -> Vec<String>;
}
