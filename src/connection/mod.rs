//! Connection lifecycle core
//!
//! The staged manager and the collaborator contracts it is written against:
//! an [`EndpointResolver`] for host lookup, a [`TransportProvider`] for the
//! socket/session/channel primitives, and a [`LevelControl`] for verbosity.

pub mod endpoint;
pub mod level;
pub mod manager;
pub mod provider;
pub mod state;

#[cfg(test)]
pub(crate) mod fake;

// Re-exports
pub use endpoint::{Credential, Endpoint, EndpointResolver};
pub use level::{DebugLevel, LevelControl, MemoryLevelControl, ReloadLevelControl};
pub use manager::{ConnectionManager, StatusSnapshot, DEFAULT_EXEC_TIMEOUT, MAX_READ_SIZE};
pub use provider::{ProviderError, ProviderResult, TransportProvider};
pub use state::{
    ChannelKind, ConnectionState, SocketDomain, SocketType, Stage, TimeoutStage, Timeouts,
    DEFAULT_STAGE_TIMEOUT_SECS,
};
