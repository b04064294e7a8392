//! beachhead - a console for diagnosing SSH connectivity one layer at a time
//!
//! A connection is built as an explicit chain of stages, each opened by its
//! own command and bounded by its own timeout:
//!
//! socket -> ssh session -> transport -> { channel, sftp }
//!
//! When a stage fails, the failure is recorded and the connection stays
//! where it was, so the operator can see exactly which layer broke and how
//! long it took to do so, adjust a setting, and retry that layer.
//!
//! # Layout
//!
//! - [`connection`] - the staged [`ConnectionManager`] and the contracts it is
//!   written against
//! - [`ssh`] - russh-backed provider and the `~/.ssh/config` resolver
//! - [`console`] - the command dispatcher behind the interactive prompt
//!
//! # Example Usage (CLI)
//!
//! ```bash
//! beachhead --banner-timeout=3 --log-level=INFO
//! [beachhead]: open socket myserver
//! [beachhead]: open session
//! ```

pub mod config;
pub mod connection;
pub mod console;
pub mod error;
pub mod ssh;

// Re-exports for convenience
pub use config::{Args, Config};
pub use connection::{
    ChannelKind, ConnectionManager, ConnectionState, DebugLevel, Endpoint, EndpointResolver,
    StatusSnapshot, TransportProvider,
};
pub use console::{Console, Reply, PROMPT};
pub use error::{BeachheadError, ErrorDescriptor, ErrorKind, Outcome, Result};
pub use ssh::{CommandOutput, RusshProvider, SshConfigResolver, SshHandler};
