//! SSH backend
//!
//! The russh implementation of the connection primitives, the ssh client
//! config resolver, and the helpers for running commands over a channel.

pub mod command;
pub mod config;
pub mod handler;
pub mod provider;
pub mod sanitize;

// Re-exports
pub use command::CommandOutput;
pub use config::{default_ssh_config_path, SshConfigResolver};
pub use handler::SshHandler;
pub use provider::{RusshProvider, RusshSession, RusshSocket};
pub use sanitize::{check_payload, sanitize_command};
