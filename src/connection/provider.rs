//! The capability set the connection manager drives.
//!
//! A provider hands out opaque handles for every stage and knows how to
//! release them. It never sees the stage ordering; that is enforced by
//! [`ConnectionManager`](super::ConnectionManager) before any call is made.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::endpoint::{Credential, Endpoint};
use super::state::{ChannelKind, SocketDomain, SocketType};
use crate::error::{ErrorDescriptor, ErrorKind};
use crate::ssh::CommandOutput;

/// Failure reported by a provider primitive
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The remote end or the local stack refused the request
    #[error("refused: {0}")]
    Refused(String),

    /// A budget enforced inside the provider (e.g. the banner) elapsed
    #[error("{stage} timeout of {seconds} seconds exceeded.")]
    Timeout { stage: &'static str, seconds: f64 },

    /// Credentials were offered and refused
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// The credential cannot be used with this session
    #[error("bad authentication type: {0}")]
    BadAuthType(String),

    /// SSH or SFTP protocol failure
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for provider primitives
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl ProviderError {
    pub fn refused(msg: impl Into<String>) -> Self {
        ProviderError::Refused(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        ProviderError::Protocol(msg.into())
    }

    pub fn auth_rejected(msg: impl Into<String>) -> Self {
        ProviderError::AuthRejected(msg.into())
    }

    pub fn bad_auth_type(msg: impl Into<String>) -> Self {
        ProviderError::BadAuthType(msg.into())
    }

    pub fn timeout(stage: &'static str, budget: Duration) -> Self {
        ProviderError::Timeout {
            stage,
            seconds: budget.as_secs_f64(),
        }
    }

    /// Which error-slot kind this failure is recorded as
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Timeout { .. } => ErrorKind::TimeoutExceeded,
            ProviderError::AuthRejected(_) | ProviderError::BadAuthType(_) => {
                ErrorKind::AuthenticationRejected
            }
            ProviderError::Refused(_) | ProviderError::Protocol(_) | ProviderError::Io(_) => {
                ErrorKind::ProviderFailure
            }
        }
    }
}

impl From<ProviderError> for ErrorDescriptor {
    fn from(err: ProviderError) -> Self {
        ErrorDescriptor::new(err.kind(), err.to_string())
    }
}

/// Socket, session, transport and channel primitives.
///
/// Handles are exclusively owned by the caller once returned; each `close_*`
/// consumes its handle.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    type Socket: Send;
    type Session: Send;
    type Transport: Send;
    type Channel: Send;
    type Sftp: Send;

    /// Open and connect a socket. The caller bounds this with the tcp budget.
    async fn connect_socket(
        &self,
        domain: SocketDomain,
        socket_type: SocketType,
        host: &str,
        port: u16,
    ) -> ProviderResult<Self::Socket>;

    /// Run the protocol handshake over `socket` and authenticate.
    ///
    /// The caller bounds the whole call with the auth budget; `banner_timeout`
    /// bounds the wait for the server's identification line.
    async fn authenticate(
        &self,
        socket: &mut Self::Socket,
        endpoint: &Endpoint,
        credential: &Credential,
        banner_timeout: Duration,
    ) -> ProviderResult<Self::Session>;

    /// The multiplexed transport bound to an authenticated session
    async fn get_transport(&self, session: &Self::Session) -> ProviderResult<Self::Transport>;

    async fn open_channel(
        &self,
        transport: &Self::Transport,
        kind: ChannelKind,
        endpoint: &Endpoint,
    ) -> ProviderResult<Self::Channel>;

    async fn open_sftp(&self, transport: &Self::Transport) -> ProviderResult<Self::Sftp>;

    /// Read up to `max` bytes. Non-blocking reads return an empty buffer when
    /// nothing is pending.
    async fn read(
        &self,
        socket: &mut Self::Socket,
        max: usize,
        blocking: bool,
    ) -> ProviderResult<Vec<u8>>;

    async fn write(&self, socket: &mut Self::Socket, data: &[u8]) -> ProviderResult<usize>;

    /// Execute one command on a session channel, consuming it
    async fn exec(&self, channel: Self::Channel, command: &str) -> ProviderResult<CommandOutput>;

    async fn send(&self, channel: &mut Self::Channel, data: &[u8]) -> ProviderResult<usize>;

    /// Copy a remote file to `local`, returning the byte count
    async fn download(&self, sftp: &Self::Sftp, remote: &str, local: &Path)
        -> ProviderResult<u64>;

    /// Copy `local` to a remote file, returning the byte count
    async fn upload(&self, sftp: &Self::Sftp, local: &Path, remote: &str) -> ProviderResult<u64>;

    async fn close_sftp(&self, sftp: Self::Sftp) -> ProviderResult<()>;
    async fn close_channel(&self, channel: Self::Channel) -> ProviderResult<()>;
    async fn close_transport(&self, transport: Self::Transport) -> ProviderResult<()>;
    async fn close_session(&self, session: Self::Session) -> ProviderResult<()>;
    async fn close_socket(&self, socket: Self::Socket) -> ProviderResult<()>;
}
