//! Lifecycle states and the closed sets of values a connection is configured with.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

/// How far up the stage chain the connection currently reaches.
///
/// Channels and the sftp sub-channel are siblings that hang off
/// `TransportOpen`; their presence is reported separately and does not move
/// the state beyond `TransportOpen`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    SocketOpen,
    SessionEstablished,
    TransportOpen,
}

impl ConnectionState {
    /// Position in the chain, `Disconnected` being 0
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::SocketOpen => "socket open",
            ConnectionState::SessionEstablished => "session established",
            ConnectionState::TransportOpen => "transport open",
        };
        f.write_str(name)
    }
}

/// One step of the chain, named by the resource it opens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Socket,
    Session,
    Transport,
    Channel,
    Sftp,
}

impl Stage {
    /// The exact state a manager must be in before this stage may be opened
    pub fn requires(self) -> ConnectionState {
        match self {
            Stage::Socket => ConnectionState::Disconnected,
            Stage::Session => ConnectionState::SocketOpen,
            Stage::Transport => ConnectionState::SessionEstablished,
            Stage::Channel | Stage::Sftp => ConnectionState::TransportOpen,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Socket => "socket",
            Stage::Session => "session",
            Stage::Transport => "transport",
            Stage::Channel => "channel",
            Stage::Sftp => "sftp",
        };
        f.write_str(name)
    }
}

/// Logical channel types that may be opened over a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ChannelKind {
    #[default]
    #[serde(rename = "session")]
    Session,
    #[serde(rename = "forwarded-tcpip")]
    ForwardedTcpip,
    #[serde(rename = "direct-tcpip")]
    DirectTcpip,
    #[serde(rename = "x11")]
    X11,
}

impl ChannelKind {
    /// Wire name of the channel type
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::ForwardedTcpip => "forwarded-tcpip",
            ChannelKind::DirectTcpip => "direct-tcpip",
            ChannelKind::X11 => "x11",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    /// Accepts the wire names and the console shorthands `forward`, `direct`, `x`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "session" => Ok(ChannelKind::Session),
            "forward" | "forwarded-tcpip" => Ok(ChannelKind::ForwardedTcpip),
            "direct" | "direct-tcpip" => Ok(ChannelKind::DirectTcpip),
            "x" | "x11" => Ok(ChannelKind::X11),
            other => Err(format!("unknown channel type: {}", other)),
        }
    }
}

/// Address family used for the raw socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketDomain {
    #[default]
    Inet,
    Inet6,
    Unix,
}

impl fmt::Display for SocketDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketDomain::Inet => "af_inet",
            SocketDomain::Inet6 => "af_inet6",
            SocketDomain::Unix => "af_unix",
        };
        f.write_str(name)
    }
}

impl FromStr for SocketDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "af_inet" | "inet" => Ok(SocketDomain::Inet),
            "af_inet6" | "inet6" => Ok(SocketDomain::Inet6),
            "af_unix" | "unix" => Ok(SocketDomain::Unix),
            other => Err(format!("unknown socket domain: {}", other)),
        }
    }
}

/// Socket semantics used for the raw socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    #[default]
    Stream,
    Dgram,
    Raw,
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketType::Stream => "stream",
            SocketType::Dgram => "dgram",
            SocketType::Raw => "raw",
        };
        f.write_str(name)
    }
}

impl FromStr for SocketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stream" => Ok(SocketType::Stream),
            "dgram" => Ok(SocketType::Dgram),
            "raw" => Ok(SocketType::Raw),
            other => Err(format!("unknown socket type: {}", other)),
        }
    }
}

/// Which timeout budget a setting applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutStage {
    Tcp,
    Auth,
    Banner,
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutStage::Tcp => "tcp",
            TimeoutStage::Auth => "auth",
            TimeoutStage::Banner => "banner",
        };
        f.write_str(name)
    }
}

impl FromStr for TimeoutStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "tcp" => Ok(TimeoutStage::Tcp),
            "auth" => Ok(TimeoutStage::Auth),
            "banner" => Ok(TimeoutStage::Banner),
            other => Err(format!("no timeout value for {}", other)),
        }
    }
}

/// Default budget for every stage, in seconds
pub const DEFAULT_STAGE_TIMEOUT_SECS: f64 = 1.0;

/// The three independent stage budgets
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Timeouts {
    pub tcp: Duration,
    pub auth: Duration,
    pub banner: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let secs = Duration::from_secs_f64(DEFAULT_STAGE_TIMEOUT_SECS);
        Self {
            tcp: secs,
            auth: secs,
            banner: secs,
        }
    }
}

impl Timeouts {
    pub fn get(&self, stage: TimeoutStage) -> Duration {
        match stage {
            TimeoutStage::Tcp => self.tcp,
            TimeoutStage::Auth => self.auth,
            TimeoutStage::Banner => self.banner,
        }
    }

    /// Set one budget from fractional seconds.
    ///
    /// Negative, NaN and infinite values are refused.
    pub fn set(&mut self, stage: TimeoutStage, seconds: f64) -> Result<(), String> {
        let value = Duration::try_from_secs_f64(seconds)
            .map_err(|_| format!("bad value for timeout: {}", seconds))?;
        match stage {
            TimeoutStage::Tcp => self.tcp = value,
            TimeoutStage::Auth => self.auth = value,
            TimeoutStage::Banner => self.banner = value,
        }
        Ok(())
    }
}

impl fmt::Display for Timeouts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "timeouts (tcp, auth, banner): ({}, {}, {})",
            self.tcp.as_secs_f64(),
            self.auth.as_secs_f64(),
            self.banner.as_secs_f64()
        )
    }
}
