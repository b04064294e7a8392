//! Staged connection manager
//!
//! Owns the resource chain socket -> session -> transport -> {channel, sftp}
//! and walks it one explicit step at a time:
//! - every `open_*` checks that the manager sits at exactly the preceding
//!   state before the provider is touched
//! - every stage is bounded by its own timeout
//! - a failure is recorded in a single error slot and leaves the state where
//!   it was, so the same stage can be retried
//! - `close()` always runs the whole chain in reverse and never fails
//!
//! The presence of a handle is the only record of a stage being open; the
//! reported [`ConnectionState`] is derived from the handles.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::endpoint::{Credential, Endpoint, EndpointResolver};
use super::level::{DebugLevel, LevelControl};
use super::provider::{ProviderResult, TransportProvider};
use super::state::{
    ChannelKind, ConnectionState, SocketDomain, SocketType, Stage, TimeoutStage, Timeouts,
};
use crate::error::{ErrorDescriptor, Outcome};
use crate::ssh::CommandOutput;

/// Default budget for a command run over a channel
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Largest buffer a single raw `read` may ask for
pub const MAX_READ_SIZE: usize = 64 * 1024;

/// A channel together with the kind it was opened as
struct OpenChannel<C> {
    kind: ChannelKind,
    handle: C,
}

/// Point-in-time view of a manager, for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub endpoint: Option<Endpoint>,
    pub timeouts: Timeouts,
    pub socket_domain: SocketDomain,
    pub socket_type: SocketType,
    pub blocking: bool,
    pub debug_level: DebugLevel,
    pub password_set: bool,
    pub socket: bool,
    pub session: bool,
    pub transport: bool,
    pub channel: Option<ChannelKind>,
    pub sftp: bool,
    pub last_error: Option<ErrorDescriptor>,
}

impl StatusSnapshot {
    /// Human-readable lines, one per fact
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![format!("debug level: {}", self.debug_level)];
        let Some(endpoint) = self.endpoint.as_ref().filter(|_| self.socket) else {
            lines.push("not connected.".to_string());
            lines.push(self.timeouts.to_string());
            lines.extend(self.last_error_line());
            return lines;
        };
        let present = |open: bool| if open { "open" } else { "none" };
        lines.push(format!("state:       {}", self.state));
        lines.push(format!("remote end:  {} ({})", endpoint, endpoint.auth));
        lines.push(format!(
            "type/domain: {} / {}",
            self.socket_type, self.socket_domain
        ));
        lines.push(format!(
            "blocking:    {}",
            if self.blocking { "yes" } else { "no" }
        ));
        lines.push(format!("ssh session: {}", present(self.session)));
        lines.push(format!("transport:   {}", present(self.transport)));
        lines.push(format!("sftp layer:  {}", present(self.sftp)));
        lines.push(format!(
            "channel:     {}",
            self.channel
                .map_or_else(|| "none".to_string(), |kind| kind.to_string())
        ));
        lines.push(self.timeouts.to_string());
        lines.extend(self.last_error_line());
        lines
    }

    fn last_error_line(&self) -> Option<String> {
        self.last_error
            .as_ref()
            .map(|err| format!("last error:  {}", err))
    }
}

/// Bound a provider call by `budget`, converting both failure paths into a descriptor
async fn bounded<T>(
    stage: TimeoutStage,
    budget: Duration,
    call: impl Future<Output = ProviderResult<T>>,
) -> Outcome<T> {
    match timeout(budget, call).await {
        Ok(result) => result.map_err(ErrorDescriptor::from),
        Err(_) => Err(ErrorDescriptor::timeout(format!(
            "{} timeout of {} seconds exceeded.",
            stage,
            budget.as_secs_f64()
        ))),
    }
}

fn log_teardown(stage: Stage, result: ProviderResult<()>) {
    match result {
        Ok(()) => debug!("{} closed", stage),
        Err(e) => warn!("closing {} failed: {}", stage, e),
    }
}

/// Staged connection manager
///
/// Owned by exactly one console; every operation takes `&mut self`, so two
/// operations can never run against the same manager at once.
pub struct ConnectionManager<R: EndpointResolver, P: TransportProvider> {
    resolver: R,
    provider: P,
    levels: Box<dyn LevelControl>,

    timeouts: Timeouts,
    exec_timeout: Duration,
    socket_domain: SocketDomain,
    socket_type: SocketType,
    password: Option<String>,
    blocking: bool,

    endpoint: Option<Endpoint>,
    last_error: Option<ErrorDescriptor>,

    socket: Option<P::Socket>,
    session: Option<P::Session>,
    transport: Option<P::Transport>,
    channel: Option<OpenChannel<P::Channel>>,
    sftp: Option<P::Sftp>,
}

impl<R: EndpointResolver, P: TransportProvider> ConnectionManager<R, P> {
    /// Create a disconnected manager. Nothing is opened until `open_socket`.
    pub fn new(resolver: R, provider: P, levels: Box<dyn LevelControl>) -> Self {
        Self {
            resolver,
            provider,
            levels,
            timeouts: Timeouts::default(),
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            socket_domain: SocketDomain::default(),
            socket_type: SocketType::default(),
            password: None,
            blocking: true,
            endpoint: None,
            last_error: None,
            socket: None,
            session: None,
            transport: None,
            channel: None,
            sftp: None,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_exec_timeout(mut self, exec_timeout: Duration) -> Self {
        self.exec_timeout = exec_timeout;
        self
    }

    /// Highest stage of the linear chain that is open
    pub fn state(&self) -> ConnectionState {
        if self.transport.is_some() {
            ConnectionState::TransportOpen
        } else if self.session.is_some() {
            ConnectionState::SessionEstablished
        } else if self.socket.is_some() {
            ConnectionState::SocketOpen
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn socket_domain(&self) -> SocketDomain {
        self.socket_domain
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn password_is_set(&self) -> bool {
        self.password.is_some()
    }

    pub fn last_error(&self) -> Option<&ErrorDescriptor> {
        self.last_error.as_ref()
    }

    pub fn reset_error(&mut self) {
        self.last_error = None;
    }

    /// Names the resolver can turn into endpoints
    pub fn known_hosts(&self) -> Vec<String> {
        self.resolver.known_hosts()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state(),
            endpoint: self.endpoint.clone(),
            timeouts: self.timeouts,
            socket_domain: self.socket_domain,
            socket_type: self.socket_type,
            blocking: self.blocking,
            debug_level: self.levels.level(),
            password_set: self.password.is_some(),
            socket: self.socket.is_some(),
            session: self.session.is_some(),
            transport: self.transport.is_some(),
            channel: self.channel.as_ref().map(|open| open.kind),
            sftp: self.sftp.is_some(),
            last_error: self.last_error.clone(),
        }
    }

    /// Overwrite the error slot with the outcome of the operation just run
    fn record<T>(&mut self, outcome: Outcome<T>) -> Outcome<T> {
        self.last_error = outcome.as_ref().err().cloned();
        if let Some(ref err) = self.last_error {
            error!("{}", err);
        }
        outcome
    }

    fn require(&self, stage: Stage) -> Outcome<()> {
        let current = self.state();
        let needed = stage.requires();
        if current != needed {
            return Err(ErrorDescriptor::precondition(format!(
                "cannot open {}: connection is {}, needs {}",
                stage, current, needed
            )));
        }
        Ok(())
    }

    // Stage operations

    /// Resolve `name` and connect a socket to it within the tcp budget.
    ///
    /// `port` overrides the resolved port. The endpoint is kept only when the
    /// connect succeeds.
    pub async fn open_socket(&mut self, name: &str, port: Option<u16>) -> Outcome<()> {
        let outcome = self.try_open_socket(name, port).await;
        self.record(outcome)
    }

    async fn try_open_socket(&mut self, name: &str, port: Option<u16>) -> Outcome<()> {
        self.require(Stage::Socket)?;

        let endpoint = self
            .resolver
            .resolve(name)
            .ok_or_else(|| ErrorDescriptor::resolution(format!("unknown host: {}", name)))?;
        let endpoint = match port {
            Some(port) => endpoint.with_port(port),
            None => endpoint,
        };

        info!(
            "Opening {} {} socket to {}:{}...",
            self.socket_domain, self.socket_type, endpoint.hostname, endpoint.port
        );
        let socket = bounded(
            TimeoutStage::Tcp,
            self.timeouts.tcp,
            self.provider.connect_socket(
                self.socket_domain,
                self.socket_type,
                &endpoint.hostname,
                endpoint.port,
            ),
        )
        .await?;

        info!("Connected to {}:{}", endpoint.hostname, endpoint.port);
        self.socket = Some(socket);
        self.endpoint = Some(endpoint);
        self.blocking = true;
        Ok(())
    }

    /// Authenticate over the open socket within the auth budget.
    ///
    /// A password set with [`set_password`](Self::set_password) wins; without
    /// one the endpoint's own credential (normally an identity file) is used.
    pub async fn open_session(&mut self) -> Outcome<()> {
        let outcome = self.try_open_session().await;
        self.record(outcome)
    }

    async fn try_open_session(&mut self) -> Outcome<()> {
        self.require(Stage::Session)?;

        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| ErrorDescriptor::precondition("no endpoint for session"))?;
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ErrorDescriptor::precondition("no open socket for session"))?;
        let credential = match self.password {
            Some(ref password) => Credential::Password(password.clone()),
            None => endpoint.auth.clone(),
        };

        debug!(
            "Authenticating as '{}' using {}",
            endpoint.user, credential
        );
        let session = bounded(
            TimeoutStage::Auth,
            self.timeouts.auth,
            self.provider
                .authenticate(socket, endpoint, &credential, self.timeouts.banner),
        )
        .await?;

        info!("SSH session established for {}", endpoint);
        self.session = Some(session);
        Ok(())
    }

    /// Take the multiplexed transport bound to the session
    pub async fn open_transport(&mut self) -> Outcome<()> {
        let outcome = self.try_open_transport().await;
        self.record(outcome)
    }

    async fn try_open_transport(&mut self) -> Outcome<()> {
        self.require(Stage::Transport)?;

        let session = self
            .session
            .as_ref()
            .ok_or_else(|| ErrorDescriptor::precondition("no open session for transport"))?;
        let transport = self.provider.get_transport(session).await?;

        info!("Transport layer open");
        self.transport = Some(transport);
        Ok(())
    }

    /// Open a channel of `kind` over the transport
    pub async fn open_channel(&mut self, kind: ChannelKind) -> Outcome<()> {
        let outcome = self.try_open_channel(kind).await;
        self.record(outcome)
    }

    /// Like [`open_channel`](Self::open_channel), but checks `name` against
    /// the known channel types before anything else happens.
    pub async fn open_channel_named(&mut self, name: &str) -> Outcome<()> {
        match name.parse::<ChannelKind>() {
            Ok(kind) => self.open_channel(kind).await,
            Err(reason) => self.record(Err(ErrorDescriptor::precondition(reason))),
        }
    }

    async fn try_open_channel(&mut self, kind: ChannelKind) -> Outcome<()> {
        self.require(Stage::Channel)?;
        if let Some(ref open) = self.channel {
            return Err(ErrorDescriptor::precondition(format!(
                "a {} channel is already open; close the connection first",
                open.kind
            )));
        }

        let (transport, endpoint) = match (self.transport.as_ref(), self.endpoint.as_ref()) {
            (Some(transport), Some(endpoint)) => (transport, endpoint),
            _ => return Err(ErrorDescriptor::precondition("transport not open")),
        };
        debug!("Opening {} channel", kind);
        let handle = self.provider.open_channel(transport, kind, endpoint).await?;

        info!("Channel of type {} open", kind);
        self.channel = Some(OpenChannel { kind, handle });
        Ok(())
    }

    /// Open the file-transfer sub-channel over the transport
    pub async fn open_sftp(&mut self) -> Outcome<()> {
        let outcome = self.try_open_sftp().await;
        self.record(outcome)
    }

    async fn try_open_sftp(&mut self) -> Outcome<()> {
        self.require(Stage::Sftp)?;
        if self.sftp.is_some() {
            return Err(ErrorDescriptor::precondition(
                "sftp layer is already open; close the connection first",
            ));
        }

        let transport = self
            .transport
            .as_ref()
            .ok_or_else(|| ErrorDescriptor::precondition("transport not open"))?;
        let sftp = self.provider.open_sftp(transport).await?;

        info!("SFTP layer open");
        self.sftp = Some(sftp);
        Ok(())
    }

    /// Tear everything down: sftp, channel, transport, session, socket.
    ///
    /// Each step runs only if its handle is present, and a failing step does
    /// not stop the ones after it. Calling this on a closed manager is a no-op.
    pub async fn close(&mut self) {
        self.last_error = None;

        if let Some(sftp) = self.sftp.take() {
            log_teardown(Stage::Sftp, self.provider.close_sftp(sftp).await);
        }
        if let Some(open) = self.channel.take() {
            log_teardown(Stage::Channel, self.provider.close_channel(open.handle).await);
        }
        if let Some(transport) = self.transport.take() {
            log_teardown(
                Stage::Transport,
                self.provider.close_transport(transport).await,
            );
        }
        if let Some(session) = self.session.take() {
            log_teardown(Stage::Session, self.provider.close_session(session).await);
        }
        if let Some(socket) = self.socket.take() {
            log_teardown(Stage::Socket, self.provider.close_socket(socket).await);
        }

        if let Some(endpoint) = self.endpoint.take() {
            info!("Connection to {} closed", endpoint);
        }
        self.blocking = true;
    }

    // Configuration

    /// Get the current diagnostic level, or set it from a name or number.
    ///
    /// Both forms count as an operation and overwrite the error slot.
    pub fn debug_level(&mut self, level: Option<&str>) -> Outcome<DebugLevel> {
        let Some(wanted) = level else {
            let current = self.levels.level();
            return self.record(Ok(current));
        };
        let outcome = wanted
            .parse::<DebugLevel>()
            .map_err(ErrorDescriptor::precondition)
            .and_then(|level| {
                self.levels
                    .set_level(level)
                    .map(|()| level)
                    .map_err(ErrorDescriptor::provider)
            });
        self.record(outcome)
    }

    /// Change one stage budget; operations already finished are unaffected
    pub fn set_timeout(&mut self, stage: TimeoutStage, seconds: f64) -> Outcome<()> {
        let outcome = self
            .timeouts
            .set(stage, seconds)
            .map_err(ErrorDescriptor::precondition);
        self.record(outcome)
    }

    /// Set or clear the password used by the next `open_session`
    pub fn set_password(&mut self, password: Option<String>) {
        self.password = password.filter(|p| !p.is_empty());
    }

    pub fn set_socket_domain(&mut self, domain: SocketDomain) -> Outcome<()> {
        let outcome = self
            .require_disconnected("socket domain")
            .map(|()| self.socket_domain = domain);
        self.record(outcome)
    }

    pub fn set_socket_type(&mut self, socket_type: SocketType) -> Outcome<()> {
        let outcome = self
            .require_disconnected("socket type")
            .map(|()| self.socket_type = socket_type);
        self.record(outcome)
    }

    fn require_disconnected(&self, what: &str) -> Outcome<()> {
        if self.socket.is_some() {
            return Err(ErrorDescriptor::precondition(format!(
                "cannot change {} while a socket is open",
                what
            )));
        }
        Ok(())
    }

    // Raw socket I/O

    /// Subsequent reads wait for data
    pub fn block(&mut self) -> Outcome<()> {
        let outcome = self.require_socket().map(|()| self.blocking = true);
        self.record(outcome)
    }

    /// Subsequent reads return at once when nothing is pending
    pub fn unblock(&mut self) -> Outcome<()> {
        let outcome = self.require_socket().map(|()| self.blocking = false);
        self.record(outcome)
    }

    fn require_socket(&self) -> Outcome<()> {
        if self.socket.is_none() {
            return Err(ErrorDescriptor::precondition("socket not open"));
        }
        Ok(())
    }

    /// Read up to `buf_size` bytes from the raw socket
    pub async fn read(&mut self, buf_size: usize) -> Outcome<Vec<u8>> {
        let outcome = match self.socket.as_mut() {
            Some(_) if buf_size == 0 || buf_size > MAX_READ_SIZE => {
                Err(ErrorDescriptor::precondition(format!(
                    "read size must be between 1 and {} bytes, got {}",
                    MAX_READ_SIZE, buf_size
                )))
            }
            Some(socket) => self
                .provider
                .read(socket, buf_size, self.blocking)
                .await
                .map_err(ErrorDescriptor::from),
            None => Err(ErrorDescriptor::precondition("socket not open")),
        };
        self.record(outcome)
    }

    /// Write all of `data` to the raw socket
    pub async fn write(&mut self, data: &[u8]) -> Outcome<usize> {
        let outcome = match self.socket.as_mut() {
            Some(socket) => self
                .provider
                .write(socket, data)
                .await
                .map_err(ErrorDescriptor::from),
            None => Err(ErrorDescriptor::precondition("socket not open")),
        };
        self.record(outcome)
    }

    // Channel and sftp work

    /// Run `command` on the open session channel.
    ///
    /// A session channel carries exactly one command, so the channel is
    /// consumed whether or not the command succeeds.
    pub async fn exec(&mut self, command: &str) -> Outcome<CommandOutput> {
        let outcome = self.try_exec(command).await;
        self.record(outcome)
    }

    async fn try_exec(&mut self, command: &str) -> Outcome<CommandOutput> {
        match self.channel.as_ref().map(|open| open.kind) {
            None => return Err(ErrorDescriptor::precondition("channel not open")),
            Some(ChannelKind::Session) => {}
            Some(kind) => {
                return Err(ErrorDescriptor::precondition(format!(
                    "commands need a session channel, not {}",
                    kind
                )))
            }
        }
        let open = self
            .channel
            .take()
            .ok_or_else(|| ErrorDescriptor::precondition("channel not open"))?;

        debug!("Executing remote command: {}", command);
        match timeout(self.exec_timeout, self.provider.exec(open.handle, command)).await {
            Ok(result) => result.map_err(ErrorDescriptor::from),
            Err(_) => {
                warn!(
                    "Command timed out after {}ms",
                    self.exec_timeout.as_millis()
                );
                Err(ErrorDescriptor::timeout(format!(
                    "command timeout after {}ms",
                    self.exec_timeout.as_millis()
                )))
            }
        }
    }

    /// Write `data` to the open channel
    pub async fn send(&mut self, data: &[u8]) -> Outcome<usize> {
        let outcome = match self.channel.as_mut() {
            Some(open) => self
                .provider
                .send(&mut open.handle, data)
                .await
                .map_err(ErrorDescriptor::from),
            None => Err(ErrorDescriptor::precondition("channel not open")),
        };
        self.record(outcome)
    }

    /// Fetch `remote` into `local` over sftp
    pub async fn download(&mut self, remote: &str, local: &Path) -> Outcome<u64> {
        let outcome = match self.sftp.as_ref() {
            Some(sftp) => self
                .provider
                .download(sftp, remote, local)
                .await
                .map_err(ErrorDescriptor::from),
            None => Err(ErrorDescriptor::precondition("sftp channel is not open.")),
        };
        self.record(outcome)
    }

    /// Send `local` to `remote` over sftp
    pub async fn upload(&mut self, local: &Path, remote: &str) -> Outcome<u64> {
        let outcome = match self.sftp.as_ref() {
            Some(sftp) => self
                .provider
                .upload(sftp, local, remote)
                .await
                .map_err(ErrorDescriptor::from),
            None => Err(ErrorDescriptor::precondition("sftp channel is not open.")),
        };
        self.record(outcome)
    }
}

impl<R: EndpointResolver, P: TransportProvider> std::fmt::Debug for ConnectionManager<R, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("endpoint", &self.endpoint)
            .field("timeouts", &self.timeouts)
            .field("channel", &self.channel.as_ref().map(|open| open.kind))
            .field("sftp", &self.sftp.is_some())
            .field("last_error", &self.last_error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::{FakeFailure, FakeProvider, StaticResolver};
    use crate::connection::level::MemoryLevelControl;
    use crate::error::ErrorKind;

    type FakeManager = ConnectionManager<StaticResolver, FakeProvider>;

    fn manager() -> (FakeManager, FakeProvider) {
        let provider = FakeProvider::new();
        let manager = ConnectionManager::new(
            StaticResolver::host1(),
            provider.clone(),
            Box::new(MemoryLevelControl::new(DebugLevel::Warning)),
        );
        (manager, provider)
    }

    async fn at_transport() -> (FakeManager, FakeProvider) {
        let (mut manager, provider) = manager();
        manager.open_socket("host1", Some(22)).await.unwrap();
        manager.open_session().await.unwrap();
        manager.open_transport().await.unwrap();
        (manager, provider)
    }

    #[tokio::test]
    async fn test_unknown_host_is_resolution_failure() {
        let (mut manager, provider) = manager();

        let err = manager.open_socket("unknownhost", None).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ResolutionFailure);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.last_error(), Some(&err));
        assert!(manager.endpoint().is_none());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_channel_before_transport_is_rejected() {
        let (mut manager, provider) = manager();
        manager.open_socket("host1", Some(22)).await.unwrap();
        assert_eq!(manager.state(), ConnectionState::SocketOpen);

        let err = manager.open_channel(ChannelKind::Session).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        assert_eq!(manager.state(), ConnectionState::SocketOpen);
        assert!(provider.calls_to("open_channel").is_empty());
    }

    #[tokio::test]
    async fn test_full_chain_to_sftp() {
        let (mut manager, _provider) = at_transport().await;

        manager.open_sftp().await.unwrap();

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::TransportOpen);
        assert!(status.sftp);
        assert_eq!(status.channel, None);
        assert!(status.socket && status.session && status.transport);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn test_close_runs_in_reverse_order() {
        let (mut manager, provider) = at_transport().await;
        manager.open_sftp().await.unwrap();
        provider.clear_calls();

        manager.close().await;

        assert_eq!(
            provider.calls(),
            vec![
                "close_sftp",
                "close_transport",
                "close_session",
                "close_socket"
            ]
        );
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(!status.socket && !status.session && !status.transport && !status.sftp);
        assert_eq!(status.channel, None);
        assert_eq!(status.endpoint, None);
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn test_close_includes_channel_when_present() {
        let (mut manager, provider) = at_transport().await;
        manager.open_channel(ChannelKind::Session).await.unwrap();
        manager.open_sftp().await.unwrap();
        provider.clear_calls();

        manager.close().await;

        assert_eq!(
            provider.calls(),
            vec![
                "close_sftp",
                "close_channel",
                "close_transport",
                "close_session",
                "close_socket"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_timeout_leaves_socket_open() {
        let (mut manager, provider) = manager();
        manager.set_timeout(TimeoutStage::Auth, 5.0).unwrap();
        provider.stall("authenticate", Duration::from_secs(6));
        manager.open_socket("host1", Some(22)).await.unwrap();

        let err = manager.open_session().await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
        assert_eq!(err.detail, "auth timeout of 5 seconds exceeded.");
        assert_eq!(manager.state(), ConnectionState::SocketOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tcp_timeout_keeps_disconnected_and_drops_endpoint() {
        let (mut manager, provider) = manager();
        provider.stall("connect_socket", Duration::from_secs(3));

        let err = manager.open_socket("host1", None).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.endpoint().is_none());
    }

    #[tokio::test]
    async fn test_refused_connect_is_provider_failure() {
        let (mut manager, provider) = manager();
        provider.fail("connect_socket", FakeFailure::Refused("connection refused"));

        let err = manager.open_socket("host1", None).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::ProviderFailure);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_session_can_be_retried_without_reconnecting() {
        let (mut manager, provider) = manager();
        provider.fail("authenticate", FakeFailure::AuthRejected("bad password"));
        manager.open_socket("host1", None).await.unwrap();

        let err = manager.open_session().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AuthenticationRejected);
        assert_eq!(manager.state(), ConnectionState::SocketOpen);

        provider.heal("authenticate");
        manager.set_password(Some("right".to_string()));
        manager.open_session().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::SessionEstablished);
        assert_eq!(manager.last_error(), None);
        assert_eq!(provider.calls_to("connect_socket").len(), 1);
        assert_eq!(
            provider.calls_to("authenticate"),
            vec![
                "authenticate(ops with identity file /home/ops/.ssh/id_ed25519)",
                "authenticate(ops with password)"
            ]
        );
    }

    #[tokio::test]
    async fn test_bad_auth_type_is_authentication_rejected() {
        let (mut manager, provider) = manager();
        provider.fail("authenticate", FakeFailure::BadAuthType("no usable key"));
        manager.open_socket("host1", None).await.unwrap();

        let err = manager.open_session().await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::AuthenticationRejected);
    }

    #[tokio::test]
    async fn test_port_override_reaches_provider() {
        let (mut manager, provider) = manager();

        manager.open_socket("host1", Some(2222)).await.unwrap();

        assert_eq!(
            provider.calls(),
            vec!["connect_socket(af_inet stream 10.0.0.1:2222)"]
        );
        assert_eq!(manager.endpoint().map(|e| e.port), Some(2222));
    }

    #[tokio::test]
    async fn test_unknown_channel_kind_makes_no_provider_calls() {
        let (mut manager, provider) = at_transport().await;
        provider.clear_calls();

        let err = manager.open_channel_named("bogus").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        assert!(provider.calls().is_empty());
        assert_eq!(manager.status().channel, None);
    }

    #[tokio::test]
    async fn test_channel_and_sftp_are_independent_siblings() {
        let (mut manager, _provider) = at_transport().await;

        manager.open_channel_named("direct").await.unwrap();
        manager.open_sftp().await.unwrap();

        let status = manager.status();
        assert_eq!(status.state, ConnectionState::TransportOpen);
        assert_eq!(status.channel, Some(ChannelKind::DirectTcpip));
        assert!(status.sftp);
    }

    #[tokio::test]
    async fn test_reopening_lower_stage_is_rejected() {
        let (mut manager, provider) = at_transport().await;
        provider.clear_calls();

        let socket = manager.open_socket("host1", None).await.unwrap_err();
        let session = manager.open_session().await.unwrap_err();
        let transport = manager.open_transport().await.unwrap_err();

        for err in [socket, session, transport] {
            assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        }
        assert!(provider.calls().is_empty());
        assert_eq!(manager.state(), ConnectionState::TransportOpen);
    }

    #[tokio::test]
    async fn test_second_channel_is_rejected() {
        let (mut manager, provider) = at_transport().await;
        manager.open_channel(ChannelKind::Session).await.unwrap();

        let err = manager.open_channel(ChannelKind::X11).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        assert_eq!(provider.calls_to("open_channel").len(), 1);
        assert_eq!(manager.status().channel, Some(ChannelKind::Session));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut manager, provider) = manager();

        manager.close().await;
        let first = manager.status();
        manager.close().await;
        let second = manager.status();

        assert_eq!(first, second);
        assert_eq!(second.state, ConnectionState::Disconnected);
        assert_eq!(second.last_error, None);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_close_continues_past_failing_step() {
        let (mut manager, provider) = at_transport().await;
        provider.fail("close_transport", FakeFailure::Refused("already gone"));
        provider.clear_calls();

        manager.close().await;

        assert_eq!(
            provider.calls(),
            vec!["close_transport", "close_session", "close_socket"]
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.last_error(), None);
    }

    #[tokio::test]
    async fn test_reconnect_after_close() {
        let (mut manager, _provider) = at_transport().await;
        manager.close().await;

        manager.open_socket("host1", None).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::SocketOpen);
    }

    #[tokio::test]
    async fn test_success_clears_stale_error() {
        let (mut manager, _provider) = manager();
        manager.open_session().await.unwrap_err();
        assert!(manager.last_error().is_some());

        manager.open_socket("host1", None).await.unwrap();

        assert_eq!(manager.last_error(), None);
    }

    #[tokio::test]
    async fn test_ordering_holds_for_every_operation_sequence() {
        // Walk every sequence of four stage operations and check that the
        // provider only ever sees an operation when its required state held.
        const OPS: [Stage; 5] = [
            Stage::Socket,
            Stage::Session,
            Stage::Transport,
            Stage::Channel,
            Stage::Sftp,
        ];
        let close = OPS.len();

        let mut sequences: Vec<Vec<usize>> = vec![vec![]];
        for _ in 0..4 {
            sequences = sequences
                .into_iter()
                .flat_map(|seq| {
                    (0..=close).map(move |op| {
                        let mut next = seq.clone();
                        next.push(op);
                        next
                    })
                })
                .collect();
        }

        for seq in sequences {
            let (mut manager, provider) = manager();
            for &op in &seq {
                if op == close {
                    manager.close().await;
                    continue;
                }
                let stage = OPS[op];
                let before = manager.state();
                let calls_before = provider.calls().len();
                let outcome = match stage {
                    Stage::Socket => manager.open_socket("host1", None).await,
                    Stage::Session => manager.open_session().await,
                    Stage::Transport => manager.open_transport().await,
                    Stage::Channel => manager.open_channel(ChannelKind::Session).await,
                    Stage::Sftp => manager.open_sftp().await,
                };
                let attempted = provider.calls().len() > calls_before;
                if attempted {
                    assert_eq!(before, stage.requires(), "sequence {:?}", seq);
                }
                if before != stage.requires() {
                    assert!(outcome.is_err(), "sequence {:?}", seq);
                    assert_eq!(manager.state(), before);
                }
                assert_eq!(outcome.is_err(), manager.last_error().is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_socket_settings_locked_while_open() {
        let (mut manager, _provider) = manager();
        manager.set_socket_domain(SocketDomain::Unix).unwrap();
        manager.set_socket_domain(SocketDomain::Inet).unwrap();
        manager.open_socket("host1", None).await.unwrap();

        let err = manager.set_socket_type(SocketType::Dgram).unwrap_err();

        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        assert_eq!(manager.socket_type(), SocketType::Stream);
    }

    #[tokio::test]
    async fn test_blocking_toggle_and_raw_io() {
        let (mut manager, provider) = manager();
        assert!(manager.unblock().is_err());
        manager.open_socket("host1", None).await.unwrap();

        manager.unblock().unwrap();
        assert!(!manager.is_blocking());
        assert_eq!(manager.write(b"SSH-2.0-beachhead\r\n").await.unwrap(), 19);
        let data = manager.read(4).await.unwrap();

        assert_eq!(data, b"SSH-");
        assert_eq!(provider.calls_to("read"), vec!["read(4, blocking=false)"]);

        manager.block().unwrap();
        assert!(manager.is_blocking());
    }

    #[tokio::test]
    async fn test_exec_consumes_session_channel() {
        let (mut manager, _provider) = at_transport().await;
        manager.open_channel(ChannelKind::Session).await.unwrap();

        let output = manager.exec("uptime").await.unwrap();

        assert_eq!(output.stdout, "ran uptime\n");
        assert_eq!(manager.status().channel, None);
        let err = manager.exec("uptime").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
    }

    #[tokio::test]
    async fn test_exec_refuses_non_session_channel() {
        let (mut manager, _provider) = at_transport().await;
        manager.open_channel(ChannelKind::X11).await.unwrap();

        let err = manager.exec("uptime").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        assert_eq!(manager.status().channel, Some(ChannelKind::X11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exec_timeout() {
        let (manager, provider) = at_transport().await;
        let mut manager = manager.with_exec_timeout(Duration::from_secs(2));
        provider.stall("exec", Duration::from_secs(10));
        manager.open_channel(ChannelKind::Session).await.unwrap();

        let err = manager.exec("sleep 10").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::TimeoutExceeded);
    }

    #[tokio::test]
    async fn test_transfers_need_sftp() {
        let (mut manager, _provider) = at_transport().await;
        let err = manager
            .download("/etc/hostname", Path::new("hostname"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionViolation);

        manager.open_sftp().await.unwrap();
        let bytes = manager
            .download("/etc/hostname", Path::new("hostname"))
            .await
            .unwrap();
        assert_eq!(bytes, 13);
    }

    #[tokio::test]
    async fn test_debug_level_get_set() {
        let (mut manager, _provider) = manager();
        assert_eq!(manager.debug_level(None), Ok(DebugLevel::Warning));

        assert_eq!(manager.debug_level(Some("debug")), Ok(DebugLevel::Debug));
        assert_eq!(manager.status().debug_level, DebugLevel::Debug);

        let err = manager.debug_level(Some("loud")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        assert_eq!(manager.status().debug_level, DebugLevel::Debug);
        assert_eq!(manager.last_error(), Some(&err));
    }

    #[tokio::test]
    async fn test_debug_level_query_clears_stale_error() {
        let (mut manager, _provider) = manager();
        manager.open_socket("nowhere", None).await.unwrap_err();

        assert_eq!(manager.debug_level(None), Ok(DebugLevel::Warning));
        assert_eq!(manager.last_error(), None);
    }

    #[tokio::test]
    async fn test_oversized_read_is_refused_before_the_provider() {
        let (mut manager, provider) = manager();
        manager.open_socket("host1", None).await.unwrap();

        for size in [0, MAX_READ_SIZE + 1, usize::MAX] {
            let err = manager.read(size).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::PreconditionViolation);
        }
        assert!(provider.calls_to("read").is_empty());
        assert_eq!(manager.state(), ConnectionState::SocketOpen);

        assert!(manager.read(MAX_READ_SIZE).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_lines_when_disconnected() {
        let (manager, _provider) = manager();
        let lines = manager.status().lines();
        assert_eq!(lines[0], "debug level: WARNING (30)");
        assert_eq!(lines[1], "not connected.");
        assert_eq!(lines.len(), 3);
    }

    #[tokio::test]
    async fn test_status_lines_show_error_while_disconnected() {
        let (mut manager, _provider) = manager();
        let err = manager.open_socket("nowhere", None).await.unwrap_err();

        let lines = manager.status().lines();

        assert_eq!(lines[1], "not connected.");
        assert_eq!(lines.last(), Some(&format!("last error:  {}", err)));
    }

    #[tokio::test]
    async fn test_status_lines_when_connected() {
        let (manager, _provider) = at_transport().await;
        let lines = manager.status().lines();
        assert!(lines.contains(&"remote end:  ops@10.0.0.1:22 (identity file /home/ops/.ssh/id_ed25519)".to_string()));
        assert!(lines.contains(&"transport:   open".to_string()));
        assert!(lines.contains(&"sftp layer:  none".to_string()));
    }
}
