//! russh-backed transport provider
//!
//! Sockets are plain tokio sockets until a session is authenticated over
//! them; at that point the stream moves into russh and raw I/O on the
//! socket handle stops working. A handshake whose authentication is refused
//! stays on the socket for the next attempt. A stream lost in a failed
//! handshake is redialed to the same peer.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::Channel;
use russh_sftp::client::SftpSession;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket, UnixStream};
use tokio::time::timeout;
use tracing::{debug, info};

use super::command::{run_on_channel, CommandOutput};
use super::handler::SshHandler;
use crate::connection::{
    ChannelKind, Credential, Endpoint, ProviderError, ProviderResult, SocketDomain, SocketType,
    TransportProvider,
};

/// Where a socket was connected, kept so a spent stream can be redialed
#[derive(Debug, Clone)]
enum Target {
    Tcp(SocketAddr),
    Unix(PathBuf),
    Udp(SocketAddr),
}

impl Target {
    async fn dial(&self) -> ProviderResult<SocketStream> {
        let stream = match self {
            Target::Tcp(addr) => SocketStream::Tcp(TcpStream::connect(addr).await?),
            Target::Unix(path) => SocketStream::Unix(UnixStream::connect(path).await?),
            Target::Udp(addr) => {
                let local = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                SocketStream::Udp(socket)
            }
        };
        Ok(stream)
    }
}

enum SocketStream {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp(UdpSocket),
}

/// A connected socket.
///
/// Holds either the raw stream, or a completed handshake waiting for
/// credentials, or nothing once a session owns the connection.
pub struct RusshSocket {
    peer: String,
    target: Target,
    stream: Option<SocketStream>,
    handshake: Option<Handle<SshHandler>>,
    in_session: bool,
}

impl RusshSocket {
    /// Whether raw reads and writes still reach the socket
    pub fn is_raw(&self) -> bool {
        self.stream.is_some()
    }

    fn stream(&mut self) -> ProviderResult<&mut SocketStream> {
        let reason = if self.in_session {
            "socket is owned by the ssh session"
        } else if self.handshake.is_some() {
            "socket carries an ssh handshake awaiting authentication"
        } else {
            "socket stream was spent by a failed handshake"
        };
        self.stream
            .as_mut()
            .ok_or_else(|| ProviderError::refused(reason))
    }
}

impl std::fmt::Debug for RusshSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshSocket")
            .field("peer", &self.peer)
            .field("raw", &self.is_raw())
            .field("handshake", &self.handshake.is_some())
            .field("in_session", &self.in_session)
            .finish()
    }
}

/// Authenticated session; the transport is a second reference to it
pub type RusshSession = Arc<Handle<SshHandler>>;

/// [`TransportProvider`] speaking real SSH through russh and russh-sftp
#[derive(Clone)]
pub struct RusshProvider {
    config: Arc<client::Config>,
}

impl RusshProvider {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }
}

impl Default for RusshProvider {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve_addr(
    domain: SocketDomain,
    host: &str,
    port: u16,
) -> ProviderResult<std::net::SocketAddr> {
    let mut addrs = lookup_host((host, port)).await?;
    addrs
        .find(|addr| match domain {
            SocketDomain::Inet6 => addr.is_ipv6(),
            _ => addr.is_ipv4(),
        })
        .ok_or_else(|| ProviderError::refused(format!("no {} address for {}", domain, host)))
}

async fn load_identity(path: &Path) -> ProviderResult<russh::keys::PrivateKey> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        ProviderError::bad_auth_type(format!("cannot read {}: {}", path.display(), e))
    })?;
    let key = russh::keys::PrivateKey::from_openssh(content.as_bytes()).map_err(|e| {
        ProviderError::bad_auth_type(format!("Failed to parse private key: {}", e))
    })?;
    if key.is_encrypted() {
        return Err(ProviderError::bad_auth_type(format!(
            "{} is passphrase protected",
            path.display()
        )));
    }
    Ok(key)
}

fn sftp_error(e: russh_sftp::client::error::Error) -> ProviderError {
    ProviderError::protocol(format!("sftp: {}", e))
}

/// Exchange identification and keys over `stream`, bounded by the banner budget
async fn handshake<S>(
    config: Arc<client::Config>,
    stream: S,
    handler: SshHandler,
    banner_timeout: Duration,
) -> ProviderResult<Handle<SshHandler>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    timeout(banner_timeout, client::connect_stream(config, stream, handler))
        .await
        .map_err(|_| ProviderError::timeout("banner", banner_timeout))?
        .map_err(|e| ProviderError::protocol(format!("SSH handshake failed: {}", e)))
}

#[async_trait]
impl TransportProvider for RusshProvider {
    type Socket = RusshSocket;
    type Session = RusshSession;
    type Transport = RusshSession;
    type Channel = Channel<Msg>;
    type Sftp = SftpSession;

    async fn connect_socket(
        &self,
        domain: SocketDomain,
        socket_type: SocketType,
        host: &str,
        port: u16,
    ) -> ProviderResult<RusshSocket> {
        let peer = format!("{}:{}", host, port);
        let target = match (domain, socket_type) {
            (SocketDomain::Unix, SocketType::Stream) => Target::Unix(PathBuf::from(host)),
            (SocketDomain::Inet | SocketDomain::Inet6, SocketType::Stream) => {
                Target::Tcp(resolve_addr(domain, host, port).await?)
            }
            (SocketDomain::Inet | SocketDomain::Inet6, SocketType::Dgram) => {
                Target::Udp(resolve_addr(domain, host, port).await?)
            }
            (domain, socket_type) => {
                return Err(ProviderError::refused(format!(
                    "{} sockets are not supported in {}",
                    socket_type, domain
                )))
            }
        };
        let stream = target.dial().await?;
        debug!("{} {} socket connected to {}", domain, socket_type, peer);
        Ok(RusshSocket {
            peer,
            target,
            stream: Some(stream),
            handshake: None,
            in_session: false,
        })
    }

    async fn authenticate(
        &self,
        socket: &mut RusshSocket,
        endpoint: &Endpoint,
        credential: &Credential,
        banner_timeout: Duration,
    ) -> ProviderResult<RusshSession> {
        let key = match credential {
            Credential::IdentityFile(path) => Some(load_identity(path).await?),
            Credential::Password(_) => None,
        };

        if socket.in_session {
            return Err(ProviderError::refused("socket already carries a session"));
        }

        let mut handle = match socket.handshake.take() {
            Some(handle) => {
                debug!("Reusing the handshake with {}", socket.peer);
                handle
            }
            None => {
                let stream = match socket.stream.take() {
                    Some(stream) => stream,
                    None => {
                        debug!("Stream to {} was spent, redialing", socket.peer);
                        socket.target.dial().await?
                    }
                };
                let handler = SshHandler::new(endpoint.hostname.clone());
                let config = Arc::clone(&self.config);
                match stream {
                    SocketStream::Tcp(stream) => {
                        handshake(config, stream, handler, banner_timeout).await?
                    }
                    SocketStream::Unix(stream) => {
                        handshake(config, stream, handler, banner_timeout).await?
                    }
                    udp @ SocketStream::Udp(_) => {
                        socket.stream = Some(udp);
                        return Err(ProviderError::bad_auth_type("ssh needs a stream socket"));
                    }
                }
            }
        };

        let auth = match (credential, key) {
            (Credential::Password(password), _) => {
                debug!("Attempting password authentication for user '{}'", endpoint.user);
                handle.authenticate_password(&endpoint.user, password).await
            }
            (Credential::IdentityFile(_), Some(key)) => {
                debug!("Attempting key authentication for user '{}'", endpoint.user);
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg);
                handle.authenticate_publickey(&endpoint.user, key_with_alg).await
            }
            (Credential::IdentityFile(path), None) => {
                socket.handshake = Some(handle);
                return Err(ProviderError::bad_auth_type(format!(
                    "no key loaded from {}",
                    path.display()
                )));
            }
        };
        // The handle is dropped on a transport error; the next attempt redials
        let auth = auth.map_err(|e| ProviderError::protocol(e.to_string()))?;

        if !auth.success() {
            socket.handshake = Some(handle);
            return Err(ProviderError::auth_rejected(format!(
                "{} refused {} for {}",
                endpoint.hostname, credential, endpoint.user
            )));
        }
        socket.in_session = true;
        info!("Authenticated to {} as {}", socket.peer, endpoint.user);
        Ok(Arc::new(handle))
    }

    async fn get_transport(&self, session: &RusshSession) -> ProviderResult<RusshSession> {
        Ok(Arc::clone(session))
    }

    async fn open_channel(
        &self,
        transport: &RusshSession,
        kind: ChannelKind,
        endpoint: &Endpoint,
    ) -> ProviderResult<Channel<Msg>> {
        let channel = match kind {
            ChannelKind::Session => transport.channel_open_session().await,
            ChannelKind::DirectTcpip => {
                transport
                    .channel_open_direct_tcpip("localhost", u32::from(endpoint.port), "127.0.0.1", 0)
                    .await
            }
            ChannelKind::X11 => transport.channel_open_x11("127.0.0.1", 0).await,
            ChannelKind::ForwardedTcpip => {
                return Err(ProviderError::refused(
                    "forwarded-tcpip channels are opened by the server",
                ))
            }
        };
        channel.map_err(|e| ProviderError::protocol(format!("Failed to open channel: {}", e)))
    }

    async fn open_sftp(&self, transport: &RusshSession) -> ProviderResult<SftpSession> {
        let channel = transport
            .channel_open_session()
            .await
            .map_err(|e| ProviderError::protocol(format!("Failed to open channel: {}", e)))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| ProviderError::protocol(format!("Failed to request sftp: {}", e)))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(sftp_error)
    }

    async fn read(
        &self,
        socket: &mut RusshSocket,
        max: usize,
        blocking: bool,
    ) -> ProviderResult<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let stream = socket.stream()?;
        let read = if blocking {
            match stream {
                SocketStream::Tcp(s) => s.read(&mut buf).await,
                SocketStream::Unix(s) => s.read(&mut buf).await,
                SocketStream::Udp(s) => s.recv(&mut buf).await,
            }
        } else {
            match stream {
                SocketStream::Tcp(s) => s.try_read(&mut buf),
                SocketStream::Unix(s) => s.try_read(&mut buf),
                SocketStream::Udp(s) => s.try_recv(&mut buf),
            }
        };
        let n = match read {
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);
        Ok(buf)
    }

    async fn write(&self, socket: &mut RusshSocket, data: &[u8]) -> ProviderResult<usize> {
        match socket.stream()? {
            SocketStream::Tcp(s) => s.write_all(data).await?,
            SocketStream::Unix(s) => s.write_all(data).await?,
            SocketStream::Udp(s) => {
                s.send(data).await?;
            }
        }
        Ok(data.len())
    }

    async fn exec(&self, channel: Channel<Msg>, command: &str) -> ProviderResult<CommandOutput> {
        run_on_channel(channel, command).await
    }

    async fn send(&self, channel: &mut Channel<Msg>, data: &[u8]) -> ProviderResult<usize> {
        channel
            .data(data)
            .await
            .map_err(|e| ProviderError::protocol(format!("Failed to send data: {}", e)))?;
        Ok(data.len())
    }

    async fn download(&self, sftp: &SftpSession, remote: &str, local: &Path) -> ProviderResult<u64> {
        let mut source = sftp.open(remote).await.map_err(sftp_error)?;
        let mut target = fs::File::create(local).await?;
        let copied = tokio::io::copy(&mut source, &mut target).await?;
        target.flush().await?;
        Ok(copied)
    }

    async fn upload(&self, sftp: &SftpSession, local: &Path, remote: &str) -> ProviderResult<u64> {
        let mut source = fs::File::open(local).await?;
        let mut target = sftp.create(remote).await.map_err(sftp_error)?;
        let copied = tokio::io::copy(&mut source, &mut target).await?;
        target.shutdown().await?;
        Ok(copied)
    }

    async fn close_sftp(&self, sftp: SftpSession) -> ProviderResult<()> {
        sftp.close().await.map_err(sftp_error)
    }

    async fn close_channel(&self, channel: Channel<Msg>) -> ProviderResult<()> {
        if let Err(e) = channel.eof().await {
            debug!("sending eof before close failed: {}", e);
        }
        channel
            .close()
            .await
            .map_err(|e| ProviderError::protocol(e.to_string()))
    }

    async fn close_transport(&self, transport: RusshSession) -> ProviderResult<()> {
        drop(transport);
        Ok(())
    }

    async fn close_session(&self, session: RusshSession) -> ProviderResult<()> {
        session
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await
            .map_err(|e| ProviderError::protocol(e.to_string()))
    }

    async fn close_socket(&self, mut socket: RusshSocket) -> ProviderResult<()> {
        if let Some(handle) = socket.handshake.take() {
            handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await
                .map_err(|e| ProviderError::protocol(e.to_string()))?;
        }
        match socket.stream.take() {
            Some(SocketStream::Tcp(mut s)) => s.shutdown().await?,
            Some(SocketStream::Unix(mut s)) => s.shutdown().await?,
            Some(SocketStream::Udp(_)) | None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Accepts connections and either holds them without a word or drops them at once
    async fn counting_listener(hang_up: bool) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                if !hang_up {
                    held.push(stream);
                }
            }
        });
        (port, accepted)
    }

    fn password_endpoint(port: u16) -> (Endpoint, Credential) {
        let credential = Credential::Password("hunter2".to_string());
        let endpoint = Endpoint::new("127.0.0.1", port, "ops", credential.clone());
        (endpoint, credential)
    }

    async fn echo_listener() -> (u16, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });
        (port, task)
    }

    #[tokio::test]
    async fn test_raw_tcp_round_trip() {
        let (port, task) = echo_listener().await;
        let provider = RusshProvider::new();

        let mut socket = provider
            .connect_socket(SocketDomain::Inet, SocketType::Stream, "127.0.0.1", port)
            .await
            .unwrap();
        assert!(format!("{:?}", socket).contains(&format!("127.0.0.1:{}", port)));

        assert_eq!(provider.write(&mut socket, b"ping").await.unwrap(), 4);
        let echoed = provider.read(&mut socket, 16, true).await.unwrap();
        assert_eq!(echoed, b"ping");

        provider.close_socket(socket).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_nonblocking_read_with_nothing_pending() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let provider = RusshProvider::new();

        let mut socket = provider
            .connect_socket(SocketDomain::Inet, SocketType::Stream, "127.0.0.1", port)
            .await
            .unwrap();
        let (_peer, _) = listener.accept().await.unwrap();

        let data = provider.read(&mut socket, 16, false).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_raw_sockets_are_refused() {
        let provider = RusshProvider::new();
        let err = provider
            .connect_socket(SocketDomain::Inet, SocketType::Raw, "127.0.0.1", 22)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Refused(_)));
    }

    #[tokio::test]
    async fn test_closed_port_is_provider_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let provider = RusshProvider::new();
        let err = provider
            .connect_socket(SocketDomain::Inet, SocketType::Stream, "127.0.0.1", port)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Io(_)));
    }

    #[tokio::test]
    async fn test_missing_identity_is_bad_auth_type() {
        let (port, _task) = echo_listener().await;
        let provider = RusshProvider::new();
        let mut socket = provider
            .connect_socket(SocketDomain::Inet, SocketType::Stream, "127.0.0.1", port)
            .await
            .unwrap();
        let credential = Credential::IdentityFile("/nonexistent/id_ed25519".into());
        let endpoint = Endpoint::new("127.0.0.1", port, "ops", credential.clone());

        let err = provider
            .authenticate(&mut socket, &endpoint, &credential, Duration::from_secs(1))
            .await
            .err().unwrap();

        assert!(matches!(err, ProviderError::BadAuthType(_)));
        assert!(socket.is_raw());
    }

    #[tokio::test]
    async fn test_silent_server_times_out_and_session_can_be_retried() {
        let (port, accepted) = counting_listener(false).await;
        let provider = RusshProvider::new();
        let mut socket = provider
            .connect_socket(SocketDomain::Inet, SocketType::Stream, "127.0.0.1", port)
            .await
            .unwrap();
        let (endpoint, credential) = password_endpoint(port);
        let banner = Duration::from_millis(200);

        let err = provider
            .authenticate(&mut socket, &endpoint, &credential, banner)
            .await
            .err().unwrap();
        assert!(matches!(err, ProviderError::Timeout { stage: "banner", .. }));
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        let err = provider.write(&mut socket, b"x").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "refused: socket stream was spent by a failed handshake"
        );

        let err = provider
            .authenticate(&mut socket, &endpoint, &credential, banner)
            .await
            .err().unwrap();
        assert!(matches!(err, ProviderError::Timeout { stage: "banner", .. }));
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        provider.close_socket(socket).await.unwrap();
    }

    #[tokio::test]
    async fn test_hang_up_during_handshake_is_retried_on_a_fresh_stream() {
        let (port, accepted) = counting_listener(true).await;
        let provider = RusshProvider::new();
        let mut socket = provider
            .connect_socket(SocketDomain::Inet, SocketType::Stream, "127.0.0.1", port)
            .await
            .unwrap();
        let (endpoint, credential) = password_endpoint(port);
        let banner = Duration::from_secs(2);

        for attempt in 1..=2 {
            let err = provider
                .authenticate(&mut socket, &endpoint, &credential, banner)
                .await
                .err().unwrap();
            assert!(matches!(err, ProviderError::Protocol(_)), "{}", err);
            assert_eq!(accepted.load(Ordering::SeqCst), attempt);
            assert!(!socket.is_raw());
        }
    }

    #[tokio::test]
    async fn test_datagram_socket_stays_raw_after_session_attempt() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = peer.local_addr().unwrap().port();
        let provider = RusshProvider::new();
        let mut socket = provider
            .connect_socket(SocketDomain::Inet, SocketType::Dgram, "127.0.0.1", port)
            .await
            .unwrap();
        let (endpoint, credential) = password_endpoint(port);

        let err = provider
            .authenticate(&mut socket, &endpoint, &credential, Duration::from_secs(1))
            .await
            .err().unwrap();
        assert!(matches!(err, ProviderError::BadAuthType(_)));
        assert!(socket.is_raw());
        assert_eq!(provider.write(&mut socket, b"ping").await.unwrap(), 4);
    }
}
