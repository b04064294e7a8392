//! Scripted collaborators for exercising the manager without a network.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::endpoint::{Credential, Endpoint, EndpointResolver};
use super::provider::{ProviderError, ProviderResult, TransportProvider};
use super::state::{ChannelKind, SocketDomain, SocketType};
use crate::ssh::CommandOutput;

/// Resolver backed by a fixed table
#[derive(Debug, Default, Clone)]
pub(crate) struct StaticResolver {
    hosts: HashMap<String, Endpoint>,
}

impl StaticResolver {
    pub(crate) fn with_host(mut self, name: &str, endpoint: Endpoint) -> Self {
        self.hosts.insert(name.to_string(), endpoint);
        self
    }

    /// `host1` -> ops@10.0.0.1:22 with an identity file
    pub(crate) fn host1() -> Self {
        Self::default().with_host(
            "host1",
            Endpoint::new(
                "10.0.0.1",
                22,
                "ops",
                Credential::IdentityFile(PathBuf::from("/home/ops/.ssh/id_ed25519")),
            ),
        )
    }
}

impl EndpointResolver for StaticResolver {
    fn resolve(&self, name: &str) -> Option<Endpoint> {
        self.hosts.get(name).cloned()
    }

    fn known_hosts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosts.keys().cloned().collect();
        names.sort();
        names
    }
}

/// How a scripted operation should fail
#[derive(Debug, Clone, Copy)]
pub(crate) enum FakeFailure {
    Refused(&'static str),
    AuthRejected(&'static str),
    BadAuthType(&'static str),
}

impl FakeFailure {
    fn to_error(self) -> ProviderError {
        match self {
            FakeFailure::Refused(msg) => ProviderError::refused(msg),
            FakeFailure::AuthRejected(msg) => ProviderError::auth_rejected(msg),
            FakeFailure::BadAuthType(msg) => ProviderError::bad_auth_type(msg),
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    calls: Vec<String>,
    failures: HashMap<&'static str, FakeFailure>,
    delays: HashMap<&'static str, Duration>,
    inbox: Vec<u8>,
    next_id: u32,
}

/// Opaque handle handed out by [`FakeProvider`]
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FakeHandle {
    pub(crate) id: u32,
    pub(crate) stage: &'static str,
}

/// Provider that records every call and can be told to fail or stall.
///
/// Clones share one script, so a test can keep a clone after moving the
/// provider into a manager.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakeProvider {
    script: Arc<Mutex<Script>>,
}

impl FakeProvider {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Every call made so far, e.g. `connect_socket(10.0.0.1:22)`
    pub(crate) fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Calls whose name starts with `prefix`
    pub(crate) fn calls_to(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with(prefix))
            .collect()
    }

    pub(crate) fn clear_calls(&self) {
        self.script.lock().unwrap().calls.clear();
    }

    pub(crate) fn fail(&self, op: &'static str, failure: FakeFailure) {
        self.script.lock().unwrap().failures.insert(op, failure);
    }

    pub(crate) fn heal(&self, op: &'static str) {
        self.script.lock().unwrap().failures.remove(op);
    }

    pub(crate) fn stall(&self, op: &'static str, delay: Duration) {
        self.script.lock().unwrap().delays.insert(op, delay);
    }

    async fn enter(&self, op: &'static str, call: String) -> ProviderResult<FakeHandle> {
        let (delay, failure, id) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            script.next_id += 1;
            (
                script.delays.get(op).copied(),
                script.failures.get(op).copied(),
                script.next_id,
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(failure) => Err(failure.to_error()),
            None => Ok(FakeHandle { id, stage: op }),
        }
    }
}

#[async_trait]
impl TransportProvider for FakeProvider {
    type Socket = FakeHandle;
    type Session = FakeHandle;
    type Transport = FakeHandle;
    type Channel = FakeHandle;
    type Sftp = FakeHandle;

    async fn connect_socket(
        &self,
        domain: SocketDomain,
        socket_type: SocketType,
        host: &str,
        port: u16,
    ) -> ProviderResult<FakeHandle> {
        self.enter(
            "connect_socket",
            format!("connect_socket({} {} {}:{})", domain, socket_type, host, port),
        )
        .await
    }

    async fn authenticate(
        &self,
        _socket: &mut FakeHandle,
        endpoint: &Endpoint,
        credential: &Credential,
        _banner_timeout: Duration,
    ) -> ProviderResult<FakeHandle> {
        self.enter(
            "authenticate",
            format!("authenticate({} with {})", endpoint.user, credential),
        )
        .await
    }

    async fn get_transport(&self, _session: &FakeHandle) -> ProviderResult<FakeHandle> {
        self.enter("get_transport", "get_transport".to_string()).await
    }

    async fn open_channel(
        &self,
        _transport: &FakeHandle,
        kind: ChannelKind,
        _endpoint: &Endpoint,
    ) -> ProviderResult<FakeHandle> {
        self.enter("open_channel", format!("open_channel({})", kind))
            .await
    }

    async fn open_sftp(&self, _transport: &FakeHandle) -> ProviderResult<FakeHandle> {
        self.enter("open_sftp", "open_sftp".to_string()).await
    }

    async fn read(
        &self,
        _socket: &mut FakeHandle,
        max: usize,
        blocking: bool,
    ) -> ProviderResult<Vec<u8>> {
        self.enter("read", format!("read({}, blocking={})", max, blocking))
            .await?;
        let mut script = self.script.lock().unwrap();
        let take = max.min(script.inbox.len());
        Ok(script.inbox.drain(..take).collect())
    }

    /// Written bytes are looped back to the next read
    async fn write(&self, _socket: &mut FakeHandle, data: &[u8]) -> ProviderResult<usize> {
        self.enter("write", format!("write({})", data.len())).await?;
        self.script.lock().unwrap().inbox.extend_from_slice(data);
        Ok(data.len())
    }

    async fn exec(&self, _channel: FakeHandle, command: &str) -> ProviderResult<CommandOutput> {
        self.enter("exec", format!("exec({})", command)).await?;
        Ok(CommandOutput {
            stdout: format!("ran {}\n", command),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    async fn send(&self, _channel: &mut FakeHandle, data: &[u8]) -> ProviderResult<usize> {
        self.enter("send", format!("send({})", data.len())).await?;
        Ok(data.len())
    }

    async fn download(&self, _sftp: &FakeHandle, remote: &str, local: &Path) -> ProviderResult<u64> {
        self.enter(
            "download",
            format!("download({} -> {})", remote, local.display()),
        )
        .await?;
        Ok(remote.len() as u64)
    }

    async fn upload(&self, _sftp: &FakeHandle, local: &Path, remote: &str) -> ProviderResult<u64> {
        self.enter("upload", format!("upload({} -> {})", local.display(), remote))
            .await?;
        Ok(remote.len() as u64)
    }

    async fn close_sftp(&self, _sftp: FakeHandle) -> ProviderResult<()> {
        self.enter("close_sftp", "close_sftp".to_string()).await?;
        Ok(())
    }

    async fn close_channel(&self, _channel: FakeHandle) -> ProviderResult<()> {
        self.enter("close_channel", "close_channel".to_string())
            .await?;
        Ok(())
    }

    async fn close_transport(&self, _transport: FakeHandle) -> ProviderResult<()> {
        self.enter("close_transport", "close_transport".to_string())
            .await?;
        Ok(())
    }

    async fn close_session(&self, _session: FakeHandle) -> ProviderResult<()> {
        self.enter("close_session", "close_session".to_string())
            .await?;
        Ok(())
    }

    async fn close_socket(&self, _socket: FakeHandle) -> ProviderResult<()> {
        self.enter("close_socket", "close_socket".to_string())
            .await?;
        Ok(())
    }
}
