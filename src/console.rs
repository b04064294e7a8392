//! Interactive command dispatcher
//!
//! Turns one line of operator input into calls on a [`ConnectionManager`]
//! and a [`Reply`] to print. Stage commands report how long they took.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::connection::{
    ChannelKind, ConnectionManager, ConnectionState, EndpointResolver, SocketDomain, SocketType,
    TimeoutStage, TransportProvider,
};
use crate::error::Outcome;
use crate::ssh::{check_payload, sanitize_command};

/// Shown before every input line
pub const PROMPT: &str = "[beachhead]: ";

/// Bytes requested by `read` without an argument
pub const DEFAULT_READ_SIZE: usize = 4096;

const COMMANDS: &[(&str, &str)] = &[
    ("open", "open { socket <host> [port] | session | transport | channel [type] | sftp }"),
    ("close", "close -- tear down everything that is open"),
    ("status", "status [json] -- show the state of the connection"),
    ("debug", "debug [CRITICAL|ERROR|WARNING|INFO|DEBUG|NOTSET|50|40|30|20|10|0]"),
    ("error", "error [reset] -- show the last error, optionally clearing it"),
    ("settimeout", "settimeout [ { tcp | auth | banner } [seconds] ]"),
    ("setpass", "setpass [ <password> | none ] -- password for `open session`"),
    ("setsockdomain", "setsockdomain [ af_inet | af_inet6 | af_unix ]"),
    ("setsocktype", "setsocktype [ stream | dgram | raw ]"),
    ("hosts", "hosts -- names from the ssh config"),
    ("block", "block -- socket reads wait for data"),
    ("unblock", "unblock -- socket reads return at once"),
    ("read", "read [bytes] -- read from the raw socket"),
    ("write", "write <text> -- write to the raw socket"),
    ("do", "do <command> -- run a command over the session channel"),
    ("send", "send { file <path> | <text> } -- push bytes through the channel"),
    ("get", "get <remote path> -- fetch a file over sftp"),
    ("put", "put <local path> -- send a file over sftp"),
    ("general", "general -- how to use this thing"),
    ("version", "version"),
    ("help", "help [command]"),
    ("exit", "exit -- leave at once"),
    ("quit", "quit -- close everything, then leave"),
];

const GENERAL: &str = "\
beachhead walks an ssh connection up one layer at a time, so you can see
which layer fails and how long each one takes. The usual order is:

    hosts                     names you can connect to
    open socket <host> [port] tcp connection to the target
    setpass <password>        only if the key will not do
    open session              handshake and authentication
    open transport            the multiplexed layer everything else rides on

To run commands you need a channel, to move files an sftp layer:

    open channel
    open sftp

`status` shows what is open, `close` tears it all down.";

/// What a console command produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub ok: bool,
    pub lines: Vec<String>,
    /// The console loop should stop after printing this reply
    pub exit: bool,
}

impl Reply {
    pub fn ok(lines: Vec<String>) -> Self {
        Self {
            ok: true,
            lines,
            exit: false,
        }
    }

    pub fn fail(lines: Vec<String>) -> Self {
        Self {
            ok: false,
            lines,
            exit: false,
        }
    }

    fn line(ok: bool, line: impl Into<String>) -> Self {
        Self {
            ok,
            lines: vec![line.into()],
            exit: false,
        }
    }

    fn exit() -> Self {
        Self {
            ok: true,
            lines: Vec::new(),
            exit: true,
        }
    }
}

/// Render a duration as the console reports it
pub fn elapsed_time(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        format!("{:.3} milliseconds", secs * 1000.0)
    } else {
        format!("{:.3} seconds", secs)
    }
}

fn usage(command: &str) -> Option<&'static str> {
    COMMANDS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, usage)| *usage)
}

/// Render raw bytes: text as-is, anything else as decimal values, 16 per line
fn render_bytes(data: &[u8]) -> Vec<String> {
    let printable = data
        .iter()
        .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace());
    if printable {
        return String::from_utf8_lossy(data)
            .lines()
            .map(str::to_string)
            .collect();
    }
    data.chunks(16)
        .map(|chunk| {
            chunk
                .iter()
                .map(|b| format!("{:3}", b))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn file_name(path: &str) -> Option<String> {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

/// Console bound to one connection manager
pub struct Console<R: EndpointResolver, P: TransportProvider> {
    manager: ConnectionManager<R, P>,
    max_chars: Option<usize>,
}

impl<R: EndpointResolver, P: TransportProvider> Console<R, P> {
    pub fn new(manager: ConnectionManager<R, P>, max_chars: Option<usize>) -> Self {
        Self { manager, max_chars }
    }

    pub fn manager(&self) -> &ConnectionManager<R, P> {
        &self.manager
    }

    /// Tear down whatever is open
    pub async fn shutdown(&mut self) {
        self.manager.close().await;
    }

    /// Run one input line
    pub async fn execute(&mut self, line: &str) -> Reply {
        let line = line.trim();
        if line.is_empty() {
            return Reply::ok(Vec::new());
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        debug!("console command: {}", command);

        match command.to_lowercase().as_str() {
            "open" => self.open(rest).await,
            "close" => self.close().await,
            "status" => self.status(rest),
            "debug" => self.debug(rest),
            "error" => self.error(rest),
            "settimeout" => self.set_timeout(rest),
            "setpass" => self.set_password(rest),
            "setsockdomain" => self.set_socket_domain(rest),
            "setsocktype" => self.set_socket_type(rest),
            "hosts" => self.hosts(),
            "block" => self.simple(|m| m.block(), "reads now wait for data."),
            "unblock" => self.simple(|m| m.unblock(), "reads now return at once."),
            "read" => self.read(rest).await,
            "write" => self.write(rest).await,
            "do" => self.exec(rest).await,
            "send" => self.send(rest).await,
            "get" => self.get(rest).await,
            "put" => self.put(rest).await,
            "general" => Reply::ok(GENERAL.lines().map(str::to_string).collect()),
            "version" => Reply::line(true, format!("beachhead {}", env!("CARGO_PKG_VERSION"))),
            "help" => Self::help(rest),
            "exit" => Reply::exit(),
            "quit" => {
                self.manager.close().await;
                Reply::exit()
            }
            _ => {
                let mut reply = Self::help("");
                reply.ok = false;
                reply.lines.insert(0, format!("unknown command {}", line));
                reply
            }
        }
    }

    fn help(topic: &str) -> Reply {
        if topic.is_empty() {
            return Reply::ok(COMMANDS.iter().map(|(_, u)| u.to_string()).collect());
        }
        match usage(topic) {
            Some(text) => Reply::line(true, text),
            None => Reply::line(false, format!("no help for {}", topic)),
        }
    }

    /// Report a stage outcome followed by its elapsed time
    fn timed(outcome: Outcome<()>, started: Instant, success: &str) -> Reply {
        let elapsed = format!("elapsed time: {}", elapsed_time(started.elapsed()));
        match outcome {
            Ok(()) => Reply::ok(vec![success.to_string(), elapsed]),
            Err(err) => Reply::fail(vec![format!("failed {}", err), elapsed]),
        }
    }

    fn simple(
        &mut self,
        op: impl FnOnce(&mut ConnectionManager<R, P>) -> Outcome<()>,
        success: &str,
    ) -> Reply {
        match op(&mut self.manager) {
            Ok(()) => Reply::line(true, success),
            Err(err) => Reply::line(false, err.to_string()),
        }
    }

    async fn open(&mut self, rest: &str) -> Reply {
        let mut args = rest.split_whitespace();
        let Some(stage) = args.next() else {
            return Reply::line(false, usage("open").unwrap_or_default());
        };
        let args: Vec<&str> = args.collect();

        match stage.to_lowercase().as_str() {
            "socket" => {
                let Some(host) = args.first() else {
                    return Reply::line(false, "nothing to do.");
                };
                let port = match args.get(1).map(|p| p.parse::<u16>()) {
                    None => None,
                    Some(Ok(port)) => Some(port),
                    Some(Err(_)) => {
                        return Reply::line(false, format!("bad port: {}", args[1]));
                    }
                };
                let started = Instant::now();
                let outcome = self.manager.open_socket(host, port).await;
                Self::timed(outcome, started, "connected.")
            }
            "session" => {
                let started = Instant::now();
                let outcome = self.manager.open_session().await;
                Self::timed(outcome, started, "ssh session established.")
            }
            "transport" => {
                let started = Instant::now();
                let outcome = self.manager.open_transport().await;
                let mut reply = Self::timed(outcome, started, "success");
                reply
                    .lines
                    .insert(0, "attempting to create a transport layer".to_string());
                reply
            }
            "channel" => {
                let kind = args.first().copied().unwrap_or("session");
                let started = Instant::now();
                let outcome = self.manager.open_channel_named(kind).await;
                let mut reply = Self::timed(outcome, started, "success");
                reply.lines.insert(
                    0,
                    format!("attempting to create a channel of type {}", kind),
                );
                reply
            }
            "sftp" => {
                let started = Instant::now();
                let outcome = self.manager.open_sftp().await;
                let mut reply = Self::timed(outcome, started, "success");
                reply.lines.insert(0, "creating sftp client.".to_string());
                reply
            }
            other => Reply::line(false, format!("no operation named {}", other)),
        }
    }

    async fn close(&mut self) -> Reply {
        if self.manager.state() == ConnectionState::Disconnected {
            return Reply::line(true, "nothing to do");
        }
        self.manager.close().await;
        Reply::line(true, "connection closed.")
    }

    fn status(&self, rest: &str) -> Reply {
        let snapshot = self.manager.status();
        if rest.eq_ignore_ascii_case("json") {
            return match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => Reply::ok(json.lines().map(str::to_string).collect()),
                Err(e) => Reply::line(false, format!("cannot render status: {}", e)),
            };
        }
        Reply::ok(snapshot.lines())
    }

    fn debug(&mut self, rest: &str) -> Reply {
        let wanted = Some(rest).filter(|r| !r.is_empty());
        match self.manager.debug_level(wanted) {
            Ok(level) => Reply::line(true, format!("debug level is {}", level)),
            Err(err) => Reply::line(false, err.to_string()),
        }
    }

    fn error(&mut self, rest: &str) -> Reply {
        let line = match self.manager.last_error() {
            Some(err) => err.to_string(),
            None => "no error".to_string(),
        };
        let mut reply = Reply::line(true, line);
        if !rest.is_empty() {
            if "reset".starts_with(&rest.to_lowercase()) {
                self.manager.reset_error();
                reply.lines.push("error cleared.".to_string());
            } else {
                reply = Reply::fail(vec![usage("error").unwrap_or_default().to_string()]);
            }
        }
        reply
    }

    fn set_timeout(&mut self, rest: &str) -> Reply {
        let args: Vec<&str> = rest.split_whitespace().collect();
        match args.as_slice() {
            [] => Reply::line(true, self.manager.timeouts().to_string()),
            [stage] => match stage.parse::<TimeoutStage>() {
                Ok(stage) => Reply::line(
                    true,
                    format!(
                        "{} timeout: {} seconds",
                        stage,
                        self.manager.timeouts().get(stage).as_secs_f64()
                    ),
                ),
                Err(reason) => Reply::line(false, reason),
            },
            [stage, seconds, ..] => {
                let stage = match stage.parse::<TimeoutStage>() {
                    Ok(stage) => stage,
                    Err(reason) => return Reply::line(false, reason),
                };
                let Ok(seconds) = seconds.parse::<f64>() else {
                    return Reply::line(false, format!("bad value for timeout: {}", seconds));
                };
                match self.manager.set_timeout(stage, seconds) {
                    Ok(()) => Reply::line(true, self.manager.timeouts().to_string()),
                    Err(err) => Reply::line(false, err.to_string()),
                }
            }
        }
    }

    fn set_password(&mut self, rest: &str) -> Reply {
        if rest.is_empty() {
            let state = if self.manager.password_is_set() {
                "set"
            } else {
                "not set"
            };
            return Reply::line(true, format!("password is {}", state));
        }
        if rest.eq_ignore_ascii_case("none") {
            self.manager.set_password(None);
            return Reply::line(true, "password cleared.");
        }
        self.manager.set_password(Some(rest.to_string()));
        Reply::line(true, "password set.")
    }

    fn set_socket_domain(&mut self, rest: &str) -> Reply {
        if rest.is_empty() {
            return Reply::line(
                true,
                format!("socket domain is {}", self.manager.socket_domain()),
            );
        }
        match rest.parse::<SocketDomain>() {
            Ok(domain) => self.simple(|m| m.set_socket_domain(domain), "socket domain set."),
            Err(reason) => Reply::line(false, reason),
        }
    }

    fn set_socket_type(&mut self, rest: &str) -> Reply {
        if rest.is_empty() {
            return Reply::line(
                true,
                format!("socket type is {}", self.manager.socket_type()),
            );
        }
        match rest.parse::<SocketType>() {
            Ok(socket_type) => self.simple(|m| m.set_socket_type(socket_type), "socket type set."),
            Err(reason) => Reply::line(false, reason),
        }
    }

    fn hosts(&self) -> Reply {
        let hosts = self.manager.known_hosts();
        if hosts.is_empty() {
            return Reply::line(true, "no known hosts");
        }
        Reply::ok(hosts)
    }

    async fn read(&mut self, rest: &str) -> Reply {
        let size = if rest.is_empty() {
            DEFAULT_READ_SIZE
        } else {
            match rest.parse::<usize>() {
                Ok(size) if size > 0 => size,
                _ => return Reply::line(false, format!("bad read size: {}", rest)),
            }
        };
        match self.manager.read(size).await {
            Ok(data) if data.is_empty() => Reply::line(true, "nothing to read."),
            Ok(data) => Reply::ok(render_bytes(&data)),
            Err(err) => Reply::fail(vec![err.to_string(), "socket not readable.".to_string()]),
        }
    }

    async fn write(&mut self, rest: &str) -> Reply {
        if let Err(err) = check_payload(rest.as_bytes(), self.max_chars) {
            return Reply::line(false, err.detail);
        }
        match self.manager.write(rest.as_bytes()).await {
            Ok(n) => Reply::line(true, format!("wrote {} bytes to the socket.", n)),
            Err(err) => Reply::line(false, err.to_string()),
        }
    }

    async fn exec(&mut self, rest: &str) -> Reply {
        let command = match sanitize_command(rest, self.max_chars) {
            Ok(command) => command,
            Err(err) => {
                return Reply::fail(vec![
                    err.detail,
                    usage("do").unwrap_or_default().to_string(),
                ])
            }
        };
        let mut lines = vec![format!("attempting remote command {}", command)];
        match self.manager.exec(&command).await {
            Ok(output) => {
                let ok = output.success();
                lines.extend(output.lines());
                // A session channel runs one command; put a fresh one in its place
                if let Err(err) = self.manager.open_channel(ChannelKind::Session).await {
                    warn!("could not reopen session channel: {}", err);
                    lines.push(format!("channel not reopened: {}", err));
                }
                Reply { ok, lines, exit: false }
            }
            Err(err) => {
                lines.push(err.to_string());
                Reply::fail(lines)
            }
        }
    }

    async fn send(&mut self, rest: &str) -> Reply {
        let payload = match rest.strip_prefix("file ") {
            Some(path) => match tokio::fs::read(path.trim()).await {
                Ok(data) => data,
                Err(e) => return Reply::line(false, format!("cannot read {}: {}", path.trim(), e)),
            },
            None => rest.as_bytes().to_vec(),
        };
        if let Err(err) = check_payload(&payload, self.max_chars) {
            return Reply::line(false, err.detail);
        }
        match self.manager.send(&payload).await {
            Ok(n) => Reply::line(true, format!("sent {} bytes.", n)),
            Err(err) => Reply::line(false, err.to_string()),
        }
    }

    async fn get(&mut self, rest: &str) -> Reply {
        let Some(local) = file_name(rest) else {
            return Reply::line(false, usage("get").unwrap_or_default());
        };
        let started = Instant::now();
        let outcome = self.manager.download(rest, Path::new(&local)).await;
        Self::transfer_reply(outcome, started)
    }

    async fn put(&mut self, rest: &str) -> Reply {
        if rest.is_empty() {
            return Reply::line(false, "you have to send something ...");
        }
        let remote = match file_name(rest) {
            Some(name) if tokio::fs::metadata(rest).await.is_ok() => name,
            _ => return Reply::line(false, format!("no file named {}", rest)),
        };
        let started = Instant::now();
        let outcome = self.manager.upload(Path::new(rest), &remote).await;
        Self::transfer_reply(outcome, started)
    }

    fn transfer_reply(outcome: Outcome<u64>, started: Instant) -> Reply {
        let elapsed = format!("elapsed time: {}", elapsed_time(started.elapsed()));
        match outcome {
            Ok(bytes) => Reply::ok(vec![format!("success, {} bytes", bytes), elapsed]),
            Err(err) => Reply::fail(vec![format!("failure {}", err), elapsed]),
        }
    }
}
