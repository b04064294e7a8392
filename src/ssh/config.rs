//! OpenSSH client config as an endpoint resolver
//!
//! Parses `~/.ssh/config` once into a snapshot and answers lookups from it.
//! Supports:
//! - `Host` blocks with several patterns, `*`/`?` globs and `!` negation
//! - `HostName` (with `%h`), `User`, `Port`, `IdentityFile` (`~/` expanded)
//! - `Key value` and `Key=value` forms, case-insensitive keys, `#` comments
//!
//! As in OpenSSH, every block whose patterns match contributes, and the
//! first value seen for a key wins.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::connection::{Credential, Endpoint, EndpointResolver};
use crate::error::{BeachheadError, Result};

/// Port used when no `Port` applies
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Values collected for one lookup, or declared by one block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct HostSettings {
    hostname: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    identity_file: Option<PathBuf>,
}

impl HostSettings {
    /// Fill unset fields from `other`
    fn merge_missing(&mut self, other: &HostSettings) {
        if self.hostname.is_none() {
            self.hostname.clone_from(&other.hostname);
        }
        if self.port.is_none() {
            self.port = other.port;
        }
        if self.user.is_none() {
            self.user.clone_from(&other.user);
        }
        if self.identity_file.is_none() {
            self.identity_file.clone_from(&other.identity_file);
        }
    }
}

#[derive(Debug, Clone)]
struct HostBlock {
    patterns: Vec<String>,
    settings: HostSettings,
}

impl HostBlock {
    fn matches(&self, name: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if let Some(negated) = pattern.strip_prefix('!') {
                if glob_match(negated, name) {
                    return false;
                }
            } else if glob_match(pattern, name) {
                matched = true;
            }
        }
        matched
    }
}

/// Match `name` against an ssh_config pattern (`*` any run, `?` one char)
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(&c) if c == '?' || c == name[n] => {
                p += 1;
                n += 1;
            }
            _ => match backtrack {
                Some((star, consumed)) => {
                    p = star + 1;
                    n = consumed + 1;
                    backtrack = Some((star, consumed + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?') || pattern.starts_with('!')
}

fn expand_home(value: &str, home: Option<&Path>) -> PathBuf {
    match (value.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(value),
    }
}

/// Get default SSH config path
pub fn default_ssh_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("config"))
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

fn default_identity(home: Option<&Path>) -> PathBuf {
    let ssh_dir = home.map_or_else(|| PathBuf::from(".ssh"), |h| h.join(".ssh"));
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|path| path.exists())
        .unwrap_or_else(|| ssh_dir.join("id_rsa"))
}

/// Endpoint resolver backed by an ssh client config snapshot
#[derive(Debug, Clone)]
pub struct SshConfigResolver {
    blocks: Vec<HostBlock>,
    literal_hosts: bool,
    default_user: String,
    default_identity: PathBuf,
}

impl SshConfigResolver {
    /// Read and parse the config at `path` (default `~/.ssh/config`).
    ///
    /// A missing file yields an empty resolver.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_ssh_config_path()
                .ok_or_else(|| BeachheadError::config("Failed to determine home directory"))?,
        };

        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No ssh config at {}", path.display());
                String::new()
            }
            Err(e) => return Err(BeachheadError::Io(e)),
        };

        Self::parse(&content)
            .map_err(|reason| BeachheadError::ssh_config(path.display().to_string(), reason))
    }

    /// Parse config text, expanding `~/` against the user's home directory
    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let home = dirs::home_dir();
        Self::parse_with_home(content, home.as_deref())
    }

    fn parse_with_home(content: &str, home: Option<&Path>) -> std::result::Result<Self, String> {
        let mut blocks = Vec::new();
        // Lines before the first Host apply to every host
        let mut current = HostBlock {
            patterns: vec!["*".to_string()],
            settings: HostSettings::default(),
        };

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (key, value) = match line.find(|c: char| c == '=' || c.is_whitespace()) {
                Some(pos) => (
                    line[..pos].trim(),
                    line[pos + 1..].trim().trim_start_matches('=').trim(),
                ),
                None => {
                    return Err(format!("line {}: missing value for {}", index + 1, line));
                }
            };
            let value = value.trim_matches('"');

            match key.to_lowercase().as_str() {
                "host" => {
                    blocks.push(current);
                    current = HostBlock {
                        patterns: value.split_whitespace().map(str::to_string).collect(),
                        settings: HostSettings::default(),
                    };
                }
                "hostname" if current.settings.hostname.is_none() => {
                    current.settings.hostname = Some(value.to_string());
                }
                "user" if current.settings.user.is_none() => {
                    current.settings.user = Some(value.to_string());
                }
                "port" if current.settings.port.is_none() => {
                    let port = value
                        .parse::<u16>()
                        .map_err(|_| format!("line {}: bad port {}", index + 1, value))?;
                    current.settings.port = Some(port);
                }
                "identityfile" if current.settings.identity_file.is_none() => {
                    current.settings.identity_file = Some(expand_home(value, home));
                }
                _ => {}
            }
        }
        blocks.push(current);

        Ok(Self {
            blocks,
            literal_hosts: false,
            default_user: default_user(),
            default_identity: default_identity(home),
        })
    }

    /// Resolve names that no `Host` line lists as if they were hostnames
    pub fn with_literal_hosts(mut self, literal_hosts: bool) -> Self {
        self.literal_hosts = literal_hosts;
        self
    }

    /// Replace the user and identity used when no block sets them
    pub fn with_defaults(mut self, user: impl Into<String>, identity: impl Into<PathBuf>) -> Self {
        self.default_user = user.into();
        self.default_identity = identity.into();
        self
    }
}

impl EndpointResolver for SshConfigResolver {
    fn resolve(&self, name: &str) -> Option<Endpoint> {
        if !self.literal_hosts && !self.known_hosts().iter().any(|known| known == name) {
            return None;
        }

        let mut settings = HostSettings::default();
        for block in self.blocks.iter().filter(|block| block.matches(name)) {
            settings.merge_missing(&block.settings);
        }

        let hostname = settings
            .hostname
            .map_or_else(|| name.to_string(), |h| h.replace("%h", name));
        let identity = settings
            .identity_file
            .unwrap_or_else(|| self.default_identity.clone());

        Some(Endpoint::new(
            hostname,
            settings.port.unwrap_or(DEFAULT_SSH_PORT),
            settings.user.unwrap_or_else(|| self.default_user.clone()),
            Credential::IdentityFile(identity),
        ))
    }

    fn known_hosts(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .blocks
            .iter()
            .flat_map(|block| block.patterns.iter())
            .filter(|pattern| !is_wildcard(pattern))
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }
}
