//! Configuration and CLI argument parsing for beachhead

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::{DebugLevel, TimeoutStage, Timeouts, DEFAULT_STAGE_TIMEOUT_SECS};
use crate::error::{BeachheadError, Result};

/// Default timeout for `do` commands in milliseconds
pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 60_000; // 60 seconds

/// Default max characters for a command or payload (None = unlimited)
pub const DEFAULT_MAX_CHARS: Option<usize> = Some(1000);

/// beachhead CLI arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "beachhead")]
#[command(version)]
#[command(about = "Walk an SSH connection up one layer at a time and see where it breaks")]
pub struct Args {
    /// ssh client config to resolve host names from (default ~/.ssh/config)
    #[arg(long, env = "BEACHHEAD_SSH_CONFIG")]
    pub ssh_config: Option<PathBuf>,

    /// Seconds allowed for the TCP connect
    #[arg(long, default_value_t = DEFAULT_STAGE_TIMEOUT_SECS, env = "BEACHHEAD_TCP_TIMEOUT")]
    pub tcp_timeout: f64,

    /// Seconds allowed for the handshake and authentication
    #[arg(long, default_value_t = DEFAULT_STAGE_TIMEOUT_SECS, env = "BEACHHEAD_AUTH_TIMEOUT")]
    pub auth_timeout: f64,

    /// Seconds allowed for the server's identification banner
    #[arg(long, default_value_t = DEFAULT_STAGE_TIMEOUT_SECS, env = "BEACHHEAD_BANNER_TIMEOUT")]
    pub banner_timeout: f64,

    /// Command execution timeout in milliseconds
    #[arg(long, default_value = "60000", env = "BEACHHEAD_EXEC_TIMEOUT")]
    pub exec_timeout: u64,

    /// Maximum characters for a command or payload.
    /// Use "none", "0", or negative value to disable limit.
    /// Default: 1000
    #[arg(long, env = "BEACHHEAD_MAX_CHARS", allow_hyphen_values = true)]
    pub max_chars: Option<String>,

    /// Initial diagnostic level, by name or number
    #[arg(long, default_value = "WARNING", env = "BEACHHEAD_LOG_LEVEL")]
    pub log_level: String,

    /// Let names missing from the ssh config resolve as plain hostnames
    #[arg(long, default_value = "false", env = "BEACHHEAD_LITERAL_HOSTS")]
    pub literal_hosts: bool,
}

/// Parsed and validated configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// ssh client config file, if one was named
    pub ssh_config: Option<PathBuf>,

    /// Per-stage budgets
    pub timeouts: Timeouts,

    /// Budget for a `do` command
    pub exec_timeout: Duration,

    /// Maximum command length (None = unlimited)
    pub max_chars: Option<usize>,

    /// Starting diagnostic level
    pub log_level: DebugLevel,

    /// Resolve unknown names literally
    pub literal_hosts: bool,
}

impl Config {
    /// Create Config from CLI Args
    pub fn from_args(args: Args) -> Result<Self> {
        let (timeouts, log_level) = validate_args(&args)?;

        Ok(Config {
            ssh_config: args.ssh_config,
            timeouts,
            exec_timeout: Duration::from_millis(args.exec_timeout),
            max_chars: parse_max_chars(args.max_chars.as_deref()),
            log_level,
            literal_hosts: args.literal_hosts,
        })
    }
}

/// Validate CLI arguments, collecting every problem into one error
fn validate_args(args: &Args) -> Result<(Timeouts, DebugLevel)> {
    let mut errors = Vec::new();
    let mut timeouts = Timeouts::default();

    for (name, stage, seconds) in [
        ("--tcp-timeout", TimeoutStage::Tcp, args.tcp_timeout),
        ("--auth-timeout", TimeoutStage::Auth, args.auth_timeout),
        ("--banner-timeout", TimeoutStage::Banner, args.banner_timeout),
    ] {
        if let Err(reason) = timeouts.set(stage, seconds) {
            errors.push(format!("{}: {}", name, reason));
        }
    }

    if args.exec_timeout == 0 {
        errors.push("--exec-timeout must be greater than zero".to_string());
    }

    let log_level = match args.log_level.parse::<DebugLevel>() {
        Ok(level) => level,
        Err(reason) => {
            errors.push(format!("--log-level: {}", reason));
            DebugLevel::Warning
        }
    };

    if let Some(ref path) = args.ssh_config {
        if path.is_dir() {
            errors.push(format!("ssh config is a directory: {}", path.display()));
        }
    }

    if !errors.is_empty() {
        return Err(BeachheadError::Config(format!(
            "Configuration error:\n{}",
            errors.join("\n")
        )));
    }

    Ok((timeouts, log_level))
}

/// Parse max_chars argument
///
/// - "none" (case-insensitive) → None (unlimited)
/// - "0" or negative → None (unlimited)
/// - positive integer → Some(value)
/// - None (not provided) → DEFAULT_MAX_CHARS
pub fn parse_max_chars(value: Option<&str>) -> Option<usize> {
    match value {
        None => DEFAULT_MAX_CHARS,
        Some(s) => {
            if s.eq_ignore_ascii_case("none") {
                return None;
            }

            match s.parse::<i64>() {
                Ok(n) if n <= 0 => None,
                Ok(n) => usize::try_from(n).ok(),
                Err(_) => DEFAULT_MAX_CHARS,
            }
        }
    }
}
