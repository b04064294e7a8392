//! Command execution over an SSH session channel
//!
//! Provides the `CommandOutput` struct and the helpers that run one command
//! on a channel and gather what it prints.

use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tracing::debug;

use crate::connection::{ProviderError, ProviderResult};

/// Output from a command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,

    /// Standard error from the command
    pub stderr: String,

    /// Exit code of the command (if available)
    pub exit_code: Option<u32>,
}

impl CommandOutput {
    /// Create a new empty CommandOutput
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the command succeeded (exit code 0 or no exit code available)
    pub fn success(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }

    /// Output split into display lines, stderr after a separator
    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.stdout.lines().map(str::to_string).collect();
        if !self.stderr.is_empty() {
            lines.push("--- stderr ---".to_string());
            lines.extend(self.stderr.lines().map(str::to_string));
        }
        if let Some(code) = self.exit_code {
            lines.push(format!("exit status: {}", code));
        }
        lines
    }
}

/// Execute `command` on a session channel and collect its output
pub async fn run_on_channel(channel: Channel<Msg>, command: &str) -> ProviderResult<CommandOutput> {
    channel
        .exec(true, command)
        .await
        .map_err(|e| ProviderError::protocol(format!("Failed to exec command: {}", e)))?;

    Ok(collect_channel_output(channel).await)
}

/// Collect output from a channel until it closes
pub async fn collect_channel_output(mut channel: Channel<Msg>) -> CommandOutput {
    let mut output = CommandOutput::new();

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                output.stdout.push_str(&String::from_utf8_lossy(&data));
            }
            ChannelMsg::ExtendedData { data, ext } => {
                // ext == 1 is stderr
                if ext == 1 {
                    output.stderr.push_str(&String::from_utf8_lossy(&data));
                } else {
                    output.stdout.push_str(&String::from_utf8_lossy(&data));
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                output.exit_code = Some(exit_status);
            }
            ChannelMsg::Close | ChannelMsg::Eof => {
                break;
            }
            _ => {}
        }
    }

    debug!(
        "Command completed: exit_code={:?}, stdout_len={}, stderr_len={}",
        output.exit_code,
        output.stdout.len(),
        output.stderr.len()
    );

    output
}
