//! Command and payload validation
//!
//! Checks text typed at the console before it is pushed through a channel.

use crate::error::{ErrorDescriptor, Outcome};

/// Sanitize a command before execution
///
/// This function:
/// - Validates that the command is not empty
/// - Trims whitespace
/// - Checks length against max_chars limit
///
/// # Examples
/// ```
/// use beachhead::ssh::sanitize::sanitize_command;
///
/// let cmd = sanitize_command("  ls -la  ", Some(1000)).unwrap();
/// assert_eq!(cmd, "ls -la");
///
/// // Too long command
/// let result = sanitize_command("a".repeat(100).as_str(), Some(50));
/// assert!(result.is_err());
/// ```
pub fn sanitize_command(command: &str, max_chars: Option<usize>) -> Outcome<String> {
    let trimmed = command.trim();

    if trimmed.is_empty() {
        return Err(ErrorDescriptor::precondition("Command cannot be empty"));
    }

    check_length(trimmed.len(), max_chars, "Command")?;
    Ok(trimmed.to_string())
}

/// Check a raw payload for `send`/`write`; unlike commands it is not trimmed
pub fn check_payload(payload: &[u8], max_chars: Option<usize>) -> Outcome<()> {
    if payload.is_empty() {
        return Err(ErrorDescriptor::precondition("you have to send something ..."));
    }
    check_length(payload.len(), max_chars, "Payload")
}

fn check_length(len: usize, max_chars: Option<usize>, what: &str) -> Outcome<()> {
    if let Some(max) = max_chars {
        if len > max {
            return Err(ErrorDescriptor::precondition(format!(
                "{} is too long (max {} characters, got {})",
                what, max, len
            )));
        }
    }
    Ok(())
}
