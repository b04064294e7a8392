//! beachhead - Entry point
//!
//! Parses CLI arguments, installs logging with a runtime-adjustable filter,
//! and runs the console over stdin until `exit`, `quit`, EOF or Ctrl+C.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter};

use beachhead::config::{Args, Config};
use beachhead::connection::{ConnectionManager, ReloadLevelControl};
use beachhead::error::{BeachheadError, Result};
use beachhead::{Console, RusshProvider, SshConfigResolver, PROMPT};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Validate and create config
    let config = Config::from_args(args)?;

    // Logging goes to stderr; stdout carries console replies
    let (filter, reload_handle) =
        reload::Layer::new(EnvFilter::new(config.log_level.filter_directive()));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| BeachheadError::logging(e.to_string()))?;

    info!("beachhead v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "Max chars: {}, exec timeout: {}ms",
        config
            .max_chars
            .map_or("unlimited".to_string(), |n| n.to_string()),
        config.exec_timeout.as_millis()
    );

    let resolver = SshConfigResolver::load(config.ssh_config.as_deref())
        .await?
        .with_literal_hosts(config.literal_hosts);
    let manager = ConnectionManager::new(
        resolver,
        RusshProvider::new(),
        Box::new(ReloadLevelControl::new(reload_handle, config.log_level)),
    )
    .with_timeouts(config.timeouts)
    .with_exec_timeout(config.exec_timeout);
    let mut console = Console::new(manager, config.max_chars);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(PROMPT.as_bytes()).await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = stdin.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
                None
            }
        };
        let Some(line) = line else {
            stdout.write_all(b"\n").await?;
            break;
        };

        let reply = console.execute(&line).await;
        for text in &reply.lines {
            stdout.write_all(text.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        if reply.exit {
            break;
        }
    }

    // Cleanup
    console.shutdown().await;
    info!("beachhead stopped");

    Ok(())
}
