//! Host bridge for the `a3s-beacon` binary
//!
//! The agent host writes one JSON `HostSignal` per line to stdin. Every
//! `tool_before` is answered with exactly one JSON line on stdout carrying the
//! safety verdict; nothing else is ever written to stdout.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::broker::memory::MemoryBroker;
use crate::broker::redis::{RedisBroker, RedisConfig};
use crate::broker::Broker;
use crate::config::BeaconConfig;
use crate::coordinator::{Coordinator, CoordinatorContext};
use crate::safety::SafetyReport;
use crate::signal::HostSignal;

/// A3S Beacon - Agent session status coordination
#[derive(Debug, Parser)]
#[command(name = "a3s-beacon", version, about)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Workspace the agent is attached to (defaults to the current directory)
    #[arg(long, short)]
    pub workspace: Option<PathBuf>,

    /// Redis URL, overriding the configuration file
    #[arg(long)]
    pub redis_url: Option<String>,
}

/// Reply line for a `tool_before` signal
#[derive(Debug, Serialize)]
struct SafetyReply<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    report: &'a SafetyReport,
}

/// Run the bridge until stdin closes or Ctrl-C arrives.
pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => BeaconConfig::load(path)?,
        None => BeaconConfig::default(),
    };
    if let Some(url) = cli.redis_url {
        config.redis.url = url;
    }
    config.validate()?;

    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let workspace = workspace.to_string_lossy().into_owned();

    let broker: Arc<dyn Broker> =
        match RedisBroker::connect(RedisConfig::new(config.redis.url.clone())).await {
            Ok(broker) => Arc::new(broker),
            Err(e) => {
                tracing::warn!(error = %e, "Redis unreachable, running detached");
                Arc::new(MemoryBroker::detached())
            }
        };

    let coordinator = Coordinator::new(Arc::new(CoordinatorContext::new(
        config, broker, workspace,
    )));
    coordinator.start().await;

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let outcome = tokio::select! {
        result = bridge(&coordinator, stdin, stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    coordinator.shutdown().await;
    outcome
}

/// Feed signal lines from `reader` into the coordinator, writing safety
/// replies to `writer`. Returns when `reader` reaches EOF.
pub async fn bridge<R, W>(coordinator: &Coordinator, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let signal: HostSignal = match serde_json::from_str(line) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable host signal");
                continue;
            }
        };

        if let Some(report) = coordinator.handle(&signal).await {
            let reply = SafetyReply {
                kind: "safety",
                report: &report,
            };
            let mut json = serde_json::to_vec(&reply)?;
            json.push(b'\n');
            writer.write_all(&json).await?;
            writer.flush().await?;
        }
    }
    tracing::debug!("Host input closed");
    Ok(())
}
