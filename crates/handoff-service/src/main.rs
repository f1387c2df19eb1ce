//! Handoff Service
//!
//! Runs a [`HandoffCoordinator`] behind a JSON-lines protocol on stdin/stdout.
//! Logs go to stderr so stdout carries only responses.
//!
//! # Usage
//!
//! ```bash
//! # In-memory state, defaults
//! handoff-service
//!
//! # With a config file and an audit trail
//! handoff-service --config handoff.toml --audit-log ./handoff-audit.jsonl
//!
//! # Durable contacts and transition log (durable-state feature)
//! handoff-service --state-path ./.handoff-state
//!
//! # Tighten caps from the environment
//! HANDOFF_HOURLY_CAP=2 HANDOFF_DAILY_CAP=5 handoff-service
//! ```

mod audit;
mod commands;
mod messaging;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use handoff_coordination::{spawn_health_ingest, HandoffConfig, HandoffCoordinator};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use commands::CommandHandler;
use messaging::TracingMessaging;

/// Interval between sweeps of expired packages and guard entries
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period for the audit sink to write trailing events
const AUDIT_DRAIN: Duration = Duration::from_millis(50);

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (HANDOFF_* environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Append every handoff event as a JSON line to this file
    #[arg(long)]
    audit_log: Option<PathBuf>,

    /// RocksDB directory for contacts, transitions and pattern stats
    #[cfg(feature = "durable-state")]
    #[arg(long)]
    state_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "handoff_service=info,handoff_coordination=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = HandoffConfig::load(args.config.as_deref()).context("failed to load handoff config")?;
    info!(
        threshold = config.routing.default_threshold,
        hourly_cap = config.rate_limit.hourly_cap,
        daily_cap = config.rate_limit.daily_cap,
        max_depth = config.circular.max_depth,
        "Starting handoff service"
    );
    let health_capacity = config.health.channel_capacity;

    let builder = HandoffCoordinator::builder(config).messaging(Arc::new(TracingMessaging));
    #[cfg(feature = "durable-state")]
    let builder = match args.state_path {
        Some(path) => {
            info!(path = %path.display(), "Using durable contact store");
            let store = handoff_coordination::DurableContactStore::open(path.clone())
                .with_context(|| format!("failed to open state store {}", path.display()))?;
            builder.contact_store(store.shared())
        }
        None => builder,
    };
    let coordinator = Arc::new(builder.build().context("failed to build coordinator")?);
    coordinator.restore().await.context("failed to restore coordinator state")?;

    let audit = match args.audit_log {
        Some(path) => {
            info!(path = %path.display(), "Writing audit log");
            Some(audit::spawn_audit_log(path, coordinator.subscribe()).await?)
        }
        None => None,
    };
    let learner = coordinator.spawn_learner();
    let (reporter, ingest) = spawn_health_ingest(coordinator.health_registry().clone(), health_capacity);

    let sweeper = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                coordinator.purge_expired().await;
            }
        })
    };

    let handler = CommandHandler::new(coordinator.clone(), reporter);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut served = 0u64;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = handler.handle_line(line).await;
        if let Some(error) = &response.error {
            debug!(%error, "Command failed");
        }
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        stdout.write_all(&out).await.context("failed to write stdout")?;
        stdout.flush().await?;
        served += 1;
    }

    info!(served, "Input closed; shutting down");
    sweeper.abort();
    ingest.abort();
    if let Some(learner) = learner {
        learner.abort();
    }
    if let Some(audit) = audit {
        // The coordinator keeps the bus open, so the sink never sees Closed.
        tokio::time::sleep(AUDIT_DRAIN).await;
        audit.abort();
    }
    Ok(())
}
