//! Append-only JSON-lines audit sink for the handoff event stream

use std::path::PathBuf;

use anyhow::{Context, Result};
use handoff_coordination::HandoffEvent;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Write every event from `events` to `path` until the bus closes
pub async fn spawn_audit_log(
    path: PathBuf,
    mut events: broadcast::Receiver<HandoffEvent>,
) -> Result<JoinHandle<()>> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("failed to open audit log {}", path.display()))?;

    Ok(tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Audit log fell behind; events dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Failed to encode audit event");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = file.write_all(&line).await {
                warn!(path = %path.display(), error = %e, "Audit log write failed");
            }
        }
        if let Err(e) = file.flush().await {
            warn!(error = %e, "Audit log flush failed");
        }
        debug!("Audit log closed");
    }))
}
