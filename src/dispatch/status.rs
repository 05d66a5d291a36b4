//! Periodic `status.json` snapshots of a running dispatch loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{DispatchHandle, DispatchState};

/// Snapshot written to `~/.sealpost/status.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Dispatch state at the time of writing.
    #[serde(flatten)]
    pub state: DispatchState,
    /// RFC 3339 timestamp of this report.
    pub updated_at: String,
    /// Process id of the writer.
    pub pid: u32,
}

impl StatusReport {
    /// Stamp `state` with the current time.
    pub fn from_state(state: DispatchState) -> Self {
        Self {
            state,
            updated_at: chrono::Utc::now().to_rfc3339(),
            pid: std::process::id(),
        }
    }
}

/// Write a status report atomically (temp file, then rename).
///
/// # Errors
///
/// Returns an error if serialization or file operations fail.
pub async fn write_status_file(report: &StatusReport, path: &Path) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report).context("failed to serialize status report")?;

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    tokio::fs::rename(&tmp_path, path)
        .await
        .context("failed to rename status temp file")?;

    debug!("status.json updated");
    Ok(())
}

/// Read a previously written status report.
///
/// # Errors
///
/// Returns an error if the file is missing or malformed.
pub async fn read_status_file(path: &Path) -> anyhow::Result<StatusReport> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Write `status.json` every `interval` until shutdown, then once more so
/// the file reflects the final state.
pub async fn run_status_reporter(
    handle: DispatchHandle,
    path: PathBuf,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(path = %path.display(), "status reporter started");
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                write_snapshot(&handle, &path).await;
            }
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    write_snapshot(&handle, &path).await;
    info!("status reporter stopped");
}

async fn write_snapshot(handle: &DispatchHandle, path: &Path) {
    let report = StatusReport::from_state(handle.status());
    if let Err(e) = write_status_file(&report, path).await {
        warn!(error = %e, "failed to write status.json");
    }
}
