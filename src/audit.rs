//! Append-only audit trail of send attempts.
//!
//! Every record lands twice: once as a human-readable line and once as a
//! JSON object in a `.jsonl` side file. Recording never fails from the
//! caller's point of view; write errors are reported with `warn!` and dropped.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{Local, Utc};
use serde::Serialize;
use tracing::{trace, warn};
use uuid::Uuid;

/// Longest plaintext excerpt kept in a record.
pub const MESSAGE_EXCERPT_CHARS: usize = 50;

/// Longest envelope excerpt kept in a record.
pub const ENVELOPE_EXCERPT_CHARS: usize = 30;

/// Audit record discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    /// The transport accepted a message.
    Sent,
    /// The transport rejected a message or timed out.
    Failed,
    /// The message ring wrapped back to its first item.
    Cycle,
    /// Verification refused to send.
    Blocked,
    /// A received envelope was opened.
    Decrypted,
}

impl AuditKind {
    /// Upper-case label used in the line file.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Cycle => "CYCLE",
            Self::Blocked => "BLOCKED",
            Self::Decrypted => "DECRYPTED",
        }
    }
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured audit entry.
#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    id: String,
    timestamp: String,
    kind: AuditKind,
    target: &'a str,
    message_excerpt: String,
    envelope_excerpt: String,
    detail: &'a str,
}

/// Audit log writing a line file and a JSONL side file.
pub struct AuditLog {
    lines: Mutex<Box<dyn Write + Send>>,
    records: Mutex<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Open (or create) both audit files for appending.
    ///
    /// # Errors
    ///
    /// Returns an error if a parent directory or file cannot be created.
    pub fn open(line_path: &Path, record_path: &Path) -> anyhow::Result<Self> {
        Ok(Self::from_writers(
            Box::new(open_append(line_path)?),
            Box::new(open_append(record_path)?),
        ))
    }

    /// Build an audit log over arbitrary writers (for testing).
    pub fn from_writers(lines: Box<dyn Write + Send>, records: Box<dyn Write + Send>) -> Self {
        Self {
            lines: Mutex::new(lines),
            records: Mutex::new(records),
        }
    }

    /// Append one record. Never fails; write errors are logged and dropped.
    pub fn record(
        &self,
        kind: AuditKind,
        target: &str,
        plaintext: &str,
        envelope: &str,
        detail: &str,
    ) {
        if let Err(e) = self.write_entry(kind, target, plaintext, envelope, detail) {
            warn!(kind = %kind, error = %e, "failed to write audit record");
        }
    }

    fn write_entry(
        &self,
        kind: AuditKind,
        target: &str,
        plaintext: &str,
        envelope: &str,
        detail: &str,
    ) -> anyhow::Result<()> {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind,
            target,
            message_excerpt: excerpt(plaintext, MESSAGE_EXCERPT_CHARS),
            envelope_excerpt: excerpt(envelope, ENVELOPE_EXCERPT_CHARS),
            detail,
        };

        let line = format!(
            "[{}] {} target={} msg={:?} env={} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            kind,
            target,
            entry.message_excerpt,
            entry.envelope_excerpt,
            detail
        );
        let record = serde_json::to_string(&entry)?;

        // Both writes are attempted even if the first one fails.
        let line_result = append_line(&self.lines, line.trim_end());
        let record_result = append_line(&self.records, &record);
        line_result?;
        record_result?;

        trace!(kind = %kind, "audit record written");
        Ok(())
    }
}

/// Shorten `text` to at most `max_chars` characters, appending `...` if cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let single_line = text.replace(['\n', '\r'], " ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let head: String = single_line.chars().take(max_chars).collect();
    format!("{head}...")
}

fn append_line(writer: &Mutex<Box<dyn Write + Send>>, line: &str) -> anyhow::Result<()> {
    let mut writer = writer
        .lock()
        .map_err(|e| anyhow::anyhow!("audit lock poisoned: {e}"))?;
    writeln!(writer, "{line}")?;
    writer.flush()?;
    Ok(())
}

fn open_append(path: &Path) -> anyhow::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!("failed to create audit directory {}: {e}", parent.display())
        })?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| anyhow::anyhow!("failed to open audit file {}: {e}", path.display()))
}
