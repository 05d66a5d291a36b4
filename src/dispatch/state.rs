//! Observable dispatch state.

use serde::{Deserialize, Serialize};

use crate::target::TargetKind;

/// Dispatch loop phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Not started, or stopped and awaiting the next start.
    #[default]
    Idle,
    /// Checking target, key, and messages.
    Verifying,
    /// Delivery in flight.
    Sending,
    /// Sleeping out the send interval.
    Waiting,
    /// Sleeping out the failure penalty.
    Backoff,
    /// Run finished.
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Verifying => "verifying",
            Self::Sending => "sending",
            Self::Waiting => "waiting",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Counters and phase of the current (or last) run.
///
/// Written only by the dispatch loop; other tasks read clones through
/// [`super::DispatchHandle::status`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchState {
    /// Current phase.
    pub phase: Phase,
    /// Whether the loop is accepting work.
    pub running: bool,
    /// Confirmed deliveries.
    pub sent_count: u64,
    /// Failed delivery attempts.
    pub failed_count: u64,
    /// Completed passes through the message ring.
    pub cycle_count: u64,
    /// Most recent failure, cleared by the next success.
    pub last_error: Option<String>,
    /// Operator's target text.
    pub target: String,
    /// Resolved target kind.
    pub target_kind: Option<TargetKind>,
    /// Ring cursor.
    pub cursor: usize,
    /// Ring length.
    pub ring_len: usize,
}
