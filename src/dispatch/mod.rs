//! Dispatch loop: verify, send one message, wait or back off, repeat.
//!
//! ```text
//! Idle → Verifying → Sending → Waiting → Verifying …
//!                      │  ▲
//!                      ▼  │
//!                     Backoff
//! ```
//!
//! A failed send never advances the message ring, so the same message is
//! retried after the backoff penalty until it is delivered. Retries are
//! unbounded. The loop ends on a configuration error found while verifying
//! or on a stop request, which is observed within one tick from any phase.

pub mod state;
pub mod status;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Local;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditKind, AuditLog};
use crate::codec::{self, SealError, DEFAULT_HEADER};
use crate::ring::{MessageRing, RingError};
use crate::target::{Target, TargetDescriptor};
use crate::transport::{Transport, TransportError};
use crate::vault::CryptoKey;

pub use state::{DispatchState, Phase};

/// Timing and framing for a dispatch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    /// Wait after a successful send.
    pub interval: Duration,
    /// Penalty wait after a failed send.
    pub backoff: Duration,
    /// Upper bound on stop-request latency.
    pub tick: Duration,
    /// Per-delivery time budget.
    pub transport_timeout: Duration,
    /// Banner placed above each envelope.
    pub header: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            backoff: Duration::from_secs(60),
            tick: Duration::from_secs(1),
            transport_timeout: Duration::from_secs(30),
            header: DEFAULT_HEADER.to_owned(),
        }
    }
}

/// A precondition for sending is not met. Fatal for the run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    /// No messages to send.
    #[error("no messages to send")]
    NoMessages,

    /// The target text matched no identifier rule.
    #[error("target '{0}' is not a recognised identifier")]
    UnknownTarget(String),

    /// The target is a profile URL whose username did not resolve.
    #[error("target '{target}' is unresolved (username '{username}')")]
    UnresolvedTarget {
        /// Operator's target text.
        target: String,
        /// Username that failed to resolve.
        username: String,
    },

    /// The canonical value is empty or not numeric.
    #[error("target '{0}' has no numeric canonical value")]
    InvalidTarget(String),
}

/// Errors surfaced by a dispatch run or a one-off delivery.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// A precondition failed while verifying.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// One-off delivery was rejected.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encryption failed.
    #[error(transparent)]
    Seal(#[from] SealError),
}

/// Why a reload request was refused.
#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    /// The replacement message set is unusable.
    #[error(transparent)]
    Ring(#[from] RingError),

    /// The dispatch loop has already exited.
    #[error("dispatch loop has exited, reload dropped")]
    Closed,
}

/// Final counters of a run that ended on a stop request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Confirmed deliveries.
    pub sent: u64,
    /// Failed attempts.
    pub failed: u64,
    /// Completed ring cycles.
    pub cycles: u64,
}

/// State shared between the loop and its handles.
///
/// `running` is owned by the loop. `cancelled` is sticky, so a stop that
/// arrives before [`DispatchLoop::run`] starts is still honoured.
#[derive(Debug, Default)]
struct Shared {
    running: AtomicBool,
    cancelled: AtomicBool,
    wake: Notify,
    state: Mutex<DispatchState>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.cancelled.load(Ordering::Acquire)
    }

    fn request_stop(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Control surface for a running loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    shared: Arc<Shared>,
    reload_tx: mpsc::UnboundedSender<Vec<String>>,
}

impl DispatchHandle {
    /// Ask the loop to stop. Takes effect within one tick.
    pub fn stop(&self) {
        info!("dispatch stop requested");
        self.shared.request_stop();
    }

    /// Whether the loop is currently running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Snapshot of the loop's state.
    pub fn status(&self) -> DispatchState {
        let mut snapshot = self.shared.state().clone();
        snapshot.running = self.shared.is_running();
        snapshot
    }

    /// Queue a wholesale replacement of the message ring. Applied before the
    /// loop's next send attempt, including retries during backoff; the cursor
    /// restarts at 0.
    ///
    /// # Errors
    ///
    /// Returns [`ReloadError::Ring`] if `items` is empty, or
    /// [`ReloadError::Closed`] once the loop has exited.
    pub fn reload(&self, items: Vec<String>) -> Result<(), ReloadError> {
        if items.is_empty() {
            return Err(RingError::EmptyRing.into());
        }
        self.reload_tx.send(items).map_err(|_| ReloadError::Closed)
    }
}

/// Result of one send attempt.
enum Attempt {
    Delivered,
    Failed,
    Cancelled,
}

/// The dispatch state machine. Consumed by [`DispatchLoop::run`].
pub struct DispatchLoop {
    settings: DispatchSettings,
    key: CryptoKey,
    target: TargetDescriptor,
    ring: MessageRing,
    transport: Arc<dyn Transport>,
    audit: Arc<AuditLog>,
    shared: Arc<Shared>,
    reload_rx: mpsc::UnboundedReceiver<Vec<String>>,
}

impl DispatchLoop {
    /// Build a loop in the `Idle` phase and its control handle.
    pub fn new(
        settings: DispatchSettings,
        key: CryptoKey,
        target: TargetDescriptor,
        ring: MessageRing,
        transport: Arc<dyn Transport>,
        audit: Arc<AuditLog>,
    ) -> (Self, DispatchHandle) {
        let shared = Arc::new(Shared::default());
        {
            let mut state = shared.state();
            state.target = target.source_text().to_owned();
            state.target_kind = Some(target.kind());
            state.ring_len = ring.len();
        }
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();

        let handle = DispatchHandle {
            shared: Arc::clone(&shared),
            reload_tx,
        };
        let dispatch = Self {
            settings,
            key,
            target,
            ring,
            transport,
            audit,
            shared,
            reload_rx,
        };
        (dispatch, handle)
    }

    /// Start the run and drive it until a stop request or a fatal
    /// configuration error. Counters reset at start and stay readable
    /// through the handle afterwards. Returns immediately if the handle was
    /// stopped before the run began.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if verification fails.
    pub async fn run(mut self) -> Result<DispatchSummary, DispatchError> {
        self.begin();
        let result = self.drive().await;

        self.shared.running.store(false, Ordering::Release);
        self.shared.state().phase = Phase::Stopped;

        match &result {
            Ok(summary) => info!(
                sent = summary.sent,
                failed = summary.failed,
                cycles = summary.cycles,
                "dispatch stopped"
            ),
            Err(e) => error!(error = %e, "dispatch aborted"),
        }
        result
    }

    fn begin(&mut self) {
        {
            let mut state = self.shared.state();
            *state = DispatchState {
                phase: Phase::Verifying,
                running: true,
                target: self.target.source_text().to_owned(),
                target_kind: Some(self.target.kind()),
                cursor: self.ring.cursor(),
                ring_len: self.ring.len(),
                ..DispatchState::default()
            };
        }
        self.shared.running.store(true, Ordering::Release);

        info!(
            target_kind = %self.target.kind(),
            messages = self.ring.len(),
            interval_secs = self.settings.interval.as_secs(),
            backoff_secs = self.settings.backoff.as_secs(),
            key = %self.key.fingerprint(),
            "dispatch started"
        );
    }

    async fn drive(&mut self) -> Result<DispatchSummary, DispatchError> {
        loop {
            self.set_phase(Phase::Verifying);
            self.apply_reloads();
            if !self.shared.is_running() {
                return Ok(self.summary());
            }

            let recipient = match self.verify() {
                Ok(recipient) => recipient,
                Err(e) => {
                    self.block(&e);
                    return Err(e.into());
                }
            };

            loop {
                self.apply_reloads();
                if !self.shared.is_running() {
                    return Ok(self.summary());
                }
                self.set_phase(Phase::Sending);
                match self.send_current(&recipient).await {
                    Attempt::Delivered => break,
                    Attempt::Failed => {
                        self.set_phase(Phase::Backoff);
                        if !self.pause(self.settings.backoff).await {
                            return Ok(self.summary());
                        }
                    }
                    Attempt::Cancelled => return Ok(self.summary()),
                }
            }

            self.set_phase(Phase::Waiting);
            if !self.pause(self.settings.interval).await {
                return Ok(self.summary());
            }
        }
    }

    fn verify(&self) -> Result<String, ConfigurationError> {
        if self.ring.is_empty() {
            return Err(ConfigurationError::NoMessages);
        }
        deliverable(&self.target)
    }

    async fn send_current(&mut self, recipient: &str) -> Attempt {
        let message = self.ring.next().0.to_owned();

        let (envelope, body) =
            match codec::seal_framed(&message, &self.key, &self.settings.header, &Local::now()) {
                Ok(parts) => parts,
                Err(e) => {
                    self.record_failure(recipient, &message, "", &e.to_string());
                    return Attempt::Failed;
                }
            };

        let timeout = self.settings.transport_timeout;
        let delivery = tokio::time::timeout(timeout, self.transport.deliver(recipient, &body));

        let outcome = tokio::select! {
            result = delivery => result.unwrap_or(Err(TransportError::Timeout(timeout))),
            () = wait_for_stop(&self.shared, self.settings.tick) => {
                info!("stop requested during delivery");
                return Attempt::Cancelled;
            }
        };

        match outcome {
            Ok(()) => {
                self.record_success(recipient, &message, &envelope);
                Attempt::Delivered
            }
            Err(e) => {
                self.record_failure(recipient, &message, &envelope, &e.to_string());
                Attempt::Failed
            }
        }
    }

    fn record_success(&mut self, recipient: &str, message: &str, envelope: &str) {
        let wrapped = self.ring.advance();
        let (sent, cycles) = {
            let mut state = self.shared.state();
            state.sent_count = state.sent_count.saturating_add(1);
            state.last_error = None;
            state.cursor = self.ring.cursor();
            if wrapped {
                state.cycle_count = state.cycle_count.saturating_add(1);
            }
            (state.sent_count, state.cycle_count)
        };

        info!(
            recipient,
            sent,
            next = self.ring.cursor(),
            "message delivered"
        );
        self.audit
            .record(AuditKind::Sent, recipient, message, envelope, "delivered");

        if wrapped {
            info!(cycles, "message cycle completed");
            self.audit.record(
                AuditKind::Cycle,
                recipient,
                "",
                "",
                &format!("cycle {cycles} completed"),
            );
        }
    }

    fn record_failure(&self, recipient: &str, message: &str, envelope: &str, reason: &str) {
        let failed = {
            let mut state = self.shared.state();
            state.failed_count = state.failed_count.saturating_add(1);
            state.last_error = Some(reason.to_owned());
            state.failed_count
        };

        warn!(
            recipient,
            failed,
            error = reason,
            backoff_secs = self.settings.backoff.as_secs(),
            "delivery failed, backing off"
        );
        self.audit
            .record(AuditKind::Failed, recipient, message, envelope, reason);
    }

    fn block(&self, error: &ConfigurationError) {
        self.shared.state().last_error = Some(error.to_string());
        error!(error = %error, "refusing to send");
        self.audit.record(
            AuditKind::Blocked,
            self.target.source_text(),
            "",
            "",
            &error.to_string(),
        );
    }

    fn apply_reloads(&mut self) {
        while let Ok(items) = self.reload_rx.try_recv() {
            match self.ring.reload(items) {
                Ok(()) => {
                    let mut state = self.shared.state();
                    state.cursor = self.ring.cursor();
                    state.ring_len = self.ring.len();
                    info!(messages = self.ring.len(), "message ring reloaded");
                }
                Err(e) => warn!(error = %e, "ignoring message reload"),
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `false` if stopped.
    async fn pause(&self, duration: Duration) -> bool {
        debug!(phase = %self.shared.state().phase, secs = duration.as_secs(), "pausing");
        tokio::select! {
            () = tokio::time::sleep(duration) => self.shared.is_running(),
            () = wait_for_stop(&self.shared, self.settings.tick) => false,
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.shared.state().phase = phase;
    }

    fn summary(&self) -> DispatchSummary {
        let state = self.shared.state();
        DispatchSummary {
            sent: state.sent_count,
            failed: state.failed_count,
            cycles: state.cycle_count,
        }
    }
}

/// Canonical delivery value of `target`, or why it cannot be sent to.
///
/// # Errors
///
/// Returns [`ConfigurationError`] for unknown, unresolved, or malformed
/// targets.
pub fn deliverable(target: &TargetDescriptor) -> Result<String, ConfigurationError> {
    match target.target() {
        Target::UserId(id) | Target::ThreadId(id) => {
            if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
                Err(ConfigurationError::InvalidTarget(
                    target.source_text().to_owned(),
                ))
            } else {
                Ok(id.clone())
            }
        }
        Target::UnresolvedUrl { username } => Err(ConfigurationError::UnresolvedTarget {
            target: target.source_text().to_owned(),
            username: username.clone(),
        }),
        Target::Unknown => Err(ConfigurationError::UnknownTarget(
            target.source_text().to_owned(),
        )),
    }
}

/// Seal and deliver a single message outside the loop, recording the result.
///
/// # Errors
///
/// Returns [`DispatchError`] if the target is not deliverable, sealing
/// fails, or the transport rejects the message.
pub async fn deliver_once(
    transport: &dyn Transport,
    key: &CryptoKey,
    target: &TargetDescriptor,
    message: &str,
    settings: &DispatchSettings,
    audit: &AuditLog,
) -> Result<(), DispatchError> {
    let recipient = match deliverable(target) {
        Ok(recipient) => recipient,
        Err(e) => {
            audit.record(
                AuditKind::Blocked,
                target.source_text(),
                message,
                "",
                &e.to_string(),
            );
            return Err(e.into());
        }
    };

    let (envelope, body) = codec::seal_framed(message, key, &settings.header, &Local::now())?;

    let outcome = tokio::time::timeout(
        settings.transport_timeout,
        transport.deliver(&recipient, &body),
    )
    .await
    .unwrap_or(Err(TransportError::Timeout(settings.transport_timeout)));

    match outcome {
        Ok(()) => {
            audit.record(AuditKind::Sent, &recipient, message, &envelope, "single delivery");
            Ok(())
        }
        Err(e) => {
            audit.record(AuditKind::Failed, &recipient, message, &envelope, &e.to_string());
            Err(e.into())
        }
    }
}

/// Resolve once the loop is no longer running. Woken immediately by
/// [`Shared::request_stop`], and polls every `tick` regardless.
async fn wait_for_stop(shared: &Shared, tick: Duration) {
    loop {
        let notified = shared.wake.notified();
        if !shared.is_running() {
            return;
        }
        tokio::select! {
            () = notified => {}
            () = tokio::time::sleep(tick) => {}
        }
    }
}
