//! InitializationManager: bounded-retry state machine for slow initializers.
//!
//! Drives any async initializer through up to `max_retries` attempts, each
//! raced against a per-attempt timeout, with linear backoff in between.
//! Observers follow along through two broadcast channels: coarse
//! [`InitializationState`] snapshots and fine-grained
//! [`InitializationProgress`] events.
//!
//! ```text
//!            run_initialization()
//!   ┌──────┐ ───────────────────▶ ┌─────────┐   ok    ┌───────────┐
//!   │ Idle │                      │ Running │ ──────▶ │ Succeeded │
//!   └──────┘ ◀─── dispose() ───── └────┬────┘         └───────────┘
//!      ▲                               │ retries exhausted / fatal / cancel
//!      │   retry_initialization()      ▼
//!      └──────────────────────────  ┌────────┐
//!                                   │ Failed │
//!                                   └────────┘
//! ```
//!
//! Only one initializer runs at a time. A second `run_initialization` while
//! one is in flight returns [`InitOutcome::AlreadyRunning`] without calling
//! its initializer; once `Succeeded`, further calls return immediately.
//!
//! The initializer receives an [`InitContext`] carrying a progress reporter
//! and a [`CancellationHandle`]. `cancel()` and `dispose()` abort both the
//! running attempt and any backoff sleep. Each cycle gets its own
//! cancellation channel, and a new cycle waits until a disposed one has
//! dropped its initializer.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::types::InferenceError;

/// Capacity of the state and progress channels. Slow subscribers lag and
/// skip events rather than blocking the initializer.
const EVENT_CAPACITY: usize = 64;

/// Progress published when an attempt starts.
const ATTEMPT_PROGRESS: u8 = 10;

// ============================================================================
// Policy
// ============================================================================

/// Retry, timeout and backoff settings for one initialization cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts per cycle. `0` is treated as `1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Sleep after attempt `n` is `backoff_base_ms * n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_attempt_timeout_ms() -> u64 {
    45_000
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(u64::from(attempt)))
    }
}

// ============================================================================
// Observable state
// ============================================================================

/// Lifecycle phase of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InitPhase {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Snapshot published on every phase or progress change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitializationState {
    pub is_initialized: bool,
    pub is_initializing: bool,
    pub failed: bool,
    pub error_message: Option<String>,
    /// Percent complete, `0..=100`.
    pub progress: u8,
    pub current_step: String,
    /// Attempts made in the current cycle.
    pub retry_count: u32,
    pub elapsed_time: Duration,
}

impl InitializationState {
    pub fn phase(&self) -> InitPhase {
        if self.is_initialized {
            InitPhase::Succeeded
        } else if self.is_initializing {
            InitPhase::Running
        } else if self.failed {
            InitPhase::Failed
        } else {
            InitPhase::Idle
        }
    }
}

/// Fine-grained progress event. Not retained; late subscribers miss it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitializationProgress {
    pub progress: u8,
    pub step: String,
    pub timestamp: SystemTime,
}

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// An attempt exceeded the per-attempt timeout.
    Timeout,
    /// The initializer resolved to `Ok(false)`.
    ReturnedFalse,
    /// The initializer returned an error.
    Threw,
    /// The initializer returned an error retrying cannot fix.
    Fatal,
    /// `cancel()` or `dispose()` aborted the cycle.
    Cancelled,
}

impl FailureKind {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Fatal | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl InitFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_error(error: &InferenceError) -> Self {
        let kind = if error.is_fatal() {
            FailureKind::Fatal
        } else if matches!(error, InferenceError::Cancelled) {
            FailureKind::Cancelled
        } else if error.is_timeout() {
            FailureKind::Timeout
        } else {
            FailureKind::Threw
        };
        Self::new(kind, error.to_string())
    }
}

/// Result of one `run_initialization` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Succeeded,
    /// Another initialization was in flight; nothing was invoked.
    AlreadyRunning,
    Failed(InitFailure),
}

impl InitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn failure(&self) -> Option<&InitFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

// ============================================================================
// Initializer context
// ============================================================================

/// Cooperative cancellation signal handed to initializers.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    rx: watch::Receiver<bool>,
}

impl CancellationHandle {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    /// `Err(Cancelled)` if cancellation was requested.
    pub fn check(&self) -> Result<(), InferenceError> {
        if self.is_cancelled() {
            Err(InferenceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Publishes sub-phase progress for the run that created it.
#[derive(Clone)]
pub struct ProgressReporter {
    shared: Arc<Shared>,
    run: u64,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").field("run", &self.run).finish()
    }
}

impl ProgressReporter {
    /// Report progress. Values below the current progress are raised to it;
    /// reports from a finished or disposed run are dropped.
    pub fn report(&self, percent: u8, label: &str) {
        self.shared.advance(Some(self.run), percent, label);
    }
}

/// Passed to the initializer on every attempt.
#[derive(Debug, Clone)]
pub struct InitContext {
    progress: ProgressReporter,
    cancellation: CancellationHandle,
    attempt: u32,
    max_attempts: u32,
}

impl InitContext {
    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn cancellation(&self) -> &CancellationHandle {
        &self.cancellation
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

// ============================================================================
// Shared state
// ============================================================================

struct Inner {
    phase: InitPhase,
    /// Incremented on every new cycle and on dispose; stale runs stop publishing.
    run: u64,
    error_message: Option<String>,
    progress: u8,
    current_step: String,
    retry_count: u32,
    started_at: Option<Instant>,
    finished_elapsed: Option<Duration>,
    state_tx: Option<broadcast::Sender<InitializationState>>,
    progress_tx: Option<broadcast::Sender<InitializationProgress>>,
    /// Cancellation for the current cycle. Replaced per cycle, never reset.
    cancel: watch::Sender<bool>,
}

impl Inner {
    fn snapshot(&self) -> InitializationState {
        let elapsed_time = match (self.finished_elapsed, self.started_at) {
            (Some(elapsed), _) => elapsed,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        };
        InitializationState {
            is_initialized: self.phase == InitPhase::Succeeded,
            is_initializing: self.phase == InitPhase::Running,
            failed: self.phase == InitPhase::Failed,
            error_message: self.error_message.clone(),
            progress: self.progress,
            current_step: self.current_step.clone(),
            retry_count: self.retry_count,
            elapsed_time,
        }
    }

    fn publish_state(&self) {
        if let Some(tx) = &self.state_tx {
            // No receivers is fine.
            let _ = tx.send(self.snapshot());
        }
    }

    fn publish_progress(&self) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(InitializationProgress {
                progress: self.progress,
                step: self.current_step.clone(),
                timestamp: SystemTime::now(),
            });
        }
    }

    fn finish_elapsed(&mut self) {
        self.finished_elapsed = self.started_at.map(|started| started.elapsed());
    }
}

struct Shared {
    inner: Mutex<Inner>,
    /// Held by a cycle for as long as its initializer may be running.
    gate: AsyncMutex<()>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raise progress for the running cycle. `run == None` targets whatever
    /// cycle is current.
    fn advance(&self, run: Option<u64>, percent: u8, label: &str) {
        let mut inner = self.lock();
        if inner.phase != InitPhase::Running || run.is_some_and(|r| r != inner.run) {
            return;
        }
        inner.progress = inner.progress.max(percent.min(100));
        inner.current_step = label.to_string();
        inner.publish_progress();
        inner.publish_state();
    }

    /// Apply `f` to the state of `run`, if it is still current.
    fn update_run<R>(&self, run: u64, f: impl FnOnce(&mut Inner) -> R) -> Option<R> {
        let mut inner = self.lock();
        if inner.run != run {
            return None;
        }
        Some(f(&mut inner))
    }
}

// ============================================================================
// InitializationManager
// ============================================================================

/// Drives an initializer through retries, timeouts and backoff.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InitializationManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InitializationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationManager")
            .field("state", &self.state())
            .finish()
    }
}

impl Default for InitializationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InitializationManager {
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (progress_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    phase: InitPhase::Idle,
                    run: 0,
                    error_message: None,
                    progress: 0,
                    current_step: String::new(),
                    retry_count: 0,
                    started_at: None,
                    finished_elapsed: None,
                    state_tx: Some(state_tx),
                    progress_tx: Some(progress_tx),
                    cancel,
                }),
                gate: AsyncMutex::new(()),
            }),
        }
    }

    pub fn state(&self) -> InitializationState {
        self.shared.lock().snapshot()
    }

    pub fn phase(&self) -> InitPhase {
        self.shared.lock().phase
    }

    /// Run `init_fn` until it succeeds, the attempts run out, it fails
    /// fatally, or the cycle is cancelled.
    ///
    /// `init_fn` is called once per attempt and must resolve to `Ok(true)` on
    /// success. `Ok(false)` and `Err(_)` count as failed attempts.
    pub async fn run_initialization<F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        mut init_fn: F,
    ) -> InitOutcome
    where
        F: FnMut(InitContext) -> Fut + Send,
        Fut: Future<Output = Result<bool, InferenceError>> + Send,
    {
        let (run, cancellation) = {
            let mut inner = self.shared.lock();
            match inner.phase {
                InitPhase::Running => {
                    tracing::debug!("InitManager: '{}' requested while running, rejected", name);
                    return InitOutcome::AlreadyRunning;
                }
                InitPhase::Succeeded => return InitOutcome::Succeeded,
                InitPhase::Idle | InitPhase::Failed => {}
            }

            inner.run += 1;
            inner.phase = InitPhase::Running;
            inner.error_message = None;
            inner.progress = 0;
            inner.current_step = format!("Starting {}", name);
            inner.retry_count = 0;
            inner.started_at = Some(Instant::now());
            inner.finished_elapsed = None;

            let (cancel, rx) = watch::channel(false);
            inner.cancel = cancel;

            inner.publish_state();
            inner.publish_progress();
            (inner.run, CancellationHandle { rx })
        };

        let _gate = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return self.fail(
                    run,
                    name,
                    InitFailure::new(FailureKind::Cancelled, format!("{} cancelled before starting", name)),
                );
            }
            gate = self.shared.gate.lock() => gate,
        };

        let max_attempts = policy.attempts();
        tracing::info!(
            "InitManager: starting '{}' ({} attempts, {:?} per attempt)",
            name,
            max_attempts,
            policy.attempt_timeout()
        );

        loop {
            let Some(attempt) = self.shared.update_run(run, |inner| {
                inner.retry_count += 1;
                inner.progress = inner.progress.max(ATTEMPT_PROGRESS);
                inner.current_step = format!(
                    "Initializing {} (attempt {}/{})",
                    name, inner.retry_count, max_attempts
                );
                inner.publish_progress();
                inner.publish_state();
                inner.retry_count
            }) else {
                return InitOutcome::Failed(InitFailure::new(
                    FailureKind::Cancelled,
                    format!("{} was disposed", name),
                ));
            };

            let ctx = InitContext {
                progress: ProgressReporter {
                    shared: self.shared.clone(),
                    run,
                },
                cancellation: cancellation.clone(),
                attempt,
                max_attempts,
            };

            tracing::debug!("InitManager: '{}' attempt {}/{}", name, attempt, max_attempts);

            let timeout = policy.attempt_timeout();
            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(InitFailure::new(
                    FailureKind::Cancelled,
                    format!("{} cancelled during attempt {}", name, attempt),
                )),
                outcome = tokio::time::timeout(timeout, init_fn(ctx)) => match outcome {
                    Ok(Ok(true)) => Ok(()),
                    Ok(Ok(false)) => Err(InitFailure::new(
                        FailureKind::ReturnedFalse,
                        format!("{} initializer returned false", name),
                    )),
                    Ok(Err(error)) => Err(InitFailure::from_error(&error)),
                    Err(_) => Err(InitFailure::new(
                        FailureKind::Timeout,
                        format!("{} attempt {} timeout after {:?}", name, attempt, timeout),
                    )),
                },
            };

            let failure = match result {
                Ok(()) => return self.succeed(run, name),
                Err(failure) => failure,
            };

            if failure.kind.is_terminal() || attempt >= max_attempts {
                return self.fail(run, name, failure);
            }

            let backoff = policy.backoff_for(attempt);
            tracing::warn!(
                "InitManager: '{}' attempt {}/{} failed ({}), retrying in {:?}",
                name,
                attempt,
                max_attempts,
                failure.message,
                backoff
            );

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    return self.fail(
                        run,
                        name,
                        InitFailure::new(FailureKind::Cancelled, format!("{} cancelled during backoff", name)),
                    );
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    /// Clear a previous failure and run a fresh cycle.
    pub async fn retry_initialization<F, Fut>(
        &self,
        name: &str,
        policy: &RetryPolicy,
        init_fn: F,
    ) -> InitOutcome
    where
        F: FnMut(InitContext) -> Fut + Send,
        Fut: Future<Output = Result<bool, InferenceError>> + Send,
    {
        {
            let mut inner = self.shared.lock();
            if inner.phase == InitPhase::Failed {
                inner.phase = InitPhase::Idle;
                inner.error_message = None;
                inner.retry_count = 0;
                inner.progress = 0;
                inner.current_step.clear();
                inner.started_at = None;
                inner.finished_elapsed = None;
                inner.publish_state();
            }
        }
        tracing::info!("InitManager: retrying '{}'", name);
        self.run_initialization(name, policy, init_fn).await
    }

    /// Publish progress for the running cycle. Ignored when nothing runs.
    pub fn update_progress(&self, percent: u8, label: &str) {
        self.shared.advance(None, percent, label);
    }

    /// Abort the running attempt or backoff sleep, if any.
    pub fn cancel(&self) {
        let inner = self.shared.lock();
        if inner.phase == InitPhase::Running {
            tracing::info!("InitManager: cancellation requested");
            inner.cancel.send_replace(true);
        }
    }

    /// Cancel any running cycle, reset to `Idle` and close both event streams.
    ///
    /// Idempotent. The manager stays usable, but events are no longer
    /// delivered.
    pub fn dispose(&self) {
        let mut inner = self.shared.lock();
        let was_open = inner.state_tx.is_some();

        inner.cancel.send_replace(true);
        inner.run += 1;
        inner.phase = InitPhase::Idle;
        inner.error_message = None;
        inner.progress = 0;
        inner.current_step.clear();
        inner.retry_count = 0;
        inner.started_at = None;
        inner.finished_elapsed = None;
        inner.state_tx = None;
        inner.progress_tx = None;

        if was_open {
            tracing::info!("InitManager: disposed");
        }
    }

    /// Receiver of state snapshots. Closed immediately after `dispose()`.
    pub fn subscribe_state(&self) -> broadcast::Receiver<InitializationState> {
        match &self.shared.lock().state_tx {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    /// Receiver of progress events. Closed immediately after `dispose()`.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<InitializationProgress> {
        match &self.shared.lock().progress_tx {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    /// State snapshots as a stream; lagged events are skipped.
    pub fn state_updates(&self) -> impl Stream<Item = InitializationState> + Send + Unpin + 'static {
        BroadcastStream::new(self.subscribe_state()).filter_map(Result::ok)
    }

    /// Progress events as a stream; lagged events are skipped.
    pub fn progress_updates(
        &self,
    ) -> impl Stream<Item = InitializationProgress> + Send + Unpin + 'static {
        BroadcastStream::new(self.subscribe_progress()).filter_map(Result::ok)
    }

    fn succeed(&self, run: u64, name: &str) -> InitOutcome {
        let elapsed = self.shared.update_run(run, |inner| {
            inner.phase = InitPhase::Succeeded;
            inner.progress = 100;
            inner.current_step = format!("{} ready", name);
            inner.finish_elapsed();
            inner.publish_progress();
            inner.publish_state();
            inner.finished_elapsed
        });

        match elapsed {
            Some(elapsed) => {
                tracing::info!(
                    "InitManager: '{}' succeeded after {:?}",
                    name,
                    elapsed.unwrap_or_default()
                );
                InitOutcome::Succeeded
            }
            None => InitOutcome::Failed(InitFailure::new(
                FailureKind::Cancelled,
                format!("{} was disposed", name),
            )),
        }
    }

    fn fail(&self, run: u64, name: &str, failure: InitFailure) -> InitOutcome {
        self.shared.update_run(run, |inner| {
            inner.phase = InitPhase::Failed;
            inner.error_message = Some(failure.message.clone());
            inner.progress = 0;
            inner.current_step = format!("{} failed", name);
            inner.finish_elapsed();
            inner.publish_progress();
            inner.publish_state();
        });

        tracing::error!(
            "InitManager: '{}' failed ({:?}): {}",
            name,
            failure.kind,
            failure.message
        );
        InitOutcome::Failed(failure)
    }
}

fn closed_receiver<T: Clone>() -> broadcast::Receiver<T> {
    let (_, rx) = broadcast::channel(1);
    rx
}

// ============================================================================
// Tests
// ============================================================================
