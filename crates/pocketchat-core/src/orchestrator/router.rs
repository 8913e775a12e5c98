//! BackendOrchestrator: primary/fallback routing with retried initialization
//!
//! The orchestrator owns a primary backend (normally the on-device
//! [`LocalBackend`](super::local::LocalBackend)) and an optional fallback
//! (normally the [`CloudBackend`](super::cloud::CloudBackend)). It decides
//! which one serves requests and retries the primary's initialization with
//! linear backoff.
//!
//! ## State Machine
//!
//! ```text
//!                    initialize()
//! ┌───────────────┐ ────────────▶ ┌─────────────────────┐
//! │ Uninitialized │               │ InitializingPrimary │
//! └───────────────┘               └──────────┬──────────┘
//!         ▲                     ok ┌─────────┴─────────┐ retries exhausted
//!         │                        ▼                   ▼
//!         │                  ┌──────────┐     use_fallback && fallback?
//!         │                  │  Ready   │        YES │          │ NO
//!         │                  └──────────┘            ▼          │
//!         │                              ┌────────────────┐     │
//!         │                              │ FallbackActive │     │
//!         │                              └───────┬────────┘     │
//!         │                          fallback init fails        │
//!         │                                      ▼              ▼
//!         │          dispose()              ┌──────────────────────┐
//!         └──────────────────────────────── │        Failed        │
//!                                           └──────────────────────┘
//! ```
//!
//! A fatal engine load error on the final primary attempt is returned as
//! `Err(EngineLoadFailure)`; every other exhausted path resolves to
//! `Ok(false)` with [`BackendOrchestrator::last_error`] set.
//!
//! ## Generation
//!
//! Requests go to whichever backend is active. When the primary fails while a
//! fallback is enabled, the error is wrapped in
//! [`InferenceError::FallbackNotImplemented`]: there is no mid-request
//! hand-over, and the caller never receives an empty response in place of an
//! error.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use super::backend::InferenceBackend;
use super::types::{BackendHandle, BackendKind, InferenceError, InitOptions};

// ============================================================================
// Configuration & state
// ============================================================================

/// Orchestrator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrchestratorState {
    Uninitialized,
    InitializingPrimary,
    /// The primary backend serves requests.
    Ready,
    /// The fallback backend was engaged after the primary gave up.
    FallbackActive,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Sleep after primary attempt `n` is `retry_base_delay_ms * n`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Allow at most one generation in flight at a time.
    #[serde(default)]
    pub serialize_generation: bool,
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: default_retry_base_delay_ms(),
            serialize_generation: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_serialized_generation(mut self, enabled: bool) -> Self {
        self.serialize_generation = enabled;
        self
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug)]
struct Status {
    state: OrchestratorState,
    fallback_enabled: bool,
    last_error: Option<String>,
}

/// Marks an `initialize()` that was dropped before finishing as `Failed`, so
/// the status never claims an initialization nobody is driving.
struct InterruptGuard<'a> {
    status: &'a RwLock<Status>,
    armed: bool,
}

impl InterruptGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        tracing::warn!(
            "Orchestrator: initialization interrupted in {:?}",
            status.state
        );
        status.state = OrchestratorState::Failed;
        status.last_error = Some("initialization was interrupted before completing".to_string());
    }
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: OrchestratorState::Uninitialized,
            fallback_enabled: false,
            last_error: None,
        }
    }
}

// ============================================================================
// BackendOrchestrator
// ============================================================================

/// Owns the primary/fallback backend pair and routes requests between them.
pub struct BackendOrchestrator {
    primary: Arc<dyn InferenceBackend>,
    fallback: Option<Arc<dyn InferenceBackend>>,
    config: OrchestratorConfig,
    status: RwLock<Status>,
    /// Held for the whole of `initialize()` and `dispose()`.
    init_lock: Mutex<()>,
    generation_lock: Mutex<()>,
}

impl std::fmt::Debug for BackendOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendOrchestrator")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.as_ref().map(|b| b.name().to_string()))
            .field("config", &self.config)
            .finish()
    }
}

impl BackendOrchestrator {
    pub fn new(
        primary: Arc<dyn InferenceBackend>,
        fallback: Option<Arc<dyn InferenceBackend>>,
    ) -> Self {
        Self {
            primary,
            fallback,
            config: OrchestratorConfig::default(),
            status: RwLock::new(Status::default()),
            init_lock: Mutex::new(()),
            generation_lock: Mutex::new(()),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    fn read_status(&self) -> RwLockReadGuard<'_, Status> {
        self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_status(&self) -> RwLockWriteGuard<'_, Status> {
        self.status.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn state(&self) -> OrchestratorState {
        self.read_status().state
    }

    /// `true` in `Ready` and `FallbackActive`.
    pub async fn is_ready(&self) -> bool {
        matches!(
            self.state().await,
            OrchestratorState::Ready | OrchestratorState::FallbackActive
        )
    }

    /// Message describing why the last `initialize()` did not reach `Ready`.
    pub async fn last_error(&self) -> Option<String> {
        self.read_status().last_error.clone()
    }

    /// Kind of the backend currently serving requests.
    pub async fn active_kind(&self) -> Option<BackendKind> {
        match self.state().await {
            OrchestratorState::Ready => Some(self.primary.kind()),
            OrchestratorState::FallbackActive => self.fallback.as_ref().map(|b| b.kind()),
            _ => None,
        }
    }

    /// Snapshots of the primary and, if configured, the fallback backend.
    pub async fn handles(&self) -> Vec<BackendHandle> {
        let mut handles = vec![self.primary.handle().await];
        if let Some(fallback) = &self.fallback {
            handles.push(fallback.handle().await);
        }
        handles
    }

    fn set_state(&self, state: OrchestratorState, last_error: Option<String>) {
        let mut status = self.write_status();
        status.state = state;
        status.last_error = last_error;
    }

    /// Bring up the primary backend, falling back if allowed.
    ///
    /// Returns `Ok(true)` once a backend serves requests and `Ok(false)` when
    /// every path failed. Already-ready orchestrators return `Ok(true)` without
    /// touching the backends.
    ///
    /// Dropping the returned future part-way (for example on a caller timeout)
    /// leaves the orchestrator `Failed` rather than `InitializingPrimary`.
    pub async fn initialize(&self, options: &InitOptions) -> Result<bool, InferenceError> {
        let _init = self.init_lock.lock().await;

        let mut interrupted = InterruptGuard {
            status: &self.status,
            armed: true,
        };
        let result = self.initialize_locked(options).await;
        interrupted.disarm();
        result
    }

    async fn initialize_locked(&self, options: &InitOptions) -> Result<bool, InferenceError> {
        {
            let mut status = self.write_status();
            if matches!(
                status.state,
                OrchestratorState::Ready | OrchestratorState::FallbackActive
            ) {
                return Ok(true);
            }
            status.state = OrchestratorState::InitializingPrimary;
            status.fallback_enabled = options.use_fallback;
            status.last_error = None;
        }

        let attempts = options.retry_count.max(1);
        let backend_options = options.backend_options();
        let mut primary_error = None;

        for attempt in 1..=attempts {
            tracing::info!(
                "Orchestrator: initializing primary '{}' (attempt {}/{})",
                self.primary.name(),
                attempt,
                attempts
            );

            match self.primary.initialize(&backend_options).await {
                Ok(()) => {
                    self.set_state(OrchestratorState::Ready, None);
                    tracing::info!("Orchestrator: primary '{}' ready", self.primary.name());
                    return Ok(true);
                }
                Err(e) if attempt == attempts && e.is_fatal() => {
                    tracing::error!(
                        "Orchestrator: primary '{}' cannot load its engine: {}",
                        self.primary.name(),
                        e
                    );
                    self.set_state(OrchestratorState::Failed, Some(e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(
                        "Orchestrator: primary attempt {}/{} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    primary_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.backoff_for(attempt)).await;
            }
        }

        let primary_message = primary_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "primary backend failed".to_string());

        if !options.use_fallback {
            tracing::error!(
                "Orchestrator: primary failed after {} attempts, fallback disabled",
                attempts
            );
            self.set_state(OrchestratorState::Failed, Some(primary_message));
            return Ok(false);
        }

        let Some(fallback) = &self.fallback else {
            let message = format!("{}; no fallback backend configured", primary_message);
            tracing::error!("Orchestrator: {}", message);
            self.set_state(OrchestratorState::Failed, Some(message));
            return Ok(false);
        };

        tracing::warn!(
            "Orchestrator: primary exhausted, engaging fallback '{}'",
            fallback.name()
        );
        self.set_state(OrchestratorState::FallbackActive, None);

        match fallback.initialize(&backend_options).await {
            Ok(()) => {
                tracing::info!("Orchestrator: fallback '{}' active", fallback.name());
                Ok(true)
            }
            Err(e) => {
                let message = format!("{}; fallback: {}", primary_message, e);
                tracing::error!("Orchestrator: fallback '{}' failed: {}", fallback.name(), e);
                self.set_state(OrchestratorState::Failed, Some(message));
                Ok(false)
            }
        }
    }

    /// Backend serving requests, and whether a primary failure should be
    /// reported as a missing fallback hand-over.
    async fn active_backend(&self) -> Result<(&Arc<dyn InferenceBackend>, bool), InferenceError> {
        let status = self.read_status();
        match (status.state, &self.fallback) {
            (OrchestratorState::Ready, _) => Ok((&self.primary, status.fallback_enabled)),
            (OrchestratorState::FallbackActive, Some(fallback)) => Ok((fallback, false)),
            (state, _) => Err(InferenceError::NotInitialized(format!(
                "orchestrator is {:?}",
                state
            ))),
        }
    }

    async fn generation_guard(&self) -> Option<MutexGuard<'_, ()>> {
        if self.config.serialize_generation {
            Some(self.generation_lock.lock().await)
        } else {
            None
        }
    }

    fn route_error(&self, error: InferenceError, wrap: bool) -> InferenceError {
        if wrap {
            tracing::warn!(
                "Orchestrator: primary '{}' failed with fallback enabled: {}",
                self.primary.name(),
                error
            );
            InferenceError::FallbackNotImplemented {
                source: Box::new(error),
            }
        } else {
            error
        }
    }

    /// Generate a complete response on the active backend.
    pub async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        let _serial = self.generation_guard().await;
        let (backend, wrap) = self.active_backend().await?;

        tracing::debug!("Orchestrator: generate via '{}'", backend.name());
        backend
            .generate(prompt)
            .await
            .map_err(|e| self.route_error(e, wrap))
    }

    /// Stream a response into `on_chunk` and return the full text.
    pub async fn generate_stream(
        &self,
        prompt: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, InferenceError> {
        let _serial = self.generation_guard().await;
        let (backend, wrap) = self.active_backend().await?;

        tracing::debug!(
            "Orchestrator: stream via '{}' (native: {})",
            backend.name(),
            backend.supports_native_streaming()
        );
        backend
            .generate_stream(prompt, on_chunk)
            .await
            .map_err(|e| self.route_error(e, wrap))
    }

    /// Whether the active backend streams tokens natively.
    pub async fn supports_native_streaming(&self) -> bool {
        match self.active_backend().await {
            Ok((backend, _)) => backend.supports_native_streaming(),
            Err(_) => self.primary.supports_native_streaming(),
        }
    }

    /// Dispose every backend and return to `Uninitialized`. Idempotent.
    ///
    /// Waits for an in-flight `initialize()` so it cannot mark a disposed
    /// backend ready afterwards.
    pub async fn dispose(&self) {
        let _init = self.init_lock.lock().await;

        self.primary.dispose().await;
        if let Some(fallback) = &self.fallback {
            fallback.dispose().await;
        }

        let mut status = self.write_status();
        if status.state != OrchestratorState::Uninitialized {
            tracing::info!("Orchestrator: disposed (was {:?})", status.state);
        }
        *status = Status::default();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::backend::ChunkStream;
    use crate::orchestrator::cloud::CloudBackend;
    use crate::orchestrator::types::{BackendOptions, ErrorKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::time::Instant;

    /// Scriptable backend used across the orchestrator tests.
    struct MockBackend {
        kind: BackendKind,
        failures_before_ready: u32,
        fatal: bool,
        fail_generation: bool,
        chunks: Vec<&'static str>,
        generation_delay: Duration,
        init_delay: Duration,
        ready: AtomicBool,
        init_calls: AtomicU32,
        dispose_calls: AtomicU32,
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
    }

    impl MockBackend {
        fn new(kind: BackendKind) -> Self {
            Self {
                kind,
                failures_before_ready: 0,
                fatal: false,
                fail_generation: false,
                chunks: vec!["a", "b", "c"],
                generation_delay: Duration::ZERO,
                init_delay: Duration::ZERO,
                ready: AtomicBool::new(false),
                init_calls: AtomicU32::new(0),
                dispose_calls: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
            }
        }

        fn failing(kind: BackendKind) -> Self {
            let mut backend = Self::new(kind);
            backend.failures_before_ready = u32::MAX;
            backend
        }
    }

    #[async_trait]
    impl InferenceBackend for MockBackend {
        fn name(&self) -> &str {
            match self.kind {
                BackendKind::Local => "mock-local",
                BackendKind::Cloud => "mock-cloud",
            }
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn supports_native_streaming(&self) -> bool {
            true
        }

        async fn initialize(&self, _options: &BackendOptions) -> Result<(), InferenceError> {
            let call = self.init_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.init_delay.is_zero() {
                tokio::time::sleep(self.init_delay).await;
            }
            if call <= self.failures_before_ready {
                return Err(if self.fatal {
                    InferenceError::EngineLoadFailure("libllm.so not found".into())
                } else {
                    InferenceError::InitializationFailed(format!("attempt {} failed", call))
                });
            }
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn handle(&self) -> BackendHandle {
            BackendHandle {
                kind: self.kind,
                ready: self.ready.load(Ordering::SeqCst),
                using_accelerator: false,
            }
        }

        async fn generate(&self, _prompt: &str) -> Result<String, InferenceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.generation_delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_generation {
                Err(InferenceError::InferenceFailure("engine crashed".into()))
            } else {
                Ok(format!("{} says hi", self.name()))
            }
        }

        async fn stream(&self, _prompt: &str) -> Result<ChunkStream, InferenceError> {
            if self.fail_generation {
                return Err(InferenceError::InferenceFailure("engine crashed".into()));
            }
            let chunks: Vec<Result<String, InferenceError>> =
                self.chunks.iter().map(|c| Ok(c.to_string())).collect();
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        async fn dispose(&self) {
            self.dispose_calls.fetch_add(1, Ordering::SeqCst);
            self.ready.store(false, Ordering::SeqCst);
        }
    }

    fn orchestrator(
        primary: Arc<MockBackend>,
        fallback: Option<Arc<dyn InferenceBackend>>,
    ) -> BackendOrchestrator {
        BackendOrchestrator::new(primary, fallback)
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_success_reaches_ready() {
        let primary = Arc::new(MockBackend::new(BackendKind::Local));
        let orch = orchestrator(primary.clone(), None);

        assert!(orch.initialize(&InitOptions::default()).await.unwrap());
        assert_eq!(orch.state().await, OrchestratorState::Ready);
        assert_eq!(orch.active_kind().await, Some(BackendKind::Local));
        assert!(orch.last_error().await.is_none());

        // Already ready: backends are not touched again.
        assert!(orch.initialize(&InitOptions::default()).await.unwrap());
        assert_eq!(primary.init_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_retries_with_linear_backoff() {
        let mut primary = MockBackend::new(BackendKind::Local);
        primary.failures_before_ready = 2;
        let primary = Arc::new(primary);
        let orch = orchestrator(primary.clone(), None);
        let started = Instant::now();

        assert!(orch.initialize(&InitOptions::default()).await.unwrap());
        assert_eq!(primary.init_calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(1 + 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_primary_without_fallback() {
        let primary = Arc::new(MockBackend::failing(BackendKind::Local));
        let orch = orchestrator(primary.clone(), None);

        let ok = orch
            .initialize(&InitOptions::default().with_fallback(false))
            .await
            .unwrap();

        assert!(!ok);
        assert_eq!(orch.state().await, OrchestratorState::Failed);
        assert!(!orch.last_error().await.unwrap().is_empty());
        assert_eq!(primary.init_calls.load(Ordering::SeqCst), 3);
        assert!(!orch.is_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_on_final_attempt_is_raised() {
        let mut primary = MockBackend::failing(BackendKind::Local);
        primary.fatal = true;
        let orch = orchestrator(Arc::new(primary), None);

        let err = orch
            .initialize(&InitOptions::default().with_retry_count(2))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EngineLoadFailure);
        assert_eq!(orch.state().await, OrchestratorState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_fallback_fails() {
        let primary = Arc::new(MockBackend::failing(BackendKind::Local));
        let cloud: Arc<dyn InferenceBackend> = Arc::new(CloudBackend::unavailable());
        let orch = orchestrator(primary, Some(cloud));

        let ok = orch
            .initialize(&InitOptions::default().with_fallback(true))
            .await
            .unwrap();

        assert!(!ok);
        assert_eq!(orch.state().await, OrchestratorState::Failed);
        assert!(orch.last_error().await.unwrap().contains("unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_working_fallback_serves_requests() {
        let primary = Arc::new(MockBackend::failing(BackendKind::Local));
        let cloud = Arc::new(MockBackend::new(BackendKind::Cloud));
        let orch = orchestrator(primary, Some(cloud.clone()));

        assert!(orch
            .initialize(&InitOptions::default().with_fallback(true).with_retry_count(1))
            .await
            .unwrap());
        assert_eq!(orch.state().await, OrchestratorState::FallbackActive);
        assert_eq!(orch.active_kind().await, Some(BackendKind::Cloud));
        assert_eq!(orch.generate("hi").await.unwrap(), "mock-cloud says hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_fallback_with_fallback_enabled() {
        let primary = Arc::new(MockBackend::failing(BackendKind::Local));
        let orch = orchestrator(primary, None);

        let ok = orch
            .initialize(&InitOptions::default().with_fallback(true).with_retry_count(1))
            .await
            .unwrap();

        assert!(!ok);
        assert!(orch.last_error().await.unwrap().contains("no fallback"));
    }

    #[tokio::test]
    async fn test_generate_before_initialize() {
        let orch = orchestrator(Arc::new(MockBackend::new(BackendKind::Local)), None);

        let err = orch.generate("hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);

        let err = orch.generate_stream("hi", &mut |_: &str| {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn test_generation_failure_with_fallback_enabled_is_wrapped() {
        let mut primary = MockBackend::new(BackendKind::Local);
        primary.fail_generation = true;
        let cloud: Arc<dyn InferenceBackend> = Arc::new(CloudBackend::unavailable());
        let orch = orchestrator(Arc::new(primary), Some(cloud));
        orch.initialize(&InitOptions::default().with_fallback(true))
            .await
            .unwrap();

        match orch.generate("hi").await {
            Err(InferenceError::FallbackNotImplemented { source }) => {
                assert_eq!(source.kind(), ErrorKind::InferenceFailure);
            }
            other => panic!("expected FallbackNotImplemented, got {:?}", other),
        }

        let err = orch.generate_stream("hi", &mut |_: &str| {}).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FallbackNotImplemented);
    }

    #[tokio::test]
    async fn test_generation_failure_without_fallback_propagates() {
        let mut primary = MockBackend::new(BackendKind::Local);
        primary.fail_generation = true;
        let orch = orchestrator(Arc::new(primary), None);
        orch.initialize(&InitOptions::default()).await.unwrap();

        let err = orch.generate("hi").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InferenceFailure);
    }

    #[tokio::test]
    async fn test_stream_delivers_chunks_in_order() {
        let orch = orchestrator(Arc::new(MockBackend::new(BackendKind::Local)), None);
        orch.initialize(&InitOptions::default()).await.unwrap();

        let mut seen = Vec::new();
        let full = orch
            .generate_stream("hi", &mut |c: &str| seen.push(c.to_string()))
            .await
            .unwrap();

        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(full, "abc");
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let primary = Arc::new(MockBackend::new(BackendKind::Local));
        let cloud = Arc::new(MockBackend::new(BackendKind::Cloud));
        let orch = orchestrator(primary.clone(), Some(cloud.clone()));
        orch.initialize(&InitOptions::default()).await.unwrap();

        orch.dispose().await;
        orch.dispose().await;

        assert_eq!(orch.state().await, OrchestratorState::Uninitialized);
        assert!(orch.handles().await.iter().all(|h| !h.ready));
        assert_eq!(primary.dispose_calls.load(Ordering::SeqCst), 2);
        assert_eq!(cloud.dispose_calls.load(Ordering::SeqCst), 2);
        assert!(orch.generate("hi").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serialized_generation_allows_one_in_flight() {
        let mut primary = MockBackend::new(BackendKind::Local);
        primary.generation_delay = Duration::from_millis(100);
        let primary = Arc::new(primary);
        let orch = Arc::new(
            BackendOrchestrator::new(primary.clone(), None)
                .with_config(OrchestratorConfig::default().with_serialized_generation(true)),
        );
        orch.initialize(&InitOptions::default()).await.unwrap();

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let orch = orch.clone();
                tokio::spawn(async move { orch.generate("hi").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(primary.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_is_concurrent_by_default() {
        let mut primary = MockBackend::new(BackendKind::Local);
        primary.generation_delay = Duration::from_millis(100);
        let primary = Arc::new(primary);
        let orch = Arc::new(BackendOrchestrator::new(primary.clone(), None));
        orch.initialize(&InitOptions::default()).await.unwrap();

        let (a, b) = tokio::join!(orch.generate("one"), orch.generate("two"));
        a.unwrap();
        b.unwrap();

        assert_eq!(primary.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_initialize_leaves_failed_state() {
        let mut primary = MockBackend::new(BackendKind::Local);
        primary.init_delay = Duration::from_secs(60);
        let orch = orchestrator(Arc::new(primary), None);

        let attempt = tokio::time::timeout(
            Duration::from_millis(100),
            orch.initialize(&InitOptions::default()),
        )
        .await;
        assert!(attempt.is_err());

        assert_eq!(orch.state().await, OrchestratorState::Failed);
        assert!(orch.last_error().await.unwrap().contains("interrupted"));
        assert!(!orch.is_ready().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_waits_for_running_initialize() {
        let mut primary = MockBackend::new(BackendKind::Local);
        primary.init_delay = Duration::from_millis(500);
        let primary = Arc::new(primary);
        let orch = Arc::new(orchestrator(primary.clone(), None));

        let init = tokio::spawn({
            let orch = orch.clone();
            async move { orch.initialize(&InitOptions::default()).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        orch.dispose().await;

        assert!(init.await.unwrap().unwrap());
        assert_eq!(orch.state().await, OrchestratorState::Uninitialized);
        assert!(!primary.ready.load(Ordering::SeqCst));
        assert_eq!(primary.dispose_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_orchestrator_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<BackendOrchestrator>();
    }
}
