//! Lifecycle Test Suite: end-to-end initialization and generation
//!
//! Drives the public API the way the UI shell does: a [`ChatService`] built on
//! a temporary asset bundle and a scripted [`TextEngine`], observed through its
//! state and progress subscriptions. Timing-sensitive cases run on a paused
//! tokio clock, so backoff and timeouts are exact and instant.

#[cfg(test)]
mod lifecycle_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use tokio::time::Instant;

    use pocketchat_core::orchestrator::{
        AssetStore, BackendOrchestrator, ChunkStream, CloudGeneration, EngineChunkStream,
        EngineConfig, EngineError, FailureKind, InferenceBackend, InitPhase,
        InitializationManager, LocalBackend, LocalBackendConfig, ModelAssetConfig,
        ModelPathResolver, OrchestratorState, TextEngine,
    };
    use pocketchat_core::{
        ChatConfig, ChatService, ErrorKind, InferenceError, InitOptions, InitOutcome, RetryPolicy,
    };

    // ========================================================================
    // Fixtures
    // ========================================================================

    #[derive(Clone, Copy)]
    enum LoadBehavior {
        Succeed,
        /// Fail this many loads with a retryable error, then succeed.
        FailFirst(u32),
        /// The native library is missing.
        LibraryMissing,
        /// Never resolve.
        Hang,
        /// Refuse the accelerator, accept the CPU path.
        NoAccelerator,
    }

    struct TestEngine {
        behavior: LoadBehavior,
        response: &'static str,
        native_chunks: Option<Vec<&'static str>>,
        loads: AtomicU32,
    }

    impl TestEngine {
        fn new(behavior: LoadBehavior) -> Self {
            Self {
                behavior,
                response: "Hello there. How can I help?",
                native_chunks: None,
                loads: AtomicU32::new(0),
            }
        }

        fn streaming(chunks: Vec<&'static str>) -> Self {
            Self {
                native_chunks: Some(chunks),
                ..Self::new(LoadBehavior::Succeed)
            }
        }

        fn loads(&self) -> u32 {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextEngine for TestEngine {
        fn name(&self) -> &str {
            "test-engine"
        }

        fn supports_native_streaming(&self) -> bool {
            self.native_chunks.is_some()
        }

        async fn load(&self, config: &EngineConfig) -> Result<(), EngineError> {
            let n = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
            match self.behavior {
                LoadBehavior::Succeed => Ok(()),
                LoadBehavior::FailFirst(failures) if n <= failures => {
                    Err(EngineError::Failed(format!("load {} failed", n)))
                }
                LoadBehavior::FailFirst(_) => Ok(()),
                LoadBehavior::LibraryMissing => {
                    Err(EngineError::LibraryLoad("libllm_inference_engine_jni.so".into()))
                }
                LoadBehavior::Hang => std::future::pending().await,
                LoadBehavior::NoAccelerator if config.use_accelerator => {
                    Err(EngineError::AcceleratorUnavailable("GPU delegate rejected".into()))
                }
                LoadBehavior::NoAccelerator => Ok(()),
            }
        }

        async fn generate(&self, _prompt: &str) -> Result<String, EngineError> {
            Ok(self.response.to_string())
        }

        async fn generate_stream(&self, _prompt: &str) -> Result<EngineChunkStream, EngineError> {
            let chunks = self
                .native_chunks
                .clone()
                .ok_or(EngineError::StreamingUnsupported)?;
            Ok(Box::pin(futures::stream::iter(
                chunks.into_iter().map(|c| Ok(c.to_string())),
            )))
        }

        async fn close(&self) {}
    }

    struct Bundle {
        assets: tempfile::TempDir,
        storage: tempfile::TempDir,
    }

    impl Bundle {
        fn new() -> Self {
            let assets = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(assets.path().join("models")).unwrap();
            std::fs::write(assets.path().join("models/gemma.task"), b"gemma weights").unwrap();
            Self {
                assets,
                storage: tempfile::tempdir().unwrap(),
            }
        }

        fn config(&self) -> ChatConfig {
            let mut config = ChatConfig::default();
            config.model = ModelAssetConfig::new("gemma", self.storage.path());
            config.asset_root = self.assets.path().to_path_buf();
            config.local = LocalBackendConfig::default().with_chunk_delay(Duration::from_millis(50));
            config.retry = RetryPolicy::default()
                .with_max_retries(3)
                .with_attempt_timeout(Duration::from_secs(5));
            config
        }
    }

    fn single_pass() -> InitOptions {
        InitOptions::default().with_retry_count(1)
    }

    fn service(bundle: &Bundle, engine: Arc<TestEngine>) -> ChatService {
        ChatService::from_config(&bundle.config(), engine, None)
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_failing_primary_without_fallback_ends_failed() {
        let bundle = Bundle::new();
        let engine = Arc::new(TestEngine::new(LoadBehavior::FailFirst(u32::MAX)));
        let service = service(&bundle, engine.clone());
        let mut states = service.state_updates();

        let outcome = service
            .initialize(&InitOptions::default().with_fallback(false))
            .await;

        assert_eq!(outcome.failure().unwrap().kind, FailureKind::ReturnedFalse);
        assert_eq!(service.orchestrator().state().await, OrchestratorState::Failed);
        assert!(!service.orchestrator().last_error().await.unwrap().is_empty());
        assert!(!service.last_error().await.unwrap().is_empty());
        assert!(!service.is_initialized().await);

        // 3 manager attempts x 3 orchestrator attempts
        assert_eq!(engine.loads(), 9);

        service.dispose().await;
        let mut saw_ready = false;
        while let Some(state) = states.next().await {
            saw_ready |= state.is_initialized;
        }
        assert!(!saw_ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_success_on_second_attempt() {
        let bundle = Bundle::new();
        let engine = Arc::new(TestEngine::new(LoadBehavior::FailFirst(1)));
        let service = service(&bundle, engine.clone());

        let outcome = service.initialize(&single_pass()).await;

        assert_eq!(outcome, InitOutcome::Succeeded);
        let state = service.state();
        assert!(state.is_initialized);
        assert_eq!(state.retry_count, 2);
        assert_eq!(engine.loads(), 2);
        assert!(service.is_initialized().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_is_idempotent() {
        let bundle = Bundle::new();
        let engine = Arc::new(TestEngine::new(LoadBehavior::Succeed));
        let service = service(&bundle, engine.clone());

        for _ in 0..3 {
            assert!(service.initialize(&single_pass()).await.is_success());
        }
        assert_eq!(engine.loads(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_initialize_runs_once() {
        let bundle = Bundle::new();
        // The failed first load keeps the cycle running through a backoff.
        let engine = Arc::new(TestEngine::new(LoadBehavior::FailFirst(1)));
        let service = Arc::new(service(&bundle, engine.clone()));

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.initialize(&single_pass()).await })
        };
        while service.state().phase() != InitPhase::Running {
            tokio::task::yield_now().await;
        }

        let second = service.initialize(&single_pass()).await;
        assert_eq!(second, InitOutcome::AlreadyRunning);

        assert!(first.await.unwrap().is_success());
        assert_eq!(engine.loads(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_load_times_out() {
        let bundle = Bundle::new();
        let mut config = bundle.config();
        config.retry = RetryPolicy::default()
            .with_max_retries(2)
            .with_attempt_timeout(Duration::from_millis(200));
        let engine = Arc::new(TestEngine::new(LoadBehavior::Hang));
        let service = ChatService::from_config(&config, engine.clone(), None);
        let started = Instant::now();

        let outcome = service.initialize(&single_pass()).await;

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("timeout"));
        assert!(service.state().error_message.unwrap().contains("timeout"));
        assert_eq!(engine.loads(), 2);

        // Nothing is left half-initialized behind the manager's back.
        let orchestrator = service.orchestrator();
        assert_eq!(orchestrator.state().await, OrchestratorState::Failed);
        assert!(orchestrator.last_error().await.is_some());
        assert!(!service.is_initialized().await);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_engine_library_is_fatal() {
        let bundle = Bundle::new();
        let engine = Arc::new(TestEngine::new(LoadBehavior::LibraryMissing));
        let service = service(&bundle, engine.clone());

        let outcome = service
            .initialize(&InitOptions::default().with_retry_count(2))
            .await;

        assert_eq!(outcome.failure().unwrap().kind, FailureKind::Fatal);
        // The orchestrator tried twice; the manager did not retry a fatal error.
        assert_eq!(engine.loads(), 2);
        assert_eq!(service.state().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_asset_fails_with_message() {
        let bundle = Bundle::new();
        std::fs::remove_file(bundle.assets.path().join("models/gemma.task")).unwrap();
        let engine = Arc::new(TestEngine::new(LoadBehavior::Succeed));
        let service = service(&bundle, engine.clone());

        let outcome = service.initialize(&single_pass()).await;

        assert!(!outcome.is_success());
        assert!(service
            .orchestrator()
            .last_error()
            .await
            .unwrap()
            .contains("not found"));
        assert_eq!(engine.loads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accelerator_refusal_falls_back_to_cpu() {
        let bundle = Bundle::new();
        let service = service(&bundle, Arc::new(TestEngine::new(LoadBehavior::NoAccelerator)));

        assert!(service.initialize(&single_pass()).await.is_success());

        let handles = service.orchestrator().handles().await;
        assert!(handles[0].ready);
        assert!(!handles[0].using_accelerator);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_failure() {
        let bundle = Bundle::new();
        let mut config = bundle.config();
        config.retry = config.retry.with_max_retries(1);
        let engine = Arc::new(TestEngine::new(LoadBehavior::FailFirst(1)));
        let service = ChatService::from_config(&config, engine.clone(), None);

        assert!(!service.initialize(&single_pass()).await.is_success());
        assert!(service.state().failed);

        assert!(service.retry(&single_pass()).await.is_success());
        let state = service.state();
        assert!(state.is_initialized);
        assert!(state.error_message.is_none());
    }

    // ========================================================================
    // Progress
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic_and_ends_at_100() {
        let bundle = Bundle::new();
        let service = service(&bundle, Arc::new(TestEngine::new(LoadBehavior::Succeed)));
        let progress = service.progress_updates();

        assert!(service.initialize(&single_pass()).await.is_success());
        service.dispose().await;

        let events: Vec<_> = progress.collect().await;
        let values: Vec<u8> = events.iter().map(|e| e.progress).collect();

        assert_eq!(values.first(), Some(&0));
        assert_eq!(values.last(), Some(&100));
        assert!(values.windows(2).all(|w| w[0] <= w[1]), "{:?}", values);
        assert!(events.iter().any(|e| e.step.starts_with("Loading model")));
    }

    // ========================================================================
    // Generation
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_native_stream_preserves_order() {
        let bundle = Bundle::new();
        let service = service(&bundle, Arc::new(TestEngine::streaming(vec!["a", "b", "c"])));
        service.initialize(&single_pass()).await;

        let mut seen = Vec::new();
        let full = service
            .generate_response_stream("x", &mut |c: &str| seen.push(c.to_string()))
            .await
            .unwrap();

        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(full, "abc");
        assert!(service.supports_native_streaming().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_stream_replays_sentences_with_delay() {
        let bundle = Bundle::new();
        let service = service(&bundle, Arc::new(TestEngine::new(LoadBehavior::Succeed)));
        service.initialize(&single_pass()).await;
        assert!(!service.supports_native_streaming().await);

        let started = Instant::now();
        let mut seen = Vec::new();
        let full = service
            .generate_response_stream("x", &mut |c: &str| seen.push(c.to_string()))
            .await
            .unwrap();

        assert_eq!(seen, vec!["Hello there. ", "How can I help?"]);
        assert_eq!(full, "Hello there. How can I help?");
        assert_eq!(started.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_generate_before_initialize() {
        let bundle = Bundle::new();
        let service = service(&bundle, Arc::new(TestEngine::new(LoadBehavior::Succeed)));

        let err = service.generate_response("hello").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    // ========================================================================
    // Disposal
    // ========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_dispose_twice_is_safe() {
        let bundle = Bundle::new();
        let service = service(&bundle, Arc::new(TestEngine::new(LoadBehavior::Succeed)));
        let mut states = service.subscribe_state();
        service.initialize(&single_pass()).await;

        service.dispose().await;
        service.dispose().await;

        assert!(!service.is_initialized().await);
        assert_eq!(
            service.orchestrator().state().await,
            OrchestratorState::Uninitialized
        );
        assert!(service.generate_response("hello").await.is_err());

        // Buffered events drain, then the stream reports closed.
        while states.recv().await.is_ok() {}
        assert!(states.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_running_initialization() {
        let bundle = Bundle::new();
        let service = Arc::new(service(&bundle, Arc::new(TestEngine::new(LoadBehavior::Hang))));

        let run = {
            let service = service.clone();
            tokio::spawn(async move { service.initialize(&single_pass()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        service.dispose().await;

        let outcome = run.await.unwrap();
        assert_eq!(outcome.failure().unwrap().kind, FailureKind::Cancelled);
        assert_eq!(service.state().phase(), InitPhase::Idle);
    }

    // ========================================================================
    // Asset resolution & cloud fallback (custom wiring)
    // ========================================================================

    struct CountingStore {
        loads: AtomicU32,
    }

    #[async_trait]
    impl AssetStore for CountingStore {
        async fn exists(&self, path: &str) -> bool {
            path.ends_with(".task")
        }

        async fn load(&self, _path: &str) -> Result<Vec<u8>, InferenceError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(b"gemma weights".to_vec())
        }
    }

    struct EchoCloud;

    #[async_trait]
    impl CloudGeneration for EchoCloud {
        fn name(&self) -> &str {
            "echo-cloud"
        }

        async fn connect(&self) -> Result<(), InferenceError> {
            Ok(())
        }

        async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
            Ok(format!("cloud: {}", prompt))
        }

        async fn generate_stream(&self, prompt: &str) -> Result<ChunkStream, InferenceError> {
            let reply = format!("cloud: {}", prompt);
            Ok(Box::pin(futures::stream::iter(vec![Ok(reply)])))
        }
    }

    #[tokio::test]
    async fn test_asset_is_copied_once_across_reinitialization() {
        let storage = tempfile::tempdir().unwrap();
        let store = Arc::new(CountingStore {
            loads: AtomicU32::new(0),
        });
        let resolver = Arc::new(ModelPathResolver::new(
            ModelAssetConfig::new("gemma", storage.path()),
            store.clone(),
        ));
        let local: Arc<dyn InferenceBackend> = Arc::new(LocalBackend::new(
            LocalBackendConfig::default(),
            resolver.clone(),
            Arc::new(TestEngine::new(LoadBehavior::Succeed)),
        ));
        let service = ChatService::new(
            Arc::new(BackendOrchestrator::new(local, None)),
            InitializationManager::new(),
            RetryPolicy::default(),
        );

        assert!(service.initialize(&single_pass()).await.is_success());
        service.dispose().await;
        assert!(service.initialize(&single_pass()).await.is_success());

        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        let path = resolver.resolved_path().await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"gemma weights");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_fallback_serves_when_local_fails() {
        let bundle = Bundle::new();
        let engine = Arc::new(TestEngine::new(LoadBehavior::FailFirst(u32::MAX)));
        let service = ChatService::from_config(&bundle.config(), engine, Some(Arc::new(EchoCloud)));

        let outcome = service
            .initialize(&InitOptions::default().with_fallback(true).with_retry_count(2))
            .await;

        assert!(outcome.is_success());
        assert_eq!(
            service.orchestrator().state().await,
            OrchestratorState::FallbackActive
        );
        assert_eq!(service.generate_response("hi").await.unwrap(), "cloud: hi");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfigured_cloud_fallback_fails() {
        let bundle = Bundle::new();
        let engine = Arc::new(TestEngine::new(LoadBehavior::FailFirst(u32::MAX)));
        let service = service(&bundle, engine);

        let outcome = service
            .initialize(&InitOptions::default().with_fallback(true).with_retry_count(1))
            .await;

        assert!(!outcome.is_success());
        assert_eq!(service.orchestrator().state().await, OrchestratorState::Failed);
        assert!(service
            .orchestrator()
            .last_error()
            .await
            .unwrap()
            .contains("unavailable"));
    }
}
