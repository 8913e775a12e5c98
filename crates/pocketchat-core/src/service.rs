//! ChatService: the surface the UI shell talks to.
//!
//! Wires one [`InitializationManager`] to one [`BackendOrchestrator`]. The
//! manager retries the orchestrator's `initialize()` with a per-attempt
//! timeout and publishes progress while it runs; once it succeeds, generation
//! requests go straight to the orchestrator.
//!
//! There is no global instance. Construct one with [`ChatService::from_config`]
//! (or [`ChatService::new`] for custom wiring) and share it behind an `Arc`.

use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;

use crate::config::ChatConfig;
use crate::orchestrator::{
    BackendOrchestrator, CloudBackend, CloudGeneration, DirAssetStore, InferenceBackend,
    InferenceError, InitOptions, InitOutcome, InitializationManager, InitializationProgress,
    InitializationState, LocalBackend, ModelPathResolver, RetryPolicy, TextEngine,
};

/// Name the initialization cycle is published under.
const INIT_NAME: &str = "chat model";

pub struct ChatService {
    orchestrator: Arc<BackendOrchestrator>,
    manager: InitializationManager,
    policy: RetryPolicy,
    default_options: InitOptions,
}

impl std::fmt::Debug for ChatService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatService")
            .field("orchestrator", &self.orchestrator)
            .field("manager", &self.manager)
            .field("policy", &self.policy)
            .finish()
    }
}

impl ChatService {
    pub fn new(
        orchestrator: Arc<BackendOrchestrator>,
        manager: InitializationManager,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            orchestrator,
            manager,
            policy,
            default_options: InitOptions::default(),
        }
    }

    /// Build the full stack: bundled assets under `config.asset_root`, a
    /// local backend over `engine`, and a cloud fallback over `cloud` (or an
    /// unavailable one).
    pub fn from_config(
        config: &ChatConfig,
        engine: Arc<dyn TextEngine>,
        cloud: Option<Arc<dyn CloudGeneration>>,
    ) -> Self {
        let store = Arc::new(DirAssetStore::new(&config.asset_root));
        let resolver = Arc::new(ModelPathResolver::new(config.model.clone(), store));
        let local: Arc<dyn InferenceBackend> =
            Arc::new(LocalBackend::new(config.local.clone(), resolver, engine));

        let cloud: Arc<dyn InferenceBackend> = Arc::new(match cloud {
            Some(provider) => CloudBackend::with_provider(provider),
            None => CloudBackend::unavailable(),
        });

        let orchestrator = BackendOrchestrator::new(local, Some(cloud))
            .with_config(config.orchestrator.clone());

        tracing::info!(
            "ChatService: configured for '{}' (assets in {})",
            config.model.logical_name,
            config.asset_root.display()
        );

        Self::new(
            Arc::new(orchestrator),
            InitializationManager::new(),
            config.retry.clone(),
        )
        .with_default_options(config.init.clone())
    }

    pub fn with_default_options(mut self, options: InitOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn orchestrator(&self) -> &Arc<BackendOrchestrator> {
        &self.orchestrator
    }

    pub fn manager(&self) -> &InitializationManager {
        &self.manager
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Bring the model up under the manager's retry policy.
    pub async fn initialize(&self, options: &InitOptions) -> InitOutcome {
        let orchestrator = self.orchestrator.clone();
        let options = options.clone();

        self.manager
            .run_initialization(INIT_NAME, &self.policy, move |ctx| {
                let orchestrator = orchestrator.clone();
                let options = options.clone();
                async move {
                    ctx.cancellation().check()?;
                    ctx.progress().report(
                        30,
                        &format!(
                            "Loading model (attempt {}/{})",
                            ctx.attempt(),
                            ctx.max_attempts()
                        ),
                    );

                    let ready = orchestrator.initialize(&options).await?;
                    if ready {
                        ctx.progress().report(90, "Model loaded");
                    }
                    Ok::<bool, InferenceError>(ready)
                }
            })
            .await
    }

    /// `initialize` with the options from the service's configuration.
    pub async fn initialize_default(&self) -> InitOutcome {
        let options = self.default_options.clone();
        self.initialize(&options).await
    }

    /// Clear a previous failure and run a fresh initialization cycle.
    pub async fn retry(&self, options: &InitOptions) -> InitOutcome {
        let orchestrator = self.orchestrator.clone();
        let options = options.clone();

        self.manager
            .retry_initialization(INIT_NAME, &self.policy, move |ctx| {
                let orchestrator = orchestrator.clone();
                let options = options.clone();
                async move {
                    ctx.cancellation().check()?;
                    ctx.progress().report(30, "Reloading model");
                    orchestrator.initialize(&options).await
                }
            })
            .await
    }

    fn validate(prompt: &str) -> Result<(), InferenceError> {
        if prompt.trim().is_empty() {
            return Err(InferenceError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn generate_response(&self, prompt: &str) -> Result<String, InferenceError> {
        Self::validate(prompt)?;
        self.orchestrator.generate(prompt).await
    }

    /// Stream a response into `on_chunk` in generation order and return the
    /// full text.
    pub async fn generate_response_stream(
        &self,
        prompt: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String, InferenceError> {
        Self::validate(prompt)?;
        self.orchestrator.generate_stream(prompt, on_chunk).await
    }

    /// Whether responses are streamed token by token rather than replayed
    /// from a complete generation.
    pub async fn supports_native_streaming(&self) -> bool {
        self.orchestrator.supports_native_streaming().await
    }

    pub async fn is_initialized(&self) -> bool {
        self.manager.state().is_initialized && self.orchestrator.is_ready().await
    }

    pub fn state(&self) -> InitializationState {
        self.manager.state()
    }

    pub async fn last_error(&self) -> Option<String> {
        match self.manager.state().error_message {
            Some(message) => Some(message),
            None => self.orchestrator.last_error().await,
        }
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<InitializationState> {
        self.manager.subscribe_state()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<InitializationProgress> {
        self.manager.subscribe_progress()
    }

    pub fn state_updates(&self) -> impl Stream<Item = InitializationState> + Send + Unpin + 'static {
        self.manager.state_updates()
    }

    pub fn progress_updates(
        &self,
    ) -> impl Stream<Item = InitializationProgress> + Send + Unpin + 'static {
        self.manager.progress_updates()
    }

    /// Abort a running initialization.
    pub fn cancel(&self) {
        self.manager.cancel();
    }

    /// Close the event streams and release both backends. Idempotent.
    pub async fn dispose(&self) {
        tracing::info!("ChatService: disposing");
        self.manager.dispose();
        self.orchestrator.dispose().await;
    }
}
