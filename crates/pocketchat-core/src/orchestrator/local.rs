//! LocalBackend: on-device inference through a [`TextEngine`].
//!
//! Initialization resolves the model file through the [`ModelPathResolver`],
//! then loads it into the engine. When the accelerator is requested but the
//! engine reports it unusable, the backend reloads on the default compute path
//! without surfacing an error; `BackendHandle::using_accelerator` records which
//! path won.
//!
//! ## Streaming
//!
//! Engines with token streaming are forwarded chunk by chunk. For engines
//! without it the backend generates the whole response, splits it at sentence
//! boundaries and replays the pieces with a fixed delay between them. That mode
//! is reported through `supports_native_streaming() == false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::backend::{ChunkStream, InferenceBackend};
use super::engine::{EngineConfig, EngineError, TextEngine};
use super::resolver::ModelPathResolver;
use super::types::{BackendHandle, BackendKind, BackendOptions, InferenceError};

// ============================================================================
// Configuration
// ============================================================================

/// Generation and streaming settings for the local backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalBackendConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_k")]
    pub top_k: u32,

    #[serde(default)]
    pub random_seed: u32,

    /// Pause between synthesized chunks when the engine cannot stream.
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.8
}

fn default_top_k() -> u32 {
    40
}

fn default_chunk_delay_ms() -> u64 {
    50
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_k: default_top_k(),
            random_seed: 0,
            chunk_delay_ms: default_chunk_delay_ms(),
        }
    }
}

impl LocalBackendConfig {
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }

    fn engine_config(&self, model_path: std::path::PathBuf, use_accelerator: bool) -> EngineConfig {
        EngineConfig {
            model_path,
            use_accelerator,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_k: self.top_k,
            random_seed: self.random_seed,
        }
    }
}

// ============================================================================
// LocalBackend
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct LocalState {
    ready: bool,
    using_accelerator: bool,
}

/// On-device backend wrapping an opaque [`TextEngine`].
pub struct LocalBackend {
    config: LocalBackendConfig,
    resolver: Arc<ModelPathResolver>,
    engine: Arc<dyn TextEngine>,
    state: RwLock<LocalState>,
    /// Serializes `initialize`/`dispose` so the engine is never loaded twice.
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBackend")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .finish()
    }
}

impl LocalBackend {
    pub fn new(
        config: LocalBackendConfig,
        resolver: Arc<ModelPathResolver>,
        engine: Arc<dyn TextEngine>,
    ) -> Self {
        Self {
            config,
            resolver,
            engine,
            state: RwLock::new(LocalState::default()),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &LocalBackendConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ModelPathResolver {
        &self.resolver
    }

    /// Load the engine, retrying once on the default compute path when the
    /// accelerator is unusable. Returns whether the accelerator is in use.
    async fn load_engine(&self, mut config: EngineConfig) -> Result<bool, EngineError> {
        match self.engine.load(&config).await {
            Ok(()) => Ok(config.use_accelerator),
            Err(EngineError::AcceleratorUnavailable(reason)) if config.use_accelerator => {
                tracing::warn!(
                    "LocalBackend: accelerator unavailable for '{}' ({}), using default compute path",
                    self.engine.name(),
                    reason
                );
                config.use_accelerator = false;
                self.engine.load(&config).await?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_ready(&self) -> Result<(), InferenceError> {
        if self.state.read().await.ready {
            Ok(())
        } else {
            Err(InferenceError::NotInitialized(format!(
                "local backend '{}' has not been initialized",
                self.engine.name()
            )))
        }
    }

    fn synthesized_stream(&self, full: String) -> ChunkStream {
        let delay = self.config.chunk_delay();
        let chunks = segment_sentences(&full);

        tracing::debug!(
            "LocalBackend: replaying {} synthesized chunks ({:?} apart)",
            chunks.len(),
            delay
        );

        let stream = futures::stream::iter(chunks.into_iter().enumerate()).then(
            move |(index, chunk)| async move {
                if index > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok::<String, InferenceError>(chunk)
            },
        );
        Box::pin(stream)
    }
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn name(&self) -> &str {
        self.engine.name()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn supports_native_streaming(&self) -> bool {
        self.engine.supports_native_streaming()
    }

    async fn initialize(&self, options: &BackendOptions) -> Result<(), InferenceError> {
        let _lifecycle = self.lifecycle.lock().await;

        if self.state.read().await.ready {
            return Ok(());
        }

        let model_path = self.resolver.resolve().await?;
        let engine_config = self
            .config
            .engine_config(model_path.clone(), options.use_accelerator);

        tracing::info!(
            "LocalBackend: loading '{}' with engine '{}' (accelerator requested: {})",
            model_path.display(),
            self.engine.name(),
            options.use_accelerator
        );

        match self.load_engine(engine_config).await {
            Ok(using_accelerator) => {
                *self.state.write().await = LocalState {
                    ready: true,
                    using_accelerator,
                };
                tracing::info!(
                    "LocalBackend: '{}' ready (accelerator: {})",
                    self.engine.name(),
                    using_accelerator
                );
                Ok(())
            }
            Err(e) => {
                // A failed load may leave engine resources half-allocated.
                self.engine.close().await;
                Err(e.into_load_error())
            }
        }
    }

    async fn is_ready(&self) -> bool {
        self.state.read().await.ready
    }

    async fn handle(&self) -> BackendHandle {
        let state = *self.state.read().await;
        BackendHandle {
            kind: BackendKind::Local,
            ready: state.ready,
            using_accelerator: state.using_accelerator,
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        self.ensure_ready().await?;

        tracing::debug!("LocalBackend: generating for {} prompt chars", prompt.len());

        self.engine
            .generate(prompt)
            .await
            .map_err(EngineError::into_inference_error)
    }

    async fn stream(&self, prompt: &str) -> Result<ChunkStream, InferenceError> {
        self.ensure_ready().await?;

        if self.engine.supports_native_streaming() {
            let stream = self
                .engine
                .generate_stream(prompt)
                .await
                .map_err(EngineError::into_inference_error)?;
            return Ok(Box::pin(
                stream.map(|chunk| chunk.map_err(EngineError::into_inference_error)),
            ));
        }

        let full = self
            .engine
            .generate(prompt)
            .await
            .map_err(EngineError::into_inference_error)?;
        Ok(self.synthesized_stream(full))
    }

    async fn dispose(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let mut state = self.state.write().await;
        if state.ready {
            tracing::info!("LocalBackend: releasing engine '{}'", self.engine.name());
            self.engine.close().await;
        }
        *state = LocalState::default();
    }
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

/// Split `text` after sentence terminators that are followed by whitespace
/// or the end of the text. Concatenating the pieces yields `text` again.
pub fn segment_sentences(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((index, c)) = chars.next() {
        if !is_sentence_end(c) {
            continue;
        }

        let mut end = index + c.len_utf8();
        while let Some(&(i, next)) = chars.peek() {
            if !is_sentence_end(next) {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }

        // "3.14" or "e.g" is not a boundary
        if matches!(chars.peek(), Some(&(_, next)) if !next.is_whitespace()) {
            continue;
        }

        while let Some(&(i, next)) = chars.peek() {
            if !next.is_whitespace() {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }

        chunks.push(text[start..end].to_string());
        start = end;
    }

    if start < text.len() {
        chunks.push(text[start..].to_string());
    }
    chunks
}

// ============================================================================
// Tests
// ============================================================================
