//! LlamaCppEngine: GGUF text engine over `llama_cpp_2`
//!
//! A [`TextEngine`] for desktop and Linux builds, enabled with the `llama-cpp`
//! feature. The accelerator maps onto GPU layer offload: when the model cannot
//! be loaded with layers offloaded, `load` reports
//! [`EngineError::AcceleratorUnavailable`] and the
//! [`LocalBackend`](super::local::LocalBackend) reloads it on the CPU.
//!
//! ## Thread Safety
//!
//! `llama_cpp_2`'s `LlamaModel` holds raw C pointers and is not `Send`/`Sync`.
//! Every llama.cpp call runs inside `tokio::task::spawn_blocking` while holding
//! the state lock, so the async interface stays `Send + Sync`.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::engine::{EngineChunkStream, EngineConfig, EngineError, TextEngine};

// ============================================================================
// Configuration
// ============================================================================

/// llama.cpp runtime settings not covered by [`EngineConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlamaCppSettings {
    /// Layers offloaded when the accelerator is requested. `999` offloads all.
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: u32,

    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// CPU threads; `None` lets llama.cpp decide.
    #[serde(default)]
    pub threads: Option<u32>,
}

fn default_gpu_layers() -> u32 {
    999
}

fn default_context_size() -> u32 {
    2048
}

impl Default for LlamaCppSettings {
    fn default() -> Self {
        Self {
            gpu_layers: default_gpu_layers(),
            context_size: default_context_size(),
            threads: None,
        }
    }
}

impl LlamaCppSettings {
    pub fn with_gpu_layers(mut self, layers: u32) -> Self {
        self.gpu_layers = layers;
        self
    }

    pub fn with_context_size(mut self, size: u32) -> Self {
        self.context_size = size;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = Some(threads);
        self
    }
}

// ============================================================================
// LlamaCppEngine
// ============================================================================

struct LoadedModel {
    backend: LlamaBackend,
    model: LlamaModel,
    max_tokens: u32,
}

// SAFETY: the model is only touched from `spawn_blocking` closures while the
// engine's RwLock is held, never from two threads at once for mutation.
unsafe impl Send for LoadedModel {}
unsafe impl Sync for LoadedModel {}

/// Text engine backed by a GGUF model loaded through llama.cpp.
pub struct LlamaCppEngine {
    settings: LlamaCppSettings,
    loaded: Arc<RwLock<Option<LoadedModel>>>,
}

impl std::fmt::Debug for LlamaCppEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlamaCppEngine")
            .field("settings", &self.settings)
            .finish()
    }
}

impl Default for LlamaCppEngine {
    fn default() -> Self {
        Self::new(LlamaCppSettings::default())
    }
}

impl LlamaCppEngine {
    pub fn new(settings: LlamaCppSettings) -> Self {
        Self {
            settings,
            loaded: Arc::new(RwLock::new(None)),
        }
    }

    pub fn settings(&self) -> &LlamaCppSettings {
        &self.settings
    }
}

fn load_model(settings: &LlamaCppSettings, config: &EngineConfig) -> Result<LoadedModel, EngineError> {
    let backend = LlamaBackend::init()
        .map_err(|e| EngineError::LibraryLoad(format!("llama.cpp backend init failed: {:?}", e)))?;

    let gpu_layers = if config.use_accelerator {
        settings.gpu_layers
    } else {
        0
    };
    let params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

    let path = config.model_path.to_str().ok_or_else(|| {
        EngineError::Failed(format!(
            "model path is not valid UTF-8: {}",
            config.model_path.display()
        ))
    })?;

    let model = LlamaModel::load_from_file(&backend, path, &params).map_err(|e| {
        if gpu_layers > 0 {
            EngineError::AcceleratorUnavailable(format!(
                "loading '{}' with {} GPU layers failed: {:?}",
                path, gpu_layers, e
            ))
        } else {
            EngineError::Failed(format!("failed to load GGUF model '{}': {:?}", path, e))
        }
    })?;

    tracing::info!(
        "LlamaCppEngine: loaded '{}' ({} GPU layers)",
        path,
        gpu_layers
    );

    Ok(LoadedModel {
        backend,
        model,
        max_tokens: config.max_tokens,
    })
}

/// Greedy autoregressive decoding. `emit` returns `false` to stop early.
fn decode(
    loaded: &LoadedModel,
    settings: &LlamaCppSettings,
    prompt: &str,
    mut emit: impl FnMut(String) -> bool,
) -> Result<(), EngineError> {
    let mut ctx_params =
        LlamaContextParams::default().with_n_ctx(NonZeroU32::new(settings.context_size));
    if let Some(threads) = settings.threads {
        ctx_params = ctx_params.with_n_threads(threads as i32);
    }

    let mut ctx = loaded
        .model
        .new_context(&loaded.backend, ctx_params)
        .map_err(|e| EngineError::Failed(format!("failed to create llama context: {:?}", e)))?;

    let tokens = loaded
        .model
        .str_to_token(prompt, AddBos::Always)
        .map_err(|e| EngineError::Failed(format!("tokenization failed: {:?}", e)))?;

    let mut batch = LlamaBatch::new(settings.context_size as usize, 1);
    let last = tokens.len().saturating_sub(1);
    for (i, &token) in tokens.iter().enumerate() {
        batch
            .add(token, i as i32, &[0], i == last)
            .map_err(|_| EngineError::Failed("failed to add prompt token to batch".into()))?;
    }

    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Failed(format!("prompt decoding failed: {:?}", e)))?;

    let mut sampler = LlamaSampler::chain_simple([LlamaSampler::greedy()]);
    let mut position = tokens.len();

    for _ in 0..loaded.max_tokens {
        let token = sampler.sample(&ctx, -1);
        if loaded.model.is_eog_token(token) {
            break;
        }

        let piece = loaded
            .model
            .token_to_str(token, Special::Tokenize)
            .map_err(|e| EngineError::Failed(format!("token decoding failed: {:?}", e)))?;

        if !emit(piece) {
            break;
        }

        batch.clear();
        batch
            .add(token, position as i32, &[0], true)
            .map_err(|_| EngineError::Failed("failed to add generated token".into()))?;
        position += 1;

        ctx.decode(&mut batch)
            .map_err(|e| EngineError::Failed(format!("decode step failed: {:?}", e)))?;
    }

    Ok(())
}

fn not_loaded() -> EngineError {
    EngineError::Failed("no model loaded".to_string())
}

#[async_trait]
impl TextEngine for LlamaCppEngine {
    fn name(&self) -> &str {
        "llama-cpp"
    }

    fn supports_native_streaming(&self) -> bool {
        true
    }

    async fn load(&self, config: &EngineConfig) -> Result<(), EngineError> {
        // Release any previous model (and its backend) before initializing again.
        self.close().await;

        let settings = self.settings.clone();
        let config = config.clone();
        let loaded = tokio::task::spawn_blocking(move || load_model(&settings, &config))
            .await
            .map_err(|e| EngineError::Failed(format!("model load task panicked: {}", e)))??;

        *self.loaded.write().await = Some(loaded);
        Ok(())
    }

    async fn generate(&self, prompt: &str) -> Result<String, EngineError> {
        let loaded = self.loaded.clone();
        let settings = self.settings.clone();
        let prompt = prompt.to_string();

        tokio::task::spawn_blocking(move || {
            let guard = loaded.blocking_read();
            let model = guard.as_ref().ok_or_else(not_loaded)?;

            let mut text = String::new();
            decode(model, &settings, &prompt, |piece| {
                text.push_str(&piece);
                true
            })?;
            Ok::<String, EngineError>(text)
        })
        .await
        .map_err(|e| EngineError::Failed(format!("generation task panicked: {}", e)))?
    }

    async fn generate_stream(&self, prompt: &str) -> Result<EngineChunkStream, EngineError> {
        if self.loaded.read().await.is_none() {
            return Err(not_loaded());
        }

        let loaded = self.loaded.clone();
        let settings = self.settings.clone();
        let prompt = prompt.to_string();
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, EngineError>>(32);

        tokio::task::spawn_blocking(move || {
            let guard = loaded.blocking_read();
            let result = match guard.as_ref() {
                // A dropped receiver means the consumer stopped listening.
                Some(model) => decode(model, &settings, &prompt, |piece| {
                    tx.blocking_send(Ok(piece)).is_ok()
                }),
                None => Err(not_loaded()),
            };

            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn close(&self) {
        if self.loaded.write().await.take().is_some() {
            tracing::info!("LlamaCppEngine: model released");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
