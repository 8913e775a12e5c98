//! Boundary to the opaque on-device inference engine.
//!
//! The [`LocalBackend`](super::local::LocalBackend) never touches tensors or
//! kernels. It talks to a [`TextEngine`], which loads a model file and turns
//! text into text. Engines report failures as [`EngineError`]; the backend maps
//! them onto [`InferenceError`] depending on whether they happened while
//! loading or while generating.

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::InferenceError;

/// Errors raised by an engine implementation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The native library backing the engine is missing or cannot be linked.
    #[error("native inference library could not be loaded: {0}")]
    LibraryLoad(String),

    /// The requested accelerator is not usable on this device.
    #[error("accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    /// The engine has no token streaming.
    #[error("engine does not support streaming")]
    StreamingUnsupported,

    #[error("engine error: {0}")]
    Failed(String),
}

impl EngineError {
    /// Map an error raised while loading a model.
    pub fn into_load_error(self) -> InferenceError {
        match self {
            Self::LibraryLoad(msg) => InferenceError::EngineLoadFailure(msg),
            other => InferenceError::InitializationFailed(other.to_string()),
        }
    }

    /// Map an error raised while generating.
    pub fn into_inference_error(self) -> InferenceError {
        InferenceError::InferenceFailure(self.to_string())
    }
}

/// Stream of text pieces as the engine produces them.
pub type EngineChunkStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// Parameters an engine receives when loading a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_path: PathBuf,
    pub use_accelerator: bool,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub random_seed: u32,
}

impl EngineConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            use_accelerator: true,
            max_tokens: 1024,
            temperature: 0.8,
            top_k: 40,
            random_seed: 0,
        }
    }

    pub fn with_accelerator(mut self, enabled: bool) -> Self {
        self.use_accelerator = enabled;
        self
    }
}

/// An opaque text-generation engine.
///
/// `load` may be called again after a failed attempt or after `close`.
#[async_trait]
pub trait TextEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `generate_stream` yields tokens as they are decoded.
    fn supports_native_streaming(&self) -> bool {
        false
    }

    async fn load(&self, config: &EngineConfig) -> Result<(), EngineError>;

    async fn generate(&self, prompt: &str) -> Result<String, EngineError>;

    async fn generate_stream(&self, _prompt: &str) -> Result<EngineChunkStream, EngineError> {
        Err(EngineError::StreamingUnsupported)
    }

    /// Release the loaded model. Must tolerate being called when nothing is loaded.
    async fn close(&self);
}
