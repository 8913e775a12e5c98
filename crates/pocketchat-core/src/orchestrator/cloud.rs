//! CloudBackend: remote generation behind an optional capability.
//!
//! The orchestrator always owns a fallback slot. When no
//! [`CloudGeneration`] provider is wired in, the backend reports
//! [`InferenceError::Unavailable`] on `initialize()` and stays not ready, which
//! leaves the orchestrator in `Failed` after the local retries are exhausted.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::backend::{ChunkStream, InferenceBackend};
use super::types::{BackendHandle, BackendKind, BackendOptions, InferenceError};

/// A remote text-generation service.
#[async_trait]
pub trait CloudGeneration: Send + Sync {
    fn name(&self) -> &str;

    /// Establish whatever session the service needs. Called once per
    /// successful backend initialization.
    async fn connect(&self) -> Result<(), InferenceError>;

    async fn generate(&self, prompt: &str) -> Result<String, InferenceError>;

    async fn generate_stream(&self, prompt: &str) -> Result<ChunkStream, InferenceError>;
}

/// Fallback backend delegating to a [`CloudGeneration`] provider, if any.
pub struct CloudBackend {
    provider: Option<Arc<dyn CloudGeneration>>,
    ready: RwLock<bool>,
}

impl std::fmt::Debug for CloudBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudBackend")
            .field("provider", &self.provider.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl CloudBackend {
    /// A cloud slot with nothing behind it.
    pub fn unavailable() -> Self {
        Self {
            provider: None,
            ready: RwLock::new(false),
        }
    }

    pub fn with_provider(provider: Arc<dyn CloudGeneration>) -> Self {
        Self {
            provider: Some(provider),
            ready: RwLock::new(false),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    async fn ready_provider(&self) -> Result<&Arc<dyn CloudGeneration>, InferenceError> {
        let provider = self.provider.as_ref().ok_or_else(no_provider)?;
        if !*self.ready.read().await {
            return Err(InferenceError::NotInitialized(format!(
                "cloud provider '{}' has not been initialized",
                provider.name()
            )));
        }
        Ok(provider)
    }
}

fn no_provider() -> InferenceError {
    InferenceError::Unavailable("no cloud generation provider configured".to_string())
}

#[async_trait]
impl InferenceBackend for CloudBackend {
    fn name(&self) -> &str {
        self.provider.as_ref().map_or("cloud-unavailable", |p| p.name())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn supports_native_streaming(&self) -> bool {
        self.provider.is_some()
    }

    async fn initialize(&self, _options: &BackendOptions) -> Result<(), InferenceError> {
        let provider = self.provider.as_ref().ok_or_else(no_provider)?;

        let mut ready = self.ready.write().await;
        if *ready {
            return Ok(());
        }

        provider.connect().await?;
        *ready = true;
        tracing::info!("CloudBackend: provider '{}' connected", provider.name());
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }

    async fn handle(&self) -> BackendHandle {
        BackendHandle {
            kind: BackendKind::Cloud,
            ready: *self.ready.read().await,
            using_accelerator: false,
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        self.ready_provider().await?.generate(prompt).await
    }

    async fn stream(&self, prompt: &str) -> Result<ChunkStream, InferenceError> {
        self.ready_provider().await?.generate_stream(prompt).await
    }

    async fn dispose(&self) {
        *self.ready.write().await = false;
    }
}

// ============================================================================
// Tests
// ============================================================================
