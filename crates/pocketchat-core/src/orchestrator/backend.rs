//! Unified Inference Backend Trait
//!
//! This module defines **`InferenceBackend`**, the capability every text
//! generation backend exposes to the [`BackendOrchestrator`]. The on-device
//! [`LocalBackend`] and the remote [`CloudBackend`] both implement it, so the
//! orchestrator can hold a primary/fallback pair behind `Arc<dyn InferenceBackend>`
//! and switch between them without knowing what sits underneath.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     BackendOrchestrator                      │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 │ primary                      │ fallback
//!                 ▼                              ▼
//!        ┌─────────────────┐            ┌─────────────────┐
//!        │  LocalBackend   │            │  CloudBackend   │
//!        │ (TextEngine)    │            │ (optional cap.) │
//!        └─────────────────┘            └─────────────────┘
//! ```
//!
//! ## Streaming Design
//!
//! `stream()` returns a [`ChunkStream`], a pinned boxed `Send` stream of text
//! chunks. [`InferenceBackend::generate_stream`] drains that stream into a
//! callback one chunk at a time and resolves with the concatenated text. The
//! callback is never invoked concurrently and never out of order, because it is
//! driven by a single `while let Some(..) = stream.next().await` loop.
//!
//! Backends whose engine has no token streaming may synthesize chunks from a
//! full response; they report this through
//! [`InferenceBackend::supports_native_streaming`].
//!
//! [`BackendOrchestrator`]: super::router::BackendOrchestrator
//! [`LocalBackend`]: super::local::LocalBackend
//! [`CloudBackend`]: super::cloud::CloudBackend

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};

use super::types::{BackendHandle, BackendKind, BackendOptions, InferenceError};

/// A stream of generated text fragments.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// A text-generation capability the orchestrator can drive.
///
/// ## Lifecycle
///
/// ```text
/// ┌────────────┐     ┌──────────────┐     ┌──────────────┐     ┌───────────┐
/// │ Construct  │ ──▶ │ initialize() │ ──▶ │ generate()   │ ──▶ │ dispose() │
/// │ (new)      │     │              │     │ / stream()   │     │           │
/// └────────────┘     └──────────────┘     └──────────────┘     └───────────┘
/// ```
///
/// `initialize()` never partially succeeds: when it returns `Ok(())` the
/// backend is ready, otherwise `is_ready()` stays `false`. `dispose()` is
/// idempotent and safe on a backend that was never initialized.
///
/// Implementations use interior mutability (`tokio::sync::RwLock`) for their
/// state, which is why every method takes `&self`.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    /// `false` when `stream()` re-segments a complete response instead of
    /// forwarding tokens as the engine produces them.
    fn supports_native_streaming(&self) -> bool;

    async fn initialize(&self, options: &BackendOptions) -> Result<(), InferenceError>;

    async fn is_ready(&self) -> bool;

    async fn handle(&self) -> BackendHandle;

    /// Generate a complete response.
    ///
    /// Fails with [`InferenceError::NotInitialized`] before a successful
    /// `initialize()` and with [`InferenceError::InferenceFailure`] when the
    /// engine errors.
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError>;

    /// Start a streaming generation.
    async fn stream(&self, prompt: &str) -> Result<ChunkStream, InferenceError>;

    /// Stream a generation into `on_chunk` and return the full text.
    async fn generate_stream(
        &self,
        prompt: &str,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<String, InferenceError> {
        let stream = self.stream(prompt).await?;
        collect_stream(stream, on_chunk).await
    }

    /// Release the underlying engine.
    async fn dispose(&self);
}

/// Drive `stream` to completion, handing each chunk to `on_chunk` in order.
///
/// Stops at the first error; chunks delivered before it are not rolled back.
pub async fn collect_stream<F>(mut stream: ChunkStream, mut on_chunk: F) -> Result<String, InferenceError>
where
    F: FnMut(&str) + Send,
{
    let mut full = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        on_chunk(&chunk);
        full.push_str(&chunk);
    }
    Ok(full)
}

// ============================================================================
// Tests
// ============================================================================
