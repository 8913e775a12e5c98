//! Model Orchestrator Module
//!
//! Initialization and generation orchestration for an on-device chat model:
//!
//! - **[`InitializationManager`]**: bounded retries, per-attempt timeout,
//!   linear backoff, progress and state broadcasts, cancellation
//! - **[`BackendOrchestrator`]**: primary/fallback pair, retried primary init,
//!   error classification for generation
//! - **[`InferenceBackend`]**: object-safe async trait implemented by
//!   [`LocalBackend`] and [`CloudBackend`]
//! - **[`ModelPathResolver`]**: copies the bundled model into durable storage
//!   once and hands out its path
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                  UI shell (via ChatService)                   │
//! └────────────────────────┬──────────────────────────────────────┘
//!                          │ run_initialization / generate
//!                          ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │  InitializationManager ──▶ BackendOrchestrator                │
//! │                             │ primary          │ fallback     │
//! │                             ▼                  ▼              │
//! │                      ┌──────────────┐   ┌──────────────┐      │
//! │                      │ LocalBackend │   │ CloudBackend │      │
//! │                      └──────┬───────┘   └──────┬───────┘      │
//! │           ModelPathResolver │ TextEngine       │ CloudGeneration
//! │                             ▼                  ▼  (optional)  │
//! └───────────────────────────────────────────────────────────────┘
//! ```

// ---------------------------------------------------------------------------
// Shared types and backend abstraction
// ---------------------------------------------------------------------------

/// Error taxonomy, backend descriptors, init options.
pub mod types;

/// The `InferenceBackend` trait: object-safe async interface for all backends.
pub mod backend;

/// The `TextEngine` boundary to the opaque inference engine.
pub mod engine;

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

pub mod resolver;

/// On-device backend with accelerator fallback and synthesized streaming.
pub mod local;

/// Optional remote generation capability.
pub mod cloud;

/// llama.cpp engine (feature-gated).
#[cfg(feature = "llama-cpp")]
pub mod llama;

// ---------------------------------------------------------------------------
// Orchestration
// ---------------------------------------------------------------------------

/// Primary/fallback routing with retried initialization.
pub mod router;

/// Retry/timeout/backoff state machine with progress broadcasting.
pub mod init_manager;

// ── Re-exports ──

pub use types::{
    BackendHandle, BackendKind, BackendOptions, ErrorKind, InferenceError, InitOptions,
};

pub use backend::{collect_stream, ChunkStream, InferenceBackend};
pub use engine::{EngineChunkStream, EngineConfig, EngineError, TextEngine};

pub use cloud::{CloudBackend, CloudGeneration};
pub use local::{segment_sentences, LocalBackend, LocalBackendConfig};
pub use resolver::{
    AssetStore, DirAssetStore, FormatConverter, ModelAssetConfig, ModelPathResolver,
    NoopConverter,
};

pub use init_manager::{
    CancellationHandle, FailureKind, InitContext, InitFailure, InitOutcome, InitPhase,
    InitializationManager, InitializationProgress, InitializationState, ProgressReporter,
    RetryPolicy,
};
pub use router::{BackendOrchestrator, OrchestratorConfig, OrchestratorState};

#[cfg(feature = "llama-cpp")]
pub use llama::{LlamaCppEngine, LlamaCppSettings};
