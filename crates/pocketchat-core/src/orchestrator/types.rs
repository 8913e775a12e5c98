//! Core types shared by every layer of the orchestration stack.
//!
//! The central piece is [`InferenceError`], the single error type that flows
//! from the asset resolver, through the backends and the orchestrator, up to
//! the initialization manager and the UI-facing service. Each variant is
//! tagged with an [`ErrorKind`] at the point it is constructed, so callers
//! branch on `kind()` instead of inspecting message text.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

/// Unified error type for initialization and generation.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Neither the preferred nor the fallback model asset is bundled.
    #[error("model asset not found: {0}")]
    AssetNotFound(String),

    /// Reading a bundled asset exceeded its time budget.
    #[error("asset load timeout after {0:?}")]
    AssetLoadTimeout(Duration),

    /// The native inference library is missing or incompatible with the device.
    #[error("inference engine could not be loaded: {0}")]
    EngineLoadFailure(String),

    /// A generation call arrived before a successful `initialize()`.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// The engine failed while producing text.
    #[error("inference failed: {0}")]
    InferenceFailure(String),

    /// The engine was found but refused to come up (bad model file, OOM, ...).
    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// Generation failed while a fallback was configured, but there is no
    /// fallback generation path to hand the request to.
    #[error("fallback generation is not implemented (primary failed: {source})")]
    FallbackNotImplemented {
        #[source]
        source: Box<InferenceError>,
    },

    /// A capability (usually the cloud backend) is absent.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A bounded operation exceeded its budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation was aborted through a cancellation handle.
    #[error("operation cancelled")]
    Cancelled,

    /// The request itself is unusable (e.g. an empty prompt).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discriminant of [`InferenceError`], fixed where the error is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AssetNotFound,
    AssetLoadTimeout,
    EngineLoadFailure,
    NotInitialized,
    InferenceFailure,
    InitializationFailed,
    FallbackNotImplemented,
    Unavailable,
    Timeout,
    Cancelled,
    InvalidRequest,
    Config,
    Io,
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AssetNotFound(_) => ErrorKind::AssetNotFound,
            Self::AssetLoadTimeout(_) => ErrorKind::AssetLoadTimeout,
            Self::EngineLoadFailure(_) => ErrorKind::EngineLoadFailure,
            Self::NotInitialized(_) => ErrorKind::NotInitialized,
            Self::InferenceFailure(_) => ErrorKind::InferenceFailure,
            Self::InitializationFailed(_) => ErrorKind::InitializationFailed,
            Self::FallbackNotImplemented { .. } => ErrorKind::FallbackNotImplemented,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Retrying cannot fix this error; the device needs a different build.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::EngineLoadFailure(_))
    }

    /// Any variant produced by a time budget expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::AssetLoadTimeout(_))
    }
}

// ============================================================================
// Backend descriptors
// ============================================================================

/// Which side of the primary/fallback pair a backend sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    /// On-device inference.
    Local,
    /// Remote generation service.
    Cloud,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Cloud => f.write_str("cloud"),
        }
    }
}

/// Point-in-time view of a backend owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendHandle {
    pub kind: BackendKind,
    pub ready: bool,
    pub using_accelerator: bool,
}

impl BackendHandle {
    pub fn idle(kind: BackendKind) -> Self {
        Self {
            kind,
            ready: false,
            using_accelerator: false,
        }
    }
}

/// Options a backend receives on `initialize()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendOptions {
    /// Try the hardware accelerator first; backends fall back silently.
    pub use_accelerator: bool,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            use_accelerator: true,
        }
    }
}

/// Options the UI passes when it asks for the model to be brought up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitOptions {
    #[serde(default = "default_use_accelerator")]
    pub use_accelerator: bool,

    /// Engage the cloud backend when the local one cannot be initialized.
    #[serde(default)]
    pub use_fallback: bool,

    /// How many times the local backend is tried before giving up.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_use_accelerator() -> bool {
    true
}

fn default_retry_count() -> u32 {
    3
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            use_accelerator: default_use_accelerator(),
            use_fallback: false,
            retry_count: default_retry_count(),
        }
    }
}

impl InitOptions {
    pub fn with_accelerator(mut self, enabled: bool) -> Self {
        self.use_accelerator = enabled;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.use_fallback = enabled;
        self
    }

    pub fn with_retry_count(mut self, retries: u32) -> Self {
        self.retry_count = retries;
        self
    }

    pub(crate) fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            use_accelerator: self.use_accelerator,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
