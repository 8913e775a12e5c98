//! # pocketchat-core
//!
//! Initialization and generation orchestration for an on-device chat model
//! with an optional cloud fallback.
//!
//! Loading a mobile-sized model is slow and can fail in several ways: the
//! asset has to be copied out of the bundle, the native engine may be missing,
//! the accelerator may refuse the model. This crate turns that sequence into a
//! predictable contract:
//!
//! - [`ChatService`]: what the UI calls: `initialize`, `generate_response`,
//!   `generate_response_stream`, `dispose`, state and progress subscriptions
//! - [`orchestrator::InitializationManager`]: retries, timeouts, backoff,
//!   progress broadcasting, cancellation
//! - [`orchestrator::BackendOrchestrator`]: primary/fallback backend routing
//! - [`orchestrator::LocalBackend`] / [`orchestrator::CloudBackend`]: the two
//!   [`orchestrator::InferenceBackend`] implementations
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use pocketchat_core::{ChatConfig, ChatService, InitOptions};
//!
//! let service = Arc::new(ChatService::from_config(&ChatConfig::from_env(), engine, None));
//! let mut progress = service.subscribe_progress();
//!
//! if service.initialize(&InitOptions::default()).await.is_success() {
//!     let reply = service
//!         .generate_response_stream("Hello!", &mut |chunk| print!("{}", chunk))
//!         .await?;
//! }
//! ```
//!
//! The library emits `tracing` events and installs no subscriber.

pub mod config;
pub mod orchestrator;
pub mod service;

pub use config::ChatConfig;
pub use orchestrator::{
    BackendKind, ErrorKind, InferenceError, InitOptions, InitOutcome, InitializationProgress,
    InitializationState, RetryPolicy,
};
pub use service::ChatService;
