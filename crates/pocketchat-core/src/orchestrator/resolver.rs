//! ModelPathResolver: materializes the bundled model on durable storage.
//!
//! Inference engines want a plain file path, while the model ships inside the
//! application bundle. The resolver copies the asset out on first use and
//! caches the resulting path:
//!
//! ```text
//!   preferred asset bundled? ── yes ──▶ copy to <storage>/<name>.<preferred>
//!            │ no
//!            ▼
//!   fallback asset bundled? ── no ──▶ AssetNotFound
//!            │ yes
//!            ▼
//!   copy to <storage>/<name>.<fallback>
//!   try converting to <name>.<preferred> ── fails ──▶ keep the fallback path
//! ```
//!
//! A non-empty file already sitting at the target path counts as resolved, so
//! a restart never copies the model twice. Reads are bounded by a timeout,
//! and failed copies are retried with linear backoff after deleting whatever
//! was partially written.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::types::InferenceError;

// ============================================================================
// Configuration
// ============================================================================

/// Describes the model asset and where it is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelAssetConfig {
    /// Logical model identifier; also the stem of the copied file.
    #[serde(default = "default_logical_name")]
    pub logical_name: String,

    /// Extension of the format the engine prefers.
    #[serde(default = "default_preferred_format")]
    pub preferred_format: String,

    /// Extension of the format shipped when the preferred one is not.
    #[serde(default = "default_fallback_format")]
    pub fallback_format: String,

    /// Directory inside the asset store holding the model.
    #[serde(default = "default_asset_dir")]
    pub asset_dir: String,

    /// Application-private directory the model is copied into.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_copy_attempts")]
    pub copy_attempts: u32,

    #[serde(default = "default_copy_backoff_ms")]
    pub copy_backoff_ms: u64,
}

fn default_logical_name() -> String {
    "gemma3-1b-it-int4".to_string()
}

fn default_preferred_format() -> String {
    "task".to_string()
}

fn default_fallback_format() -> String {
    "bin".to_string()
}

fn default_asset_dir() -> String {
    "models".to_string()
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pocketchat")
        .join("models")
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_copy_attempts() -> u32 {
    3
}

fn default_copy_backoff_ms() -> u64 {
    500
}

impl Default for ModelAssetConfig {
    fn default() -> Self {
        Self {
            logical_name: default_logical_name(),
            preferred_format: default_preferred_format(),
            fallback_format: default_fallback_format(),
            asset_dir: default_asset_dir(),
            storage_dir: default_storage_dir(),
            read_timeout_ms: default_read_timeout_ms(),
            copy_attempts: default_copy_attempts(),
            copy_backoff_ms: default_copy_backoff_ms(),
        }
    }
}

impl ModelAssetConfig {
    pub fn new(logical_name: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            logical_name: logical_name.into(),
            storage_dir: storage_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_formats(mut self, preferred: impl Into<String>, fallback: impl Into<String>) -> Self {
        self.preferred_format = preferred.into();
        self.fallback_format = fallback.into();
        self
    }

    pub fn with_asset_dir(mut self, dir: impl Into<String>) -> Self {
        self.asset_dir = dir.into();
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_copy_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.copy_attempts = attempts;
        self.copy_backoff_ms = backoff.as_millis() as u64;
        self
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Sleep after failed copy attempt `attempt`.
    fn copy_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.copy_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    /// Path of the asset inside the store, e.g. `models/gemma.task`.
    fn asset_path(&self, format: &str) -> String {
        let file = format!("{}.{}", self.logical_name, format);
        if self.asset_dir.is_empty() {
            file
        } else {
            format!("{}/{}", self.asset_dir.trim_end_matches('/'), file)
        }
    }

    /// Deterministic on-disk location for a given format.
    fn target_path(&self, format: &str) -> PathBuf {
        self.storage_dir
            .join(format!("{}.{}", sanitize_file_stem(&self.logical_name), format))
    }
}

fn sanitize_file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ============================================================================
// Collaborators
// ============================================================================

/// Read-only access to files bundled with the application.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn exists(&self, path: &str) -> bool;

    /// Fails with [`InferenceError::AssetNotFound`] when `path` is not bundled.
    async fn load(&self, path: &str) -> Result<Vec<u8>, InferenceError>;
}

/// Serves bundled assets from a directory on disk.
#[derive(Debug, Clone)]
pub struct DirAssetStore {
    root: PathBuf,
}

impl DirAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl AssetStore for DirAssetStore {
    async fn exists(&self, path: &str) -> bool {
        tokio::fs::metadata(self.root.join(path))
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn load(&self, path: &str) -> Result<Vec<u8>, InferenceError> {
        tokio::fs::read(self.root.join(path)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InferenceError::AssetNotFound(path.to_string())
            } else {
                InferenceError::Io(e)
            }
        })
    }
}

/// Best-effort conversion from the fallback format to the preferred one.
#[async_trait]
pub trait FormatConverter: Send + Sync {
    async fn convert(&self, source: &Path, target: &Path) -> Result<(), InferenceError>;
}

/// Converter used when no conversion tooling ships with the app.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopConverter;

#[async_trait]
impl FormatConverter for NoopConverter {
    async fn convert(&self, _source: &Path, _target: &Path) -> Result<(), InferenceError> {
        Err(InferenceError::Unavailable(
            "no model format converter installed".to_string(),
        ))
    }
}

// ============================================================================
// ModelPathResolver
// ============================================================================

/// Locates the model asset and copies it to durable storage on first use.
pub struct ModelPathResolver {
    config: ModelAssetConfig,
    store: Arc<dyn AssetStore>,
    converter: Arc<dyn FormatConverter>,
    /// Resolved path, populated lazily. The lock also serializes resolution.
    resolved: Mutex<Option<PathBuf>>,
}

impl std::fmt::Debug for ModelPathResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPathResolver")
            .field("config", &self.config)
            .finish()
    }
}

impl ModelPathResolver {
    pub fn new(config: ModelAssetConfig, store: Arc<dyn AssetStore>) -> Self {
        Self::with_converter(config, store, Arc::new(NoopConverter))
    }

    pub fn with_converter(
        config: ModelAssetConfig,
        store: Arc<dyn AssetStore>,
        converter: Arc<dyn FormatConverter>,
    ) -> Self {
        Self {
            config,
            store,
            converter,
            resolved: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ModelAssetConfig {
        &self.config
    }

    /// The cached path, if `resolve()` has succeeded.
    pub async fn resolved_path(&self) -> Option<PathBuf> {
        self.resolved.lock().await.clone()
    }

    /// Return a usable model path, copying the asset out of the bundle if needed.
    pub async fn resolve(&self) -> Result<PathBuf, InferenceError> {
        let mut resolved = self.resolved.lock().await;

        if let Some(path) = resolved.as_ref() {
            if is_non_empty(path).await {
                return Ok(path.clone());
            }
            tracing::warn!(
                "Resolver: cached model '{}' disappeared, resolving again",
                path.display()
            );
        }

        let path = self.materialize().await?;
        tracing::info!(
            "Resolver: model '{}' resolved to '{}'",
            self.config.logical_name,
            path.display()
        );
        *resolved = Some(path.clone());
        Ok(path)
    }

    /// Forget the cached path (e.g. after a model version change).
    pub async fn reset(&self) {
        *self.resolved.lock().await = None;
    }

    /// Forget the cached path and delete every copied file.
    pub async fn purge(&self) -> Result<(), InferenceError> {
        let mut resolved = self.resolved.lock().await;
        *resolved = None;

        for format in [&self.config.preferred_format, &self.config.fallback_format] {
            let target = self.config.target_path(format);
            match tokio::fs::remove_file(&target).await {
                Ok(()) => tracing::info!("Resolver: purged '{}'", target.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn materialize(&self) -> Result<PathBuf, InferenceError> {
        let config = &self.config;
        tokio::fs::create_dir_all(&config.storage_dir).await?;

        let preferred_target = config.target_path(&config.preferred_format);
        if is_non_empty(&preferred_target).await {
            tracing::debug!(
                "Resolver: '{}' already on disk, skipping copy",
                preferred_target.display()
            );
            return Ok(preferred_target);
        }

        let preferred_asset = config.asset_path(&config.preferred_format);
        if self.store.exists(&preferred_asset).await {
            self.copy_asset(&preferred_asset, &preferred_target).await?;
            return Ok(preferred_target);
        }

        let fallback_asset = config.asset_path(&config.fallback_format);
        if !self.store.exists(&fallback_asset).await {
            return Err(InferenceError::AssetNotFound(format!(
                "neither '{}' nor '{}' is bundled",
                preferred_asset, fallback_asset
            )));
        }

        tracing::info!(
            "Resolver: '{}' not bundled, using '{}'",
            preferred_asset,
            fallback_asset
        );

        let fallback_target = config.target_path(&config.fallback_format);
        if !is_non_empty(&fallback_target).await {
            self.copy_asset(&fallback_asset, &fallback_target).await?;
        }

        match self.converter.convert(&fallback_target, &preferred_target).await {
            Ok(()) if is_non_empty(&preferred_target).await => Ok(preferred_target),
            Ok(()) => {
                tracing::warn!("Resolver: conversion produced an empty file, keeping fallback format");
                remove_partial(&preferred_target).await;
                Ok(fallback_target)
            }
            Err(e) => {
                tracing::warn!("Resolver: format conversion skipped ({}), keeping fallback format", e);
                remove_partial(&preferred_target).await;
                Ok(fallback_target)
            }
        }
    }

    /// Read `asset` (bounded by the read timeout) and write it to `target`,
    /// retrying failed writes.
    async fn copy_asset(&self, asset: &str, target: &Path) -> Result<(), InferenceError> {
        let timeout = self.config.read_timeout();
        let bytes = tokio::time::timeout(timeout, self.store.load(asset))
            .await
            .map_err(|_| InferenceError::AssetLoadTimeout(timeout))??;

        let attempts = self.config.copy_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match write_verified(target, &bytes).await {
                Ok(()) => {
                    tracing::info!(
                        "Resolver: copied '{}' to '{}' ({:.1}MB)",
                        asset,
                        target.display(),
                        bytes.len() as f64 / 1_048_576.0
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Resolver: copy attempt {}/{} for '{}' failed: {}",
                        attempt,
                        attempts,
                        asset,
                        e
                    );
                    remove_partial(target).await;
                    last_error = Some(e);

                    if attempt < attempts {
                        tokio::time::sleep(self.config.copy_backoff(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            InferenceError::InitializationFailed(format!("could not copy '{}'", asset))
        }))
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Write via a `.part` file, rename into place, then check the length.
async fn write_verified(target: &Path, bytes: &[u8]) -> Result<(), InferenceError> {
    if bytes.is_empty() {
        return Err(InferenceError::InitializationFailed(
            "bundled model asset is empty".to_string(),
        ));
    }

    let partial = partial_path(target);
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, target).await?;

    let written = tokio::fs::metadata(target).await?.len();
    if written != bytes.len() as u64 {
        return Err(InferenceError::InitializationFailed(format!(
            "copied {} of {} bytes",
            written,
            bytes.len()
        )));
    }
    Ok(())
}

/// Clear whatever sits at the partial and final paths, stale directories included.
async fn remove_partial(target: &Path) {
    for path in [partial_path(target), target.to_path_buf()] {
        let removed = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&path).await,
            Ok(_) => tokio::fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Resolver: could not remove '{}': {}", path.display(), e);
            }
        }
    }
}

async fn is_non_empty(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
