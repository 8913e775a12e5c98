//! Top-level configuration for a [`ChatService`](crate::service::ChatService).
//!
//! Every section has serde defaults, so an empty JSON object is a valid
//! configuration. Environment variables override the file:
//!
//! | Variable                | Field                 |
//! |-------------------------|-----------------------|
//! | `POCKETCHAT_MODEL_DIR`  | `model.storage_dir`   |
//! | `POCKETCHAT_ASSET_DIR`  | `asset_root`          |
//! | `POCKETCHAT_MODEL_NAME` | `model.logical_name`  |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::orchestrator::{
    InferenceError, InitOptions, LocalBackendConfig, ModelAssetConfig, OrchestratorConfig,
    RetryPolicy,
};

pub const ENV_MODEL_DIR: &str = "POCKETCHAT_MODEL_DIR";
pub const ENV_ASSET_DIR: &str = "POCKETCHAT_ASSET_DIR";
pub const ENV_MODEL_NAME: &str = "POCKETCHAT_MODEL_NAME";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub model: ModelAssetConfig,

    #[serde(default)]
    pub local: LocalBackendConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Retry policy of the initialization manager.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Options used by `ChatService::initialize_default`.
    #[serde(default)]
    pub init: InitOptions,

    /// Directory standing in for the application bundle.
    #[serde(default = "default_asset_root")]
    pub asset_root: PathBuf,
}

fn default_asset_root() -> PathBuf {
    PathBuf::from("assets")
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            model: ModelAssetConfig::default(),
            local: LocalBackendConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            retry: RetryPolicy::default(),
            init: InitOptions::default(),
            asset_root: default_asset_root(),
        }
    }
}

impl ChatConfig {
    pub fn from_json(json: &str) -> Result<Self, InferenceError> {
        serde_json::from_str(json).map_err(|e| InferenceError::Config(e.to_string()))
    }

    /// Read a JSON config file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InferenceError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(Self::from_json(&json)?.with_env_overrides())
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(dir) = get(ENV_MODEL_DIR) {
            self.model.storage_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get(ENV_ASSET_DIR) {
            self.asset_root = PathBuf::from(dir);
        }
        if let Some(name) = get(ENV_MODEL_NAME) {
            self.model.logical_name = name;
        }
        self
    }

    pub fn to_json(&self) -> Result<String, InferenceError> {
        serde_json::to_string_pretty(self).map_err(|e| InferenceError::Config(e.to_string()))
    }
}
