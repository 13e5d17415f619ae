/// Detector configuration
///
/// Everything is optional in the JSON form; omitted fields take defaults.
///
/// ```json
/// {
///   "resource_mode": "auto_release",
///   "features": { "window_size": 1024, "hop_size": 512 },
///   "models": [ { "id": 1, "path": "models/hey.hwkm", "threshold": 0.8 } ]
/// }
/// ```

use crate::audio_buffer::QUEUE_CAPACITY;
use crate::error::HotwordError;
use crate::features::FeatureConfig;
use crate::model::{KeywordModel, ModelParams};
use crate::resource::{AcquirePolicy, ResourceControlMode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// A model file to load at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: u32,
    pub path: PathBuf,
    #[serde(flatten)]
    pub params: ModelParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub resource_mode: ResourceControlMode,

    pub features: FeatureConfig,

    pub acquire: AcquirePolicy,

    /// Capacity of the capture → processing queue, in samples
    pub queue_capacity: usize,

    pub models: Vec<ModelSpec>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            resource_mode: ResourceControlMode::default(),
            features: FeatureConfig::default(),
            acquire: AcquirePolicy::default(),
            queue_capacity: QUEUE_CAPACITY,
            models: Vec::new(),
        }
    }
}

impl DetectorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, HotwordError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HotwordError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            HotwordError::InvalidConfig(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), HotwordError> {
        self.features.validate().map_err(HotwordError::InvalidConfig)?;

        if self.queue_capacity < self.features.frame_size {
            return Err(HotwordError::InvalidConfig(format!(
                "queue_capacity must hold at least one frame ({} samples)",
                self.features.frame_size
            )));
        }

        if self.acquire.attempts == 0 {
            return Err(HotwordError::InvalidConfig(
                "acquire.attempts must be at least 1".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for spec in &self.models {
            spec.params.validate()?;
            if !ids.insert(spec.id) {
                return Err(HotwordError::InvalidConfig(format!(
                    "duplicate hotword id {}",
                    spec.id
                )));
            }
        }

        Ok(())
    }

    /// Load every model listed in `models`
    pub fn load_models(&self) -> Result<Vec<KeywordModel>, HotwordError> {
        self.models
            .iter()
            .map(|spec| {
                KeywordModel::load(spec.id, &spec.path, spec.params.clone())
                    .map_err(HotwordError::from)
            })
            .collect()
    }

    /// Check models against this configuration before a session uses them
    pub fn check_models(&self, models: &[KeywordModel]) -> Result<(), HotwordError> {
        if models.is_empty() {
            return Err(HotwordError::InvalidConfig(
                "at least one keyword model is required".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for model in models {
            if !ids.insert(model.id()) {
                return Err(HotwordError::InvalidConfig(format!(
                    "duplicate hotword id {}",
                    model.id()
                )));
            }
            if model.bands() != self.features.bands {
                return Err(crate::model::ModelError::BandMismatch {
                    id: model.id(),
                    got: model.bands(),
                    expected: self.features.bands,
                }
                .into());
            }
        }
        Ok(())
    }
}
