/// Keyword models
///
/// A model is a template: the sequence of feature windows a keyword produces,
/// plus matching parameters. Templates are immutable once built.
///
/// Blob layout (little endian):
///
/// ```text
/// "HWKM" | version: u8 = 1 | frames: u16 | bands: u16 | frames * bands * f32
/// ```

use crate::audio_buffer::AudioSample;
use crate::features::{FeatureConfig, StreamingFeatureExtractor};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const MAGIC: &[u8; 4] = b"HWKM";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 2 + 2;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Malformed model blob: {0}")]
    Malformed(String),

    #[error("Unsupported model version: {0}")]
    UnsupportedVersion(u8),

    #[error("Reference audio contains no keyword above level {0}")]
    EmptyReference(f32),

    #[error("Model {id} has {got} bands, extractor produces {expected}")]
    BandMismatch { id: u32, got: usize, expected: usize },

    #[error("Invalid model parameters: {0}")]
    InvalidParams(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Matching parameters for one keyword
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Smoothed confidence needed to fire (0.0 - 1.0)
    pub threshold: f32,

    /// Minimum stream time between two detections of this keyword
    #[serde(rename = "refractory_ms", with = "millis")]
    pub refractory: Duration,

    /// Number of recent scores averaged before comparing to the threshold
    pub smoothing: usize,

    /// Mean RMS level below which the keyword cannot match
    pub min_level: f32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            refractory: Duration::from_millis(1000),
            smoothing: 3,
            min_level: 0.01,
        }
    }
}

impl ModelParams {
    pub fn validate(&self) -> Result<(), ModelError> {
        // Unscored windows count as 0.0, so a zero threshold would fire on anything
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ModelError::InvalidParams(
                "threshold must be in (0.0, 1.0]".to_string(),
            ));
        }
        if self.smoothing == 0 {
            return Err(ModelError::InvalidParams(
                "smoothing must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_level) {
            return Err(ModelError::InvalidParams(
                "min_level must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// A registered keyword
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordModel {
    id: u32,
    template: Vec<Vec<f32>>,
    params: ModelParams,
}

impl KeywordModel {
    pub fn from_template(
        id: u32,
        template: Vec<Vec<f32>>,
        params: ModelParams,
    ) -> Result<Self, ModelError> {
        params.validate()?;

        let bands = template.first().map(Vec::len).unwrap_or(0);
        if template.is_empty() || bands == 0 {
            return Err(ModelError::Malformed("template is empty".to_string()));
        }
        if template.iter().any(|row| row.len() != bands) {
            return Err(ModelError::Malformed(
                "template rows differ in length".to_string(),
            ));
        }
        if template.len() > u16::MAX as usize || bands > u16::MAX as usize {
            return Err(ModelError::Malformed("template too large".to_string()));
        }

        Ok(Self {
            id,
            template,
            params,
        })
    }

    /// Build a template from a clean recording of the keyword
    ///
    /// Windows quieter than `params.min_level` at either end are trimmed.
    pub fn from_reference(
        id: u32,
        samples: &[AudioSample],
        features: &FeatureConfig,
        params: ModelParams,
    ) -> Result<Self, ModelError> {
        let windows = StreamingFeatureExtractor::extract_all(features, samples);
        let loud = |level: f32| level >= params.min_level;

        let first = windows.iter().position(|w| loud(w.level));
        let last = windows.iter().rposition(|w| loud(w.level));
        let (first, last) = match (first, last) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(ModelError::EmptyReference(params.min_level)),
        };

        let template = windows[first..=last]
            .iter()
            .map(|w| w.bands.clone())
            .collect::<Vec<_>>();

        info!(
            "Built keyword model {} from reference: {} windows",
            id,
            template.len()
        );

        Self::from_template(id, template, params)
    }

    /// Parse a model blob
    pub fn from_bytes(id: u32, bytes: &[u8], params: ModelParams) -> Result<Self, ModelError> {
        if bytes.len() < HEADER_LEN {
            return Err(ModelError::Malformed("blob shorter than header".to_string()));
        }
        if &bytes[..4] != MAGIC {
            return Err(ModelError::Malformed("bad magic".to_string()));
        }
        if bytes[4] != VERSION {
            return Err(ModelError::UnsupportedVersion(bytes[4]));
        }

        let frames = u16::from_le_bytes([bytes[5], bytes[6]]) as usize;
        let bands = u16::from_le_bytes([bytes[7], bytes[8]]) as usize;
        let body = &bytes[HEADER_LEN..];

        if body.len() != frames * bands * 4 {
            return Err(ModelError::Malformed(format!(
                "expected {} bytes of weights, got {}",
                frames * bands * 4,
                body.len()
            )));
        }

        let values: Vec<f32> = body
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::Malformed("non-finite weight".to_string()));
        }

        let template = values.chunks(bands.max(1)).map(<[f32]>::to_vec).collect();
        Self::from_template(id, template, params)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.frames() * self.bands() * 4);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&(self.frames() as u16).to_le_bytes());
        out.extend_from_slice(&(self.bands() as u16).to_le_bytes());
        for v in self.template.iter().flatten() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn load<P: AsRef<Path>>(id: u32, path: P, params: ModelParams) -> Result<Self, ModelError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ModelError::NotFound(path.display().to_string()));
        }
        let bytes = std::fs::read(path)?;
        Self::from_bytes(id, &bytes, params)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ModelError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn template(&self) -> &[Vec<f32>] {
        &self.template
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Template length in feature windows
    pub fn frames(&self) -> usize {
        self.template.len()
    }

    pub fn bands(&self) -> usize {
        self.template[0].len()
    }
}
