/// Hotword detection library
///
/// Continuous keyword spotting over a live PCM stream: spectral feature
/// extraction, template matching with smoothing and refractory periods, and a
/// session state machine that manages the capture device according to a
/// resource-control mode and reports progress through a listener.

pub mod audio_buffer;
pub mod config;
pub mod detector;
pub mod error;
pub mod features;
pub mod listener;
pub mod matcher;
pub mod model;
mod notify;
pub mod resource;
pub mod source;
pub mod state;

// Re-export main types
pub use audio_buffer::{AudioBufferError, AudioSample, FrameQueue, SAMPLE_RATE};
pub use config::{DetectorConfig, ModelSpec};
pub use detector::{HotwordDetect, SessionStats};
pub use error::HotwordError;
pub use features::{FeatureConfig, FeatureWindow, StreamingFeatureExtractor};
pub use listener::{ChannelListener, HotwordListener, ListenerEvent};
pub use matcher::{DetectionEvent, KeywordMatcher};
pub use model::{KeywordModel, ModelError, ModelParams};
pub use resource::{AcquirePolicy, ResourceControlMode, ResourceController, ResourceState};
pub use source::{AudioSource, CaptureDevice, DeviceError, ReplayDevice};
pub use state::DetectionState;

#[cfg(feature = "mic")]
pub use source::MicDevice;
