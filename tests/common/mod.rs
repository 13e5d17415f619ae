//! Shared helpers for integration tests
//!
//! Synthetic keyword audio, a scripted capture device with observable
//! open/close counts, and a recording listener.

#![allow(dead_code)]

use hotword_detect::{
    AcquirePolicy, AudioSample, CaptureDevice, DetectorConfig, DeviceError, FeatureConfig,
    HotwordListener, KeywordModel, ListenerEvent, ModelParams, ResourceControlMode, SAMPLE_RATE,
};
use parking_lot::Mutex;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Generate a sine tone
pub fn tone(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<AudioSample> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;

    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let sample = amplitude * (2.0 * PI * frequency * t).sin();
            (sample * i16::MAX as f32) as i16
        })
        .collect()
}

pub fn silence(duration_secs: f32) -> Vec<AudioSample> {
    vec![0; (SAMPLE_RATE as f32 * duration_secs) as usize]
}

/// Synthetic two-syllable keyword: 800 Hz then 2 kHz, 0.2s each
pub fn keyword() -> Vec<AudioSample> {
    let mut audio = tone(800.0, 0.2, 0.5);
    audio.extend(tone(2000.0, 0.2, 0.5));
    audio
}

/// A different keyword: 1.2 kHz then 4 kHz
pub fn other_keyword() -> Vec<AudioSample> {
    let mut audio = tone(1200.0, 0.2, 0.5);
    audio.extend(tone(4000.0, 0.2, 0.5));
    audio
}

/// `lead` seconds of silence, the keyword, then silence up to `total` seconds
pub fn keyword_at(lead: f32, total: f32) -> Vec<AudioSample> {
    let mut audio = silence(lead);
    audio.extend(keyword());
    let total_samples = (SAMPLE_RATE as f32 * total) as usize;
    if audio.len() < total_samples {
        audio.resize(total_samples, 0);
    }
    audio
}

pub fn model_params() -> ModelParams {
    ModelParams {
        threshold: 0.75,
        refractory: Duration::from_millis(1000),
        smoothing: 3,
        min_level: 0.01,
    }
}

pub fn keyword_model(id: u32) -> KeywordModel {
    KeywordModel::from_reference(id, &keyword(), &FeatureConfig::default(), model_params())
        .expect("keyword model")
}

pub fn other_keyword_model(id: u32) -> KeywordModel {
    KeywordModel::from_reference(id, &other_keyword(), &FeatureConfig::default(), model_params())
        .expect("other keyword model")
}

pub fn test_config(mode: ResourceControlMode) -> DetectorConfig {
    DetectorConfig {
        resource_mode: mode,
        acquire: AcquirePolicy {
            attempts: 3,
            interval: Duration::from_millis(1),
        },
        ..Default::default()
    }
}

/// Observable device state shared with the test
#[derive(Default)]
pub struct Probe {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub failed_opens: AtomicUsize,
    /// Remaining open attempts that should fail
    pub fail_opens: AtomicUsize,
    pub open: AtomicBool,
}

/// Replays a script at roughly 10x real time, then delivers silence
pub struct ScriptedDevice {
    samples: Vec<AudioSample>,
    position: usize,
    probe: Arc<Probe>,
    pace: Duration,
}

impl ScriptedDevice {
    pub fn new(samples: Vec<AudioSample>) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let device = Self {
            samples,
            position: 0,
            probe: Arc::clone(&probe),
            pace: Duration::from_millis(1),
        };
        (device, probe)
    }
}

impl CaptureDevice for ScriptedDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        let failing = self
            .probe
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.probe.failed_opens.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::NotReady("scripted failure".to_string()));
        }

        self.probe.opens.fetch_add(1, Ordering::SeqCst);
        self.probe.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self, buf: &mut [AudioSample]) -> Result<usize, DeviceError> {
        if !self.probe.open.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }

        let remaining = self.samples.len().saturating_sub(self.position);
        let n = buf.len().min(remaining);
        buf[..n].copy_from_slice(&self.samples[self.position..self.position + n]);
        buf[n..].fill(0);
        self.position += n;

        std::thread::sleep(self.pace);
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.probe.open.swap(false, Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.probe.open.load(Ordering::SeqCst)
    }
}

/// Records every callback in arrival order
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<ListenerEvent>>,
    concurrent: AtomicUsize,
    pub overlapped: AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().clone()
    }

    pub fn detections(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ListenerEvent::HotwordDetect(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, event: ListenerEvent) {
        if self.concurrent.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.events.lock().push(event);
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HotwordListener for Recorder {
    fn on_initializing(&self) {
        self.record(ListenerEvent::Initializing);
    }

    fn on_initialized(&self) {
        self.record(ListenerEvent::Initialized);
    }

    fn on_start_detect(&self) {
        self.record(ListenerEvent::StartDetect);
    }

    fn on_hotword_detect(&self, hotword_id: u32) {
        self.record(ListenerEvent::HotwordDetect(hotword_id));
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub const STARTUP: [ListenerEvent; 3] = [
    ListenerEvent::Initializing,
    ListenerEvent::Initialized,
    ListenerEvent::StartDetect,
];
