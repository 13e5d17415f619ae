/// Streaming spectral feature extraction
///
/// Turns fixed-size PCM frames into `FeatureWindow`s: a Hann-windowed FFT over
/// the most recent `window_size` samples, summarised as the share of energy in
/// each mel-spaced band plus the RMS level. Output depends only on the input
/// sample sequence and configuration.

use crate::audio_buffer::{AudioSample, SAMPLE_RATE};
use rustfft::num_complex::Complex32;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Feature extraction parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Samples per capture frame (441 = 10ms at 44.1kHz)
    pub frame_size: usize,

    /// Samples per analysis window
    pub window_size: usize,

    /// Samples between consecutive windows
    pub hop_size: usize,

    /// Number of mel-spaced bands
    pub bands: usize,

    /// Lowest band edge in Hz
    pub min_freq: f32,

    /// Highest band edge in Hz
    pub max_freq: f32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            frame_size: SAMPLE_RATE / 100,
            window_size: 1024,   // ~23ms
            hop_size: 512,       // 50% overlap
            bands: 20,
            min_freq: 100.0,
            max_freq: 8000.0,
        }
    }
}

impl FeatureConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.frame_size == 0 {
            return Err("frame_size must be greater than 0".to_string());
        }
        if self.window_size < 2 {
            return Err("window_size must be at least 2".to_string());
        }
        if self.hop_size == 0 || self.hop_size > self.window_size {
            return Err("hop_size must be in 1..=window_size".to_string());
        }
        if self.bands == 0 {
            return Err("bands must be greater than 0".to_string());
        }
        let nyquist = SAMPLE_RATE as f32 / 2.0;
        if !(self.min_freq >= 0.0 && self.min_freq < self.max_freq && self.max_freq <= nyquist) {
            return Err(format!(
                "band range must satisfy 0 <= min_freq < max_freq <= {}",
                nyquist
            ));
        }
        Ok(())
    }

    /// Stream time at the end of sample number `end_sample`
    pub fn time_at(&self, end_sample: u64) -> Duration {
        Duration::from_secs_f64(end_sample as f64 / SAMPLE_RATE as f64)
    }
}

/// One analysis window worth of features
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWindow {
    /// Monotonic window counter, starting at 0
    pub index: u64,

    /// Number of samples consumed when this window was produced
    pub end_sample: u64,

    /// Stream time of the last sample in the window
    pub timestamp: Duration,

    /// Share of spectral energy per band; all zero for a silent window
    pub bands: Vec<f32>,

    /// RMS level, 0.0 - 1.0
    pub level: f32,
}

fn hz_to_mel(hz: f32) -> f32 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f32) -> f32 {
    700.0 * (10f32.powf(mel / 2595.0) - 1.0)
}

/// FFT bin ranges `[start, end)` for each mel band
fn band_bins(config: &FeatureConfig) -> Vec<(usize, usize)> {
    let bin_hz = SAMPLE_RATE as f32 / config.window_size as f32;
    let last_bin = config.window_size / 2;
    let mel_lo = hz_to_mel(config.min_freq);
    let mel_hi = hz_to_mel(config.max_freq);
    let step = (mel_hi - mel_lo) / config.bands as f32;

    let edge = |i: usize| -> usize {
        let hz = mel_to_hz(mel_lo + step * i as f32);
        ((hz / bin_hz).round() as usize).min(last_bin)
    };

    (0..config.bands)
        .map(|b| {
            let start = edge(b);
            // Keep every band at least one bin wide
            let end = edge(b + 1).max(start + 1).min(last_bin + 1);
            (start, end)
        })
        .collect()
}

/// Push-model feature extractor
pub struct StreamingFeatureExtractor {
    config: FeatureConfig,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
    bins: Vec<(usize, usize)>,
    scratch: Vec<Complex32>,
    ring: VecDeque<f32>,
    since_last: usize,
    /// A window has been emitted since the ring was last (re)filled
    primed: bool,
    samples_seen: u64,
    next_index: u64,
    malformed_frames: u64,
}

impl StreamingFeatureExtractor {
    pub fn new(config: FeatureConfig) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.window_size);

        let n = config.window_size;
        let hann = (0..n)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (n - 1) as f32).cos())
            .collect();
        let bins = band_bins(&config);

        debug!(
            "Feature extractor: window={} hop={} bands={}",
            config.window_size, config.hop_size, config.bands
        );

        Self {
            scratch: vec![Complex32::new(0.0, 0.0); n],
            ring: VecDeque::with_capacity(n),
            fft,
            hann,
            bins,
            config,
            since_last: 0,
            primed: false,
            samples_seen: 0,
            next_index: 0,
            malformed_frames: 0,
        }
    }

    /// Feed one capture frame, returning every window it completes
    ///
    /// Frames whose length differs from `frame_size` are dropped and counted.
    pub fn push_frame(&mut self, frame: &[AudioSample]) -> Vec<FeatureWindow> {
        if frame.len() != self.config.frame_size {
            self.malformed_frames += 1;
            warn!(
                "Dropping malformed frame: {} samples, expected {}",
                frame.len(),
                self.config.frame_size
            );
            return Vec::new();
        }

        let mut windows = Vec::new();
        for &sample in frame {
            if self.ring.len() == self.config.window_size {
                self.ring.pop_front();
            }
            self.ring.push_back(sample as f32 / 32768.0);
            self.samples_seen += 1;
            self.since_last += 1;

            let full = self.ring.len() == self.config.window_size;
            if full && (!self.primed || self.since_last >= self.config.hop_size) {
                windows.push(self.analyze());
                self.since_last = 0;
                self.primed = true;
            }
        }
        windows
    }

    fn analyze(&mut self) -> FeatureWindow {
        let mut energy = 0.0f32;
        for ((slot, &sample), &w) in self.scratch.iter_mut().zip(&self.ring).zip(&self.hann) {
            energy += sample * sample;
            *slot = Complex32::new(sample * w, 0.0);
        }
        let level = (energy / self.config.window_size as f32).sqrt();

        self.fft.process(&mut self.scratch);

        let mut bands: Vec<f32> = self
            .bins
            .iter()
            .map(|&(start, end)| self.scratch[start..end].iter().map(|c| c.norm_sqr()).sum())
            .collect();

        let total: f32 = bands.iter().sum();
        if total > 1e-9 {
            bands.iter_mut().for_each(|b| *b /= total);
        } else {
            bands.iter_mut().for_each(|b| *b = 0.0);
        }

        let window = FeatureWindow {
            index: self.next_index,
            end_sample: self.samples_seen,
            timestamp: self.config.time_at(self.samples_seen),
            bands,
            level,
        };
        self.next_index += 1;

        trace!("Window {}: level={:.4}", window.index, window.level);
        window
    }

    /// Start over after a gap in the audio
    ///
    /// Buffered samples are discarded; the sample count, window index and
    /// therefore the stream clock keep running.
    pub fn restart(&mut self) {
        self.ring.clear();
        self.since_last = 0;
        self.primed = false;
        debug!("Feature extractor restarted at sample {}", self.samples_seen);
    }

    /// Run a whole recording through a fresh extractor
    ///
    /// The trailing partial frame, if any, is ignored.
    pub fn extract_all(config: &FeatureConfig, samples: &[AudioSample]) -> Vec<FeatureWindow> {
        let mut extractor = Self::new(config.clone());
        samples
            .chunks_exact(config.frame_size)
            .flat_map(|frame| extractor.push_frame(frame))
            .collect()
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn windows_produced(&self) -> u64 {
        self.next_index
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tone(freq: f32, samples: usize, amplitude: f32) -> Vec<i16> {
        (0..samples)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (amplitude * (2.0 * PI * freq * t).sin() * i16::MAX as f32) as i16
            })
            .collect()
    }

    fn peak_band(window: &FeatureWindow) -> usize {
        window
            .bands
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap()
    }

    #[test]
    fn test_default_config_valid() {
        assert!(FeatureConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = FeatureConfig::default();
        config.hop_size = config.window_size + 1;
        assert!(config.validate().is_err());

        let mut config = FeatureConfig::default();
        config.max_freq = 30_000.0;
        assert!(config.validate().is_err());

        let mut config = FeatureConfig::default();
        config.bands = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_band_bins_are_ordered_and_nonempty() {
        let bins = band_bins(&FeatureConfig::default());
        assert_eq!(bins.len(), 20);
        for (start, end) in &bins {
            assert!(start < end);
        }
        for pair in bins.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }

    #[test]
    fn test_window_cadence() {
        let config = FeatureConfig::default();
        let samples = vec![0i16; config.window_size + 3 * config.hop_size];
        let windows = StreamingFeatureExtractor::extract_all(&config, &samples);

        // First window when the buffer fills, then one per hop
        let expected = 1 + (samples.len() / config.frame_size * config.frame_size
            - config.window_size)
            / config.hop_size;
        assert_eq!(windows.len(), expected);
        for (i, w) in windows.iter().enumerate() {
            assert_eq!(w.index, i as u64);
        }
        assert_eq!(windows[0].end_sample, config.window_size as u64);
        assert_eq!(
            windows[1].end_sample - windows[0].end_sample,
            config.hop_size as u64
        );
    }

    #[test]
    fn test_silence_has_zero_features() {
        let config = FeatureConfig::default();
        let windows = StreamingFeatureExtractor::extract_all(&config, &vec![0; SAMPLE_RATE / 2]);

        assert!(!windows.is_empty());
        for w in windows {
            assert_eq!(w.level, 0.0);
            assert!(w.bands.iter().all(|&b| b == 0.0));
        }
    }

    #[test]
    fn test_tone_energy_lands_in_one_band() {
        let config = FeatureConfig::default();
        let windows = StreamingFeatureExtractor::extract_all(&config, &tone(1000.0, 8820, 0.5));
        let last = windows.last().unwrap();

        assert_relative_eq!(last.bands.iter().sum::<f32>(), 1.0, epsilon = 1e-4);
        assert!(last.bands[peak_band(last)] > 0.8);
        assert_relative_eq!(last.level, 0.5 / 2f32.sqrt(), epsilon = 0.02);
    }

    #[test]
    fn test_higher_tone_maps_to_higher_band() {
        let config = FeatureConfig::default();
        let low = StreamingFeatureExtractor::extract_all(&config, &tone(500.0, 4410, 0.4));
        let high = StreamingFeatureExtractor::extract_all(&config, &tone(3000.0, 4410, 0.4));

        assert!(peak_band(high.last().unwrap()) > peak_band(low.last().unwrap()));
    }

    #[test]
    fn test_malformed_frame_is_counted_not_fatal() {
        let config = FeatureConfig::default();
        let mut extractor = StreamingFeatureExtractor::new(config.clone());

        assert!(extractor.push_frame(&[0; 10]).is_empty());
        assert!(extractor.push_frame(&[]).is_empty());
        assert_eq!(extractor.malformed_frames(), 2);
        assert_eq!(extractor.samples_seen(), 0);

        for _ in 0..4 {
            extractor.push_frame(&vec![0; config.frame_size]);
        }
        assert!(extractor.windows_produced() > 0);
    }

    #[test]
    fn test_restart_keeps_stream_clock() {
        let config = FeatureConfig::default();
        let mut extractor = StreamingFeatureExtractor::new(config.clone());
        let frame = vec![0; config.frame_size];

        let before: Vec<_> = (0..5).flat_map(|_| extractor.push_frame(&frame)).collect();
        let last = before.last().unwrap().clone();

        let restarted_at = extractor.samples_seen();
        extractor.restart();
        // Ring is empty again: nothing until a full window has arrived
        assert!(extractor.push_frame(&frame).is_empty());
        assert!(extractor.push_frame(&frame).is_empty());
        let after = extractor.push_frame(&frame);

        assert_eq!(after.len(), 1);
        assert_eq!(after[0].index, last.index + 1);
        assert!(after[0].timestamp > last.timestamp);
        assert_eq!(after[0].end_sample, restarted_at + config.window_size as u64);
    }

    #[test]
    fn test_deterministic_output() {
        let config = FeatureConfig::default();
        let audio = tone(750.0, SAMPLE_RATE / 4, 0.3);

        let a = StreamingFeatureExtractor::extract_all(&config, &audio);
        let b = StreamingFeatureExtractor::extract_all(&config, &audio);
        assert_eq!(a, b);
    }
}
