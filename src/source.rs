/// Audio frame sources
///
/// A `CaptureDevice` is the externally owned capture hardware (or a stand-in
/// for it). `AudioSource` is the shareable handle a session binds to; a
/// source can be bound to at most one live session at a time.

use crate::audio_buffer::{AudioSample, SAMPLE_RATE};
use crate::error::HotwordError;
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Device not ready: {0}")]
    NotReady(String),

    #[error("Device is closed")]
    Closed,

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Unsupported audio format: {0}")]
    Format(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Capture hardware as seen by the engine
///
/// Implementations must keep every call bounded in time: `open` is one
/// acquisition attempt, `read` returns whatever is available (possibly 0)
/// within a short wait.
#[cfg_attr(test, mockall::automock)]
pub trait CaptureDevice: Send {
    /// Make the device ready to deliver samples
    fn open(&mut self) -> Result<(), DeviceError>;

    /// Fill `buf` with mono 16-bit samples at 44.1 kHz, returning the count
    fn read(&mut self, buf: &mut [AudioSample]) -> Result<usize, DeviceError>;

    /// Tear the device down. May report an error if it is already gone.
    fn close(&mut self) -> Result<(), DeviceError>;

    fn is_open(&self) -> bool;
}

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

struct SourceInner {
    id: u64,
    device: Mutex<Box<dyn CaptureDevice>>,
    bound: AtomicBool,
}

/// Shareable handle to a capture device
#[derive(Clone)]
pub struct AudioSource {
    inner: Arc<SourceInner>,
}

impl AudioSource {
    pub fn new<D: CaptureDevice + 'static>(device: D) -> Self {
        let id = NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed);
        debug!("Registered audio source #{}", id);

        Self {
            inner: Arc::new(SourceInner {
                id,
                device: Mutex::new(Box::new(device)),
                bound: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Whether a live session currently owns this source
    pub fn is_bound(&self) -> bool {
        self.inner.bound.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.inner.device.lock().is_open()
    }

    pub fn same_as(&self, other: &AudioSource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn bind(&self) -> Result<(), HotwordError> {
        self.inner
            .bound
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| {
                HotwordError::InvalidResourceState(format!(
                    "audio source #{} is already bound to an active session",
                    self.inner.id
                ))
            })
    }

    pub(crate) fn unbind(&self) {
        self.inner.bound.store(false, Ordering::SeqCst);
    }

    pub(crate) fn open(&self) -> Result<(), DeviceError> {
        self.inner.device.lock().open()
    }

    pub(crate) fn read(&self, buf: &mut [AudioSample]) -> Result<usize, DeviceError> {
        self.inner.device.lock().read(buf)
    }

    pub(crate) fn close(&self) -> Result<(), DeviceError> {
        self.inner.device.lock().close()
    }
}

impl fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSource")
            .field("id", &self.inner.id)
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Plays back a fixed recording as if it were a live device
///
/// After the recording ends the device keeps delivering silence, unless
/// looping is enabled. Playback position survives close/open, like a live
/// stream that kept running while nobody listened.
pub struct ReplayDevice {
    samples: Vec<AudioSample>,
    position: usize,
    chunk_size: usize,
    pace: Option<Duration>,
    looping: bool,
    open: bool,
}

impl ReplayDevice {
    /// Default read size: 10 ms
    pub const CHUNK_SIZE: usize = SAMPLE_RATE / 100;

    pub fn new(samples: Vec<AudioSample>) -> Self {
        Self {
            samples,
            position: 0,
            chunk_size: Self::CHUNK_SIZE,
            pace: None,
            looping: false,
            open: false,
        }
    }

    /// Load a mono 16-bit 44.1 kHz WAV file
    pub fn from_wav<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let reader = hound::WavReader::open(path.as_ref())?;
        let spec = reader.spec();

        if spec.channels != 1 {
            return Err(DeviceError::Format(format!(
                "expected mono, got {} channels",
                spec.channels
            )));
        }
        if spec.sample_rate as usize != SAMPLE_RATE {
            return Err(DeviceError::Format(format!(
                "expected {} Hz, got {} Hz",
                SAMPLE_RATE, spec.sample_rate
            )));
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(DeviceError::Format(format!(
                "expected 16-bit PCM, got {}-bit {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }

        let samples = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Loaded {} samples ({:.2}s) from {}",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32,
            path.as_ref().display()
        );

        Ok(Self::new(samples))
    }

    /// Sleep after each read so playback runs at `speed` times real time
    pub fn paced(mut self, speed: f32) -> Self {
        let chunk_secs = self.chunk_size as f32 / SAMPLE_RATE as f32;
        self.pace = Some(Duration::from_secs_f32(chunk_secs / speed.max(0.01)));
        self
    }

    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Samples delivered so far
    pub fn position(&self) -> usize {
        self.position
    }
}

impl CaptureDevice for ReplayDevice {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.open = true;
        Ok(())
    }

    fn read(&mut self, buf: &mut [AudioSample]) -> Result<usize, DeviceError> {
        if !self.open {
            return Err(DeviceError::Closed);
        }

        if self.looping && self.position >= self.samples.len() && !self.samples.is_empty() {
            self.position = 0;
        }

        let n = self.chunk_size.min(buf.len());
        let remaining = self.samples.len().saturating_sub(self.position);
        let from_recording = n.min(remaining);

        buf[..from_recording]
            .copy_from_slice(&self.samples[self.position..self.position + from_recording]);
        buf[from_recording..n].fill(0);
        self.position += from_recording;

        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }

        Ok(n)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if !self.open {
            return Err(DeviceError::Closed);
        }
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(feature = "mic")]
pub use mic::MicDevice;

#[cfg(feature = "mic")]
mod mic {
    use super::{AudioSample, CaptureDevice, DeviceError, SAMPLE_RATE};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
    use std::collections::VecDeque;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tracing::{error, info};

    const READ_WAIT: Duration = Duration::from_millis(20);
    const OPEN_WAIT: Duration = Duration::from_millis(500);

    struct StreamHandle {
        thread: JoinHandle<()>,
        shutdown: Sender<()>,
        chunks: Receiver<Vec<AudioSample>>,
    }

    /// Default system microphone via cpal
    ///
    /// cpal streams are not `Send`, so the stream lives on its own thread
    /// and hands chunks over a bounded channel.
    #[derive(Default)]
    pub struct MicDevice {
        stream: Option<StreamHandle>,
        pending: VecDeque<AudioSample>,
    }

    impl MicDevice {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn run_stream(
        chunk_tx: Sender<Vec<AudioSample>>,
        ready_tx: Sender<Result<(), String>>,
        shutdown_rx: Receiver<()>,
    ) {
        let host = cpal::default_host();
        let Some(device) = host.default_input_device() else {
            let _ = ready_tx.send(Err("no default input device".to_string()));
            return;
        };

        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(SAMPLE_RATE as u32),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                // Full channel means the reader is behind; drop this chunk.
                let _ = chunk_tx.try_send(data.to_vec());
            },
            |e| error!("Microphone stream error: {}", e),
            None,
        );

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
        };

        if let Err(e) = stream.play() {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }

        let _ = ready_tx.send(Ok(()));
        let _ = shutdown_rx.recv();
        drop(stream);
    }

    impl CaptureDevice for MicDevice {
        fn open(&mut self) -> Result<(), DeviceError> {
            if self.stream.is_some() {
                return Ok(());
            }

            let (chunk_tx, chunks) = bounded(64);
            let (ready_tx, ready_rx) = bounded(1);
            let (shutdown, shutdown_rx) = bounded(1);

            let thread = std::thread::Builder::new()
                .name("hotword-mic".to_string())
                .spawn(move || run_stream(chunk_tx, ready_tx, shutdown_rx))
                .map_err(|e| DeviceError::NotReady(e.to_string()))?;

            match ready_rx.recv_timeout(OPEN_WAIT) {
                Ok(Ok(())) => {
                    info!("Microphone stream started");
                    self.stream = Some(StreamHandle {
                        thread,
                        shutdown,
                        chunks,
                    });
                    Ok(())
                }
                Ok(Err(reason)) => {
                    let _ = thread.join();
                    Err(DeviceError::NotReady(reason))
                }
                Err(_) => {
                    let _ = shutdown.send(());
                    Err(DeviceError::NotReady(
                        "microphone did not start in time".to_string(),
                    ))
                }
            }
        }

        fn read(&mut self, buf: &mut [AudioSample]) -> Result<usize, DeviceError> {
            let stream = self.stream.as_ref().ok_or(DeviceError::Closed)?;

            while self.pending.len() < buf.len() {
                match stream.chunks.recv_timeout(READ_WAIT) {
                    Ok(chunk) => self.pending.extend(chunk),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(DeviceError::Read("microphone stream ended".to_string()))
                    }
                }
            }

            let n = buf.len().min(self.pending.len());
            for (slot, sample) in buf.iter_mut().zip(self.pending.drain(..n)) {
                *slot = sample;
            }
            Ok(n)
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            let stream = self.stream.take().ok_or(DeviceError::Closed)?;
            let _ = stream.shutdown.send(());
            let _ = stream.thread.join();
            self.pending.clear();
            info!("Microphone stream stopped");
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.stream.is_some()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_is_exclusive() {
        let source = AudioSource::new(ReplayDevice::new(vec![]));
        let alias = source.clone();

        source.bind().unwrap();
        assert!(alias.is_bound());
        assert!(matches!(
            alias.bind(),
            Err(HotwordError::InvalidResourceState(_))
        ));

        source.unbind();
        assert!(alias.bind().is_ok());
    }

    #[test]
    fn test_sources_have_distinct_ids() {
        let a = AudioSource::new(ReplayDevice::new(vec![]));
        let b = AudioSource::new(ReplayDevice::new(vec![]));
        assert_ne!(a.id(), b.id());
        assert!(!a.same_as(&b));
        assert!(a.same_as(&a.clone()));
    }

    #[test]
    fn test_replay_requires_open() {
        let mut device = ReplayDevice::new(vec![1, 2, 3]);
        let mut buf = [0i16; 4];
        assert!(matches!(device.read(&mut buf), Err(DeviceError::Closed)));
        assert!(matches!(device.close(), Err(DeviceError::Closed)));
    }

    #[test]
    fn test_replay_pads_with_silence_after_end() {
        let mut device = ReplayDevice::new(vec![5; 6]).with_chunk_size(4);
        device.open().unwrap();

        let mut buf = [9i16; 4];
        assert_eq!(device.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [5, 5, 5, 5]);

        assert_eq!(device.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [5, 5, 0, 0]);
        assert_eq!(device.position(), 6);
    }

    #[test]
    fn test_replay_looping() {
        let mut device = ReplayDevice::new(vec![1, 2, 3]).with_chunk_size(3).looping(true);
        device.open().unwrap();

        let mut buf = [0i16; 3];
        device.read(&mut buf).unwrap();
        device.read(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_replay_position_survives_reopen() {
        let mut device = ReplayDevice::new((0..10).collect()).with_chunk_size(4);
        let mut buf = [0i16; 4];

        device.open().unwrap();
        device.read(&mut buf).unwrap();
        device.close().unwrap();
        device.open().unwrap();
        device.read(&mut buf).unwrap();

        assert_eq!(buf, [4, 5, 6, 7]);
    }

    #[test]
    fn test_from_wav_rejects_stereo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE as u32,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        assert!(matches!(
            ReplayDevice::from_wav(&path),
            Err(DeviceError::Format(_))
        ));
    }

    #[test]
    fn test_from_wav_loads_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE as u32,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for s in [10i16, -10, 20] {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();

        let mut device = ReplayDevice::from_wav(&path).unwrap();
        device.open().unwrap();
        let mut buf = [0i16; 3];
        device.read(&mut buf).unwrap();
        assert_eq!(buf, [10, -10, 20]);
    }
}
