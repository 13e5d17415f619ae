/// Hotword detection session
///
/// `HotwordDetect` ties the pieces together: it binds an audio source, runs
/// the capture and processing threads, applies state transitions under a
/// single lock, hands end-of-cycle resource decisions to the
/// `ResourceController`, and posts callbacks to the notification thread.
///
/// Threads per session:
/// - capture: device → `FrameQueue` (never waits on the consumer)
/// - processing: `FrameQueue` → extractor → matcher → trigger handling
/// - notification: listener callbacks

use crate::audio_buffer::FrameQueue;
use crate::config::DetectorConfig;
use crate::error::HotwordError;
use crate::features::StreamingFeatureExtractor;
use crate::listener::{HotwordListener, ListenerEvent};
use crate::matcher::{DetectionEvent, KeywordMatcher};
use crate::model::KeywordModel;
use crate::notify::Notifier;
use crate::resource::{ResourceControlMode, ResourceController};
use crate::source::AudioSource;
use crate::state::{DetectionState, Transition};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{JoinHandle, Thread};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const IDLE_WAIT: Duration = Duration::from_millis(2);
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const WORKER_PARK: Duration = Duration::from_millis(10);

/// Session statistics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: DetectionState,
    pub resource_held: bool,
    pub frames_processed: u64,
    pub windows_extracted: u64,
    pub detections: u64,
    /// Samples discarded because processing fell behind capture
    pub dropped_samples: u64,
    /// Frames the extractor rejected for having the wrong length
    pub malformed_frames: u64,
    /// Transient device read failures
    pub capture_errors: u64,
}

#[derive(Default)]
struct Counters {
    frames_processed: AtomicU64,
    windows_extracted: AtomicU64,
    detections: AtomicU64,
    dropped_samples: AtomicU64,
    malformed_frames: AtomicU64,
    capture_errors: AtomicU64,
}

/// Capture + processing threads for one detection cycle
struct Pipeline {
    running: Arc<AtomicBool>,
    worker: JoinHandle<()>,
    capture: Option<JoinHandle<()>>,
}

impl Pipeline {
    fn halt(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.worker.thread().unpark();
    }

    fn is_finished(&self) -> bool {
        self.worker.is_finished() && self.capture.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the capture thread to leave the device. It never takes the
    /// session lock, so this is safe while holding it.
    fn join_capture(&mut self) {
        if let Some(capture) = self.capture.take() {
            if capture.join().is_err() {
                error!("Capture thread panicked");
            }
        }
    }

    fn join(mut self) {
        self.halt();
        self.join_capture();
        if self.worker.thread().id() != std::thread::current().id() && self.worker.join().is_err() {
            error!("Processing thread panicked");
        }
    }
}

/// Feature and matching state carried across detection cycles
///
/// Owned by whichever processing thread is running; the stream clock,
/// window index and refractory periods continue from one cycle to the next.
struct Analysis {
    extractor: StreamingFeatureExtractor,
    matcher: KeywordMatcher,
}

impl Analysis {
    /// Called when a new cycle starts on a gap in the audio
    fn resume(&mut self) {
        if self.extractor.samples_seen() > 0 {
            self.extractor.restart();
            self.matcher.restart();
        }
    }
}

struct Core {
    state: DetectionState,
    source: AudioSource,
    pipeline: Option<Pipeline>,
    /// Halted pipelines whose threads have not been joined yet
    retired: Vec<Pipeline>,
    /// Set after an acquisition failure; cleared only by a new session
    fatal: Option<String>,
    last_detection: Option<DetectionEvent>,
}

struct Shared {
    core: Mutex<Core>,
    resource: ResourceController,
    notifier: Notifier,
    analysis: Arc<Mutex<Analysis>>,
    frame_size: usize,
    queue_capacity: usize,
    acquire_attempts: u32,
    counters: Arc<Counters>,
}

/// A hotword detection session
pub struct HotwordDetect {
    shared: Arc<Shared>,
}

impl HotwordDetect {
    /// Bind `source`, acquire it, and start listening
    ///
    /// On success the listener receives `on_initializing`, `on_initialized`,
    /// `on_start_detect`, in that order, on the notification thread.
    pub fn create(
        source: AudioSource,
        models: Vec<KeywordModel>,
        config: DetectorConfig,
        listener: Arc<dyn HotwordListener>,
    ) -> Result<Self, HotwordError> {
        config.validate()?;
        config.check_models(&models)?;
        source.bind()?;

        let notifier = match Notifier::spawn(listener) {
            Ok(notifier) => notifier,
            Err(e) => {
                source.unbind();
                return Err(HotwordError::InvalidResourceState(format!(
                    "cannot start notification thread: {}",
                    e
                )));
            }
        };

        info!(
            "Creating hotword session: source #{}, {} models, mode {:?}",
            source.id(),
            models.len(),
            config.resource_mode
        );

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                state: DetectionState::Uninitialized,
                source: source.clone(),
                pipeline: None,
                retired: Vec::new(),
                fatal: None,
                last_detection: None,
            }),
            resource: ResourceController::new(
                source,
                config.resource_mode,
                config.acquire.clone(),
            ),
            notifier,
            analysis: Arc::new(Mutex::new(Analysis {
                extractor: StreamingFeatureExtractor::new(config.features.clone()),
                matcher: KeywordMatcher::new(models.into()),
            })),
            frame_size: config.features.frame_size,
            queue_capacity: config.queue_capacity,
            acquire_attempts: config.acquire.attempts,
            counters: Arc::new(Counters::default()),
        });

        // Dropping `session` on any error below releases everything.
        let session = Self { shared };
        session.initialize()?;
        Ok(session)
    }

    fn initialize(&self) -> Result<(), HotwordError> {
        let shared = &self.shared;
        let mut core = shared.core.lock();

        core.state = core.state.apply(Transition::Initialize)?;
        shared.notifier.post(ListenerEvent::Initializing);

        shared.resource.acquire()?;
        let pipeline = shared.spawn_pipeline()?;
        core.pipeline = Some(pipeline);

        core.state = core.state.apply(Transition::Ready)?;
        shared.notifier.post(ListenerEvent::Initialized);
        shared.notifier.post(ListenerEvent::StartDetect);

        info!("Hotword session listening");
        Ok(())
    }

    /// Resume detection after a stop (no-op while already listening)
    pub fn start_detection(&self) -> Result<(), HotwordError> {
        let shared = &self.shared;
        let mut core = shared.core.lock();

        if core.state == DetectionState::Listening {
            debug!("start_detection: already listening");
            return Ok(());
        }
        let next = core.state.apply(Transition::Start)?;

        if let Some(reason) = &core.fatal {
            return Err(HotwordError::DeviceAcquisitionFailure {
                attempts: shared.acquire_attempts,
                reason: format!("session unusable after earlier failure: {}", reason),
            });
        }

        if let Some(old) = core.pipeline.take() {
            old.halt();
            core.retired.push(old);
        }
        // The old capture thread may still be inside a device read
        core.retired.iter_mut().for_each(Pipeline::join_capture);
        let (finished, pending) = std::mem::take(&mut core.retired)
            .into_iter()
            .partition::<Vec<_>, _>(Pipeline::is_finished);
        core.retired = pending;
        finished.into_iter().for_each(Pipeline::join);

        if let Err(e) = shared.resource.acquire() {
            error!("Could not re-acquire audio source: {}", e);
            core.fatal = Some(e.to_string());
            return Err(e);
        }

        core.pipeline = Some(shared.spawn_pipeline()?);
        core.state = next;
        shared.notifier.post(ListenerEvent::StartDetect);

        info!("Hotword detection started");
        Ok(())
    }

    /// Stop detecting; under auto-release the device is closed before returning
    pub fn stop_detection(&self) -> Result<(), HotwordError> {
        let shared = &self.shared;
        let mut core = shared.core.lock();

        let next = core.state.apply(Transition::Stop)?;

        if let Some(pipeline) = core.pipeline.take() {
            pipeline.halt();
            core.retired.push(pipeline);
        }
        let released = shared.resource.complete_cycle();
        core.state = next;

        info!("Hotword detection stopped (resource released: {})", released);
        Ok(())
    }

    /// Tear the session down. Idempotent, never fails.
    ///
    /// Waits for trigger handling and any running callback to finish; no
    /// callback is delivered after this returns. Safe to call from inside a
    /// callback.
    pub fn release(&self) {
        let shared = &self.shared;

        let retired = {
            let mut core = shared.core.lock();
            if core.state.is_terminal() {
                Vec::new()
            } else {
                let from = core.state;
                if let Ok(next) = from.apply(Transition::Release) {
                    core.state = next;
                }

                if let Some(pipeline) = core.pipeline.take() {
                    pipeline.halt();
                    core.retired.push(pipeline);
                }
                shared.resource.release();
                core.source.unbind();

                info!("Hotword session released (was {:?})", from);
                std::mem::take(&mut core.retired)
            }
        };

        for pipeline in retired {
            pipeline.join();
        }
        shared.notifier.shutdown();
    }

    /// Swap the audio source; only while not detecting
    pub fn set_audio_record(&self, source: AudioSource) -> Result<(), HotwordError> {
        let shared = &self.shared;
        let mut core = shared.core.lock();

        if core.state.is_terminal() {
            return Err(HotwordError::illegal(core.state, "replace audio source"));
        }
        if core.state.is_streaming() {
            return Err(HotwordError::InvalidResourceState(
                "cannot replace audio source while detecting".to_string(),
            ));
        }
        if source.same_as(&core.source) {
            return Ok(());
        }

        source.bind()?;
        let previous = match shared.resource.replace_source(source.clone()) {
            Ok(previous) => previous,
            Err(e) => {
                source.unbind();
                return Err(e);
            }
        };
        previous.unbind();

        info!(
            "Audio source replaced: #{} -> #{}",
            previous.id(),
            source.id()
        );
        core.source = source;
        Ok(())
    }

    /// Change the resource control mode; only while not detecting
    pub fn set_resource_control_mode(&self, mode: ResourceControlMode) -> Result<(), HotwordError> {
        let core = self.shared.core.lock();

        if core.state.is_terminal() {
            return Err(HotwordError::illegal(core.state, "change resource control mode"));
        }
        if core.state.is_streaming() {
            return Err(HotwordError::InvalidResourceState(
                "cannot change resource control mode while detecting".to_string(),
            ));
        }
        self.shared.resource.set_mode(mode)
    }

    pub fn state(&self) -> DetectionState {
        self.shared.core.lock().state
    }

    pub fn resource_control_mode(&self) -> ResourceControlMode {
        self.shared.resource.mode()
    }

    pub fn is_resource_held(&self) -> bool {
        self.shared.resource.is_held()
    }

    pub fn audio_source(&self) -> AudioSource {
        self.shared.core.lock().source.clone()
    }

    /// Most recent detection, with confidence and stream timestamp
    pub fn last_detection(&self) -> Option<DetectionEvent> {
        self.shared.core.lock().last_detection.clone()
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        let counters = &self.shared.counters;

        SessionStats {
            state,
            resource_held: self.is_resource_held(),
            frames_processed: counters.frames_processed.load(Ordering::Relaxed),
            windows_extracted: counters.windows_extracted.load(Ordering::Relaxed),
            detections: counters.detections.load(Ordering::Relaxed),
            dropped_samples: counters.dropped_samples.load(Ordering::Relaxed),
            malformed_frames: counters.malformed_frames.load(Ordering::Relaxed),
            capture_errors: counters.capture_errors.load(Ordering::Relaxed),
        }
    }
}

impl Drop for HotwordDetect {
    fn drop(&mut self) {
        self.release();
    }
}

impl Shared {
    fn spawn_pipeline(self: &Arc<Self>) -> Result<Pipeline, HotwordError> {
        let spawn_failed = |e: std::io::Error| {
            HotwordError::InvalidResourceState(format!("cannot spawn pipeline thread: {}", e))
        };

        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(
            FrameQueue::with_capacity(self.queue_capacity)
                .map_err(|e| HotwordError::InvalidConfig(e.to_string()))?,
        );

        let worker = {
            let queue = Arc::clone(&queue);
            let running = Arc::clone(&running);
            let analysis = Arc::clone(&self.analysis);
            let shared = Arc::downgrade(self);
            let counters = Arc::clone(&self.counters);

            std::thread::Builder::new()
                .name("hotword-worker".to_string())
                .spawn(move || run_worker(queue, running, analysis, shared, counters))
                .map_err(spawn_failed)?
        };

        let capture = {
            let source = self.resource.source();
            let running_capture = Arc::clone(&running);
            let waker = worker.thread().clone();
            let counters = Arc::clone(&self.counters);
            let frame_size = self.frame_size;

            std::thread::Builder::new()
                .name("hotword-capture".to_string())
                .spawn(move || run_capture(source, queue, running_capture, waker, counters, frame_size))
        };

        let capture = match capture {
            Ok(capture) => capture,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                worker.thread().unpark();
                return Err(spawn_failed(e));
            }
        };

        debug!("Pipeline threads started");
        Ok(Pipeline {
            running,
            worker,
            capture: Some(capture),
        })
    }

    /// Apply a match to the session. Returns false when the processing
    /// thread should exit.
    fn on_detection(&self, event: DetectionEvent, running: &AtomicBool) -> bool {
        let mut core = self.core.lock();

        // A halted pipeline may still deliver one last match
        if !running.load(Ordering::SeqCst) || core.state != DetectionState::Listening {
            debug!("Discarding match from halted pipeline");
            return false;
        }

        match core.state.apply(Transition::Trigger) {
            Ok(next) => core.state = next,
            Err(e) => {
                warn!("Discarding match: {}", e);
                return false;
            }
        }
        self.counters.detections.fetch_add(1, Ordering::Relaxed);
        info!(
            "Hotword {} detected at {:?} (confidence {:.2})",
            event.hotword_id, event.timestamp, event.confidence
        );
        self.notifier.post(ListenerEvent::HotwordDetect(event.hotword_id));
        core.last_detection = Some(event);

        let auto_release = self.resource.mode() == ResourceControlMode::AutoRelease;
        if auto_release {
            running.store(false, Ordering::SeqCst);
        }
        self.resource.complete_cycle();

        let transition = if auto_release {
            Transition::Stop
        } else {
            Transition::Rearm
        };
        match core.state.apply(transition) {
            Ok(next) => core.state = next,
            Err(e) => warn!("Unexpected transition failure after trigger: {}", e),
        }

        !auto_release
    }
}

fn run_capture(
    source: AudioSource,
    queue: Arc<FrameQueue>,
    running: Arc<AtomicBool>,
    waker: Thread,
    counters: Arc<Counters>,
    frame_size: usize,
) {
    let mut buf = vec![0; frame_size];

    while running.load(Ordering::SeqCst) {
        match source.read(&mut buf) {
            Ok(0) => std::thread::sleep(IDLE_WAIT),
            Ok(n) => {
                let dropped_before = queue.dropped_samples();
                queue.push(&buf[..n]);
                let dropped = queue.dropped_samples() - dropped_before;
                if dropped > 0 {
                    counters.dropped_samples.fetch_add(dropped, Ordering::Relaxed);
                }
                waker.unpark();
            }
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                counters.capture_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Audio read failed: {}", e);
                std::thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }
    debug!("Capture thread exiting");
}

fn run_worker(
    queue: Arc<FrameQueue>,
    running: Arc<AtomicBool>,
    analysis: Arc<Mutex<Analysis>>,
    shared: Weak<Shared>,
    counters: Arc<Counters>,
) {
    // Blocks until the previous cycle's processing thread has exited
    let mut analysis = analysis.lock();
    analysis.resume();
    let Analysis { extractor, matcher } = &mut *analysis;
    let frame_size = extractor.config().frame_size;

    while running.load(Ordering::SeqCst) {
        let frame = match queue.pop(frame_size) {
            Ok(frame) => frame,
            Err(_) => {
                std::thread::park_timeout(WORKER_PARK);
                continue;
            }
        };
        counters.frames_processed.fetch_add(1, Ordering::Relaxed);

        let malformed_before = extractor.malformed_frames();
        let windows = extractor.push_frame(&frame);
        if extractor.malformed_frames() > malformed_before {
            counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
        }

        for window in windows {
            counters.windows_extracted.fetch_add(1, Ordering::Relaxed);

            let Some(event) = matcher.process(&window) else {
                continue;
            };
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if !shared.on_detection(event, &running) {
                debug!("Processing thread exiting after trigger");
                return;
            }
        }
    }
    debug!("Processing thread exiting");
}
