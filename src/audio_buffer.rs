/// Sample queue between the capture thread and the processing thread
///
/// Single producer, single consumer. The producer never waits on the
/// consumer: when the queue is full the oldest samples are dropped and
/// counted, so a slow pipeline loses history instead of stalling capture.

use cache_padded::CachePadded;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{trace, warn};

/// Audio sample format (16-bit PCM)
pub type AudioSample = i16;

/// Capture sample rate in Hz (mono)
pub const SAMPLE_RATE: usize = 44_100;

/// Default queue capacity: 1 second of audio
pub const QUEUE_DURATION_SECS: usize = 1;
pub const QUEUE_CAPACITY: usize = QUEUE_DURATION_SECS * SAMPLE_RATE;

#[derive(Error, Debug)]
pub enum AudioBufferError {
    #[error("Queue underflow: attempted to read {0} samples, but only {1} available")]
    Underflow(usize, usize),

    #[error("Invalid queue capacity: {0}")]
    InvalidSize(usize),
}

type RingBuffer = HeapRb<AudioSample>;
type RingProducer = <RingBuffer as Split>::Prod;
type RingConsumer = <RingBuffer as Split>::Cons;

/// Bounded drop-oldest sample queue
pub struct FrameQueue {
    producer: CachePadded<Mutex<RingProducer>>,
    consumer: CachePadded<Mutex<RingConsumer>>,
    dropped: CachePadded<AtomicU64>,
    capacity: usize,
}

impl FrameQueue {
    /// Create a queue holding one second of audio
    pub fn new() -> Self {
        Self::build(QUEUE_CAPACITY)
    }

    /// Create a queue with custom capacity (in samples)
    pub fn with_capacity(capacity: usize) -> Result<Self, AudioBufferError> {
        if capacity == 0 {
            return Err(AudioBufferError::InvalidSize(capacity));
        }
        Ok(Self::build(capacity))
    }

    fn build(capacity: usize) -> Self {
        trace!("Creating frame queue with capacity: {} samples", capacity);

        let rb = HeapRb::<AudioSample>::new(capacity);
        let (producer, consumer) = rb.split();

        Self {
            producer: CachePadded::new(Mutex::new(producer)),
            consumer: CachePadded::new(Mutex::new(consumer)),
            dropped: CachePadded::new(AtomicU64::new(0)),
            capacity,
        }
    }

    /// Push samples, dropping the oldest queued samples if there is no room.
    ///
    /// Returns the number of samples accepted. When a single push is larger
    /// than the whole queue only its newest `capacity` samples are kept.
    pub fn push(&self, samples: &[AudioSample]) -> usize {
        let samples = if samples.len() > self.capacity {
            let excess = samples.len() - self.capacity;
            self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
            &samples[excess..]
        } else {
            samples
        };

        let mut producer = self.producer.lock();

        let available_space = producer.vacant_len();
        if samples.len() > available_space {
            let to_drop = samples.len() - available_space;
            let skipped = self.consumer.lock().skip(to_drop);
            self.dropped.fetch_add(skipped as u64, Ordering::Relaxed);

            warn!(
                "Frame queue full, dropped {} oldest samples",
                skipped
            );
        }

        producer.push_slice(samples)
    }

    /// Pop exactly `count` samples
    pub fn pop(&self, count: usize) -> Result<Vec<AudioSample>, AudioBufferError> {
        let mut consumer = self.consumer.lock();
        let available = consumer.occupied_len();

        if count > available {
            return Err(AudioBufferError::Underflow(count, available));
        }

        let mut result = vec![0; count];
        let read = consumer.pop_slice(&mut result);
        result.truncate(read);
        Ok(result)
    }

    /// Number of samples currently queued
    pub fn len(&self) -> usize {
        self.consumer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples discarded because the consumer fell behind
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new()
    }
}
