//! Audio frames, speech segments and the bounded capture queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

/// A fixed-size block of 16-bit mono PCM with its capture offset
///
/// Timestamps are monotonic offsets from the start of capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    timestamp: Duration,
}

impl AudioFrame {
    /// Create a frame from samples captured at `timestamp`
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32, timestamp: Duration) -> Self {
        Self {
            samples,
            sample_rate,
            timestamp,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Capture offset of the first sample
    #[must_use]
    pub const fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Playing time of this frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }

    /// Capture offset just past the last sample
    #[must_use]
    pub fn end(&self) -> Duration {
        self.timestamp + self.duration()
    }

    /// RMS energy normalized to [0.0, 1.0]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f32::from(s) / 32768.0;
                v * v
            })
            .sum();
        (sum_squares / self.samples.len() as f32).sqrt()
    }
}

/// A closed span of frames judged to contain speech
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    frames: Vec<AudioFrame>,
    started_at: Duration,
    ended_at: Duration,
}

impl SpeechSegment {
    #[must_use]
    pub const fn new(frames: Vec<AudioFrame>, started_at: Duration, ended_at: Duration) -> Self {
        Self {
            frames,
            started_at,
            ended_at,
        }
    }

    #[must_use]
    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    /// Capture offset of the first speech frame
    #[must_use]
    pub const fn started_at(&self) -> Duration {
        self.started_at
    }

    /// Capture offset at which the segment was closed
    #[must_use]
    pub const fn ended_at(&self) -> Duration {
        self.ended_at
    }

    /// Total duration of the audio held by this segment
    #[must_use]
    pub fn audio_duration(&self) -> Duration {
        self.frames.iter().map(AudioFrame::duration).sum()
    }

    #[must_use]
    pub fn sample_rate(&self) -> u32 {
        self.frames
            .first()
            .map_or(crate::voice::SAMPLE_RATE, AudioFrame::sample_rate)
    }

    /// All samples in capture order
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.frames
            .iter()
            .flat_map(|f| f.samples().iter().copied())
            .collect()
    }

    /// Encode as a 16-bit mono WAV file for STT APIs
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> crate::Result<Vec<u8>> {
        crate::voice::samples_to_wav(&self.samples(), self.sample_rate())
    }
}

/// Outcome of a bounded wait on the frame queue
#[derive(Debug)]
pub enum QueueRecv {
    /// Next frame in capture order
    Frame(AudioFrame),
    /// Nothing arrived before the timeout
    Empty,
    /// Capture has stopped and the queue is drained
    Closed,
}

/// Bounded single-consumer frame queue that never blocks the producer
///
/// When full, the oldest frame is dropped and the drop counter incremented.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Push a frame, evicting the oldest one if the queue is full
    ///
    /// Returns `false` if a frame had to be dropped.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let mut kept_all = true;
        {
            let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
            if frames.len() >= self.capacity {
                frames.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                kept_all = false;
            }
            frames.push_back(frame);
        }
        self.notify.notify_one();
        kept_all
    }

    /// Pop the oldest frame without waiting
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Wait up to `timeout` for the next frame
    pub async fn recv_timeout(&self, timeout: Duration) -> QueueRecv {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(frame) = self.try_pop() {
                return QueueRecv::Frame(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return QueueRecv::Closed;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return QueueRecv::Empty;
            }
        }
    }

    /// Mark the producer as finished; the consumer drains what is left
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Total frames dropped because the consumer fell behind
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
