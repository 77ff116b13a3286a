//! Voice activity gate
//!
//! Frames are classified one at a time, then aggregated over a sliding window.
//! A window whose speech-frame ratio reaches `min_speech_ratio` is "active".
//! The first active window opens a segment; the segment is closed once no
//! window has been active for `silence_timeout`.
//!
//! Inactive windows that fall between two active ones stay in the segment (they
//! are pauses inside speech). Inactive windows after the last active one are
//! trailing silence and are dropped when the segment closes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::frame::{AudioFrame, FrameQueue, QueueRecv, SpeechSegment};

/// Voice activity gate configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Aggregation window
    pub window: Duration,

    /// Fraction of speech frames needed for a window to count as speech
    pub min_speech_ratio: f32,

    /// Close the open segment after this long without an active window
    pub silence_timeout: Duration,

    /// RMS threshold for the energy classifier
    pub energy_threshold: f32,

    /// Force-close segments longer than this
    pub max_segment: Duration,

    /// How long a listening turn waits for speech to start
    pub no_speech_timeout: Duration,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(500),
            min_speech_ratio: 0.6,
            silence_timeout: Duration::from_millis(1000),
            energy_threshold: 0.02,
            max_segment: Duration::from_secs(30),
            no_speech_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-frame speech/non-speech classifier
pub trait SpeechClassifier: Send {
    /// Classify a single short frame
    fn is_speech(&mut self, frame: &AudioFrame) -> bool;
}

/// Classifies frames by RMS energy
#[derive(Debug, Clone, Copy)]
pub struct EnergyClassifier {
    threshold: f32,
}

impl EnergyClassifier {
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn is_speech(&mut self, frame: &AudioFrame) -> bool {
        frame.rms() > self.threshold
    }
}

/// Segment boundary emitted by the gate
#[derive(Debug, Clone)]
pub enum GateEvent {
    /// First active window of a new segment
    SpeechStarted {
        /// Capture offset of the first frame in that window
        at: Duration,
    },
    /// Segment closed after the silence timeout (or the length cap)
    SegmentClosed(SpeechSegment),
}

#[derive(Debug)]
struct OpenSegment {
    frames: Vec<AudioFrame>,
    /// Inactive windows since the last active one
    tail: Vec<AudioFrame>,
    started_at: Duration,
}

/// Aggregates per-frame decisions into speech segments
pub struct VoiceActivityGate<C = EnergyClassifier> {
    config: VadConfig,
    classifier: C,
    window: Vec<AudioFrame>,
    window_speech: usize,
    window_span: Duration,
    segment: Option<OpenSegment>,
    last_voice: Duration,
}

impl VoiceActivityGate<EnergyClassifier> {
    /// Create a gate using the energy classifier from `config`
    #[must_use]
    pub const fn with_energy(config: VadConfig) -> Self {
        let classifier = EnergyClassifier::new(config.energy_threshold);
        Self::new(config, classifier)
    }
}

impl<C: SpeechClassifier> VoiceActivityGate<C> {
    #[must_use]
    pub const fn new(config: VadConfig, classifier: C) -> Self {
        Self {
            config,
            classifier,
            window: Vec::new(),
            window_speech: 0,
            window_span: Duration::ZERO,
            segment: None,
            last_voice: Duration::ZERO,
        }
    }

    /// Feed one frame in capture order
    pub fn push(&mut self, frame: AudioFrame) -> Vec<GateEvent> {
        let mut events = Vec::new();
        let now = frame.end();

        if self.classifier.is_speech(&frame) {
            self.window_speech += 1;
        }
        self.window_span += frame.duration();
        self.window.push(frame);

        if self.window_span >= self.config.window {
            if let Some(event) = self.evaluate_window(now) {
                events.push(event);
            }
        }

        if let Some(segment) = self.check_close(now) {
            events.push(GateEvent::SegmentClosed(segment));
        }

        events
    }

    /// Advance the clock without a frame (capture stalled or queue empty)
    pub fn tick(&mut self, now: Duration) -> Option<GateEvent> {
        self.check_close(now).map(GateEvent::SegmentClosed)
    }

    /// Close any open segment at end of input
    pub fn finish(&mut self, now: Duration) -> Option<SpeechSegment> {
        // A partial window may extend an open segment but never opens one
        if self.segment.is_some() && self.window_span > Duration::ZERO {
            let _ = self.evaluate_window(now);
        }
        self.window.clear();
        self.window_speech = 0;
        self.window_span = Duration::ZERO;
        self.close(now)
    }

    /// Whether a segment is currently open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.segment.is_some()
    }

    /// Discard the open segment and the partial window
    pub fn reset(&mut self) {
        self.window.clear();
        self.window_speech = 0;
        self.window_span = Duration::ZERO;
        self.segment = None;
    }

    #[must_use]
    pub const fn config(&self) -> &VadConfig {
        &self.config
    }

    #[allow(clippy::cast_precision_loss)]
    fn evaluate_window(&mut self, now: Duration) -> Option<GateEvent> {
        let frames = std::mem::take(&mut self.window);
        let speech = std::mem::take(&mut self.window_speech);
        self.window_span = Duration::ZERO;

        if frames.is_empty() {
            return None;
        }

        let ratio = speech as f32 / frames.len() as f32;
        let active = ratio >= self.config.min_speech_ratio;

        tracing::trace!(ratio, active, frames = frames.len(), "vad window");

        if active {
            self.last_voice = now;
            match &mut self.segment {
                Some(open) => {
                    let tail = std::mem::take(&mut open.tail);
                    open.frames.extend(tail);
                    open.frames.extend(frames);
                    None
                }
                None => {
                    let started_at = frames[0].timestamp();
                    tracing::debug!(at_ms = started_at.as_millis(), "speech started");
                    self.segment = Some(OpenSegment {
                        frames,
                        tail: Vec::new(),
                        started_at,
                    });
                    Some(GateEvent::SpeechStarted { at: started_at })
                }
            }
        } else {
            if let Some(open) = &mut self.segment {
                open.tail.extend(frames);
            }
            None
        }
    }

    fn check_close(&mut self, now: Duration) -> Option<SpeechSegment> {
        let open = self.segment.as_ref()?;

        let silent_for = now.saturating_sub(self.last_voice);
        if silent_for > self.config.silence_timeout {
            return self.close(now);
        }

        let length = now.saturating_sub(open.started_at);
        if length >= self.config.max_segment {
            tracing::debug!(length_ms = length.as_millis(), "segment hit length cap");
            return self.close(now);
        }

        None
    }

    fn close(&mut self, now: Duration) -> Option<SpeechSegment> {
        let open = self.segment.take()?;
        let ended_at = now.max(self.last_voice);
        let segment = SpeechSegment::new(open.frames, open.started_at, ended_at);
        tracing::debug!(
            started_ms = segment.started_at().as_millis(),
            ended_ms = segment.ended_at().as_millis(),
            audio_ms = segment.audio_duration().as_millis(),
            "speech segment closed"
        );
        Some(segment)
    }
}

/// Drive a gate from the capture queue until cancelled or capture closes
///
/// Every wait on the queue is bounded by `poll`, so silence timeouts fire
/// even when capture stalls.
pub async fn run_gate<C, E>(
    mut gate: VoiceActivityGate<C>,
    queue: Arc<FrameQueue>,
    tx: mpsc::Sender<E>,
    cancel: CancellationToken,
    poll: Duration,
) where
    C: SpeechClassifier,
    E: From<GateEvent> + Send,
{
    let mut last: Option<(Duration, Instant)> = None;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let events = match queue.recv_timeout(poll).await {
            QueueRecv::Frame(frame) => {
                last = Some((frame.end(), Instant::now()));
                gate.push(frame)
            }
            QueueRecv::Empty => match last {
                Some((end, at)) => gate.tick(end + at.elapsed()).into_iter().collect(),
                None => Vec::new(),
            },
            QueueRecv::Closed => {
                let now = last.map_or(Duration::ZERO, |(end, at)| end + at.elapsed());
                if let Some(segment) = gate.finish(now) {
                    let _ = tx.send(GateEvent::SegmentClosed(segment).into()).await;
                }
                tracing::debug!("capture closed, gate stopping");
                break;
            }
        };

        for event in events {
            tokio::select! {
                () = cancel.cancelled() => return,
                sent = tx.send(event.into()) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
