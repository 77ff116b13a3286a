//! Shared test utilities: scripted backends, a recording speaker and audio generators

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use beacon_voice::dialogue::{ChatBackend, ChatDelta, ChatStream, Message};
use beacon_voice::voice::{
    AudioByteStream, AudioEncoding, AudioFrame, AudioOutput, PlaybackSession, SpeechSegment,
    SpeechSynthesizer, Transcriber,
};
use beacon_voice::{Error, Result};

pub const RATE: u32 = 16000;
pub const FRAME_MS: u64 = 20;
pub const FRAME_SAMPLES: usize = 320;

/// Transcriber that returns scripted results in order, then empty strings
#[derive(Default)]
pub struct ScriptedTranscriber {
    results: Mutex<VecDeque<Result<String>>>,
    pub calls: AtomicUsize,
}

impl ScriptedTranscriber {
    pub fn new(results: Vec<Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(results.into()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(&self, _segment: &SpeechSegment) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

/// One scripted chat reply
pub enum Reply {
    /// Deltas streamed with `delay` before each
    Stream { deltas: Vec<ChatDelta>, delay: Duration },
    /// The request itself fails
    Fail(String),
}

impl Reply {
    pub fn text(fragments: &[&str]) -> Self {
        Self::Stream {
            deltas: fragments
                .iter()
                .map(|f| ChatDelta::Content((*f).to_string()))
                .collect(),
            delay: Duration::ZERO,
        }
    }

    pub fn slow(fragments: &[&str], delay: Duration) -> Self {
        match Self::text(fragments) {
            Self::Stream { deltas, .. } => Self::Stream { deltas, delay },
            fail @ Self::Fail(_) => fail,
        }
    }

    #[must_use]
    pub fn with_usage(self, total_tokens: u32) -> Self {
        match self {
            Self::Stream { mut deltas, delay } => {
                deltas.push(ChatDelta::Usage { total_tokens });
                Self::Stream { deltas, delay }
            }
            fail @ Self::Fail(_) => fail,
        }
    }
}

/// Chat backend that plays scripted replies and records every request
#[derive(Default)]
pub struct ScriptedChat {
    replies: Mutex<VecDeque<Reply>>,
    pub requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for ScriptedChat {
    async fn stream_chat(&self, messages: &[Message]) -> Result<ChatStream> {
        self.requests.lock().unwrap().push(messages.to_vec());

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Reply::text(&[]));

        match reply {
            Reply::Fail(message) => Err(Error::Llm(message)),
            Reply::Stream { deltas, delay } => Ok(futures::stream::iter(deltas)
                .then(move |delta| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(delta)
                })
                .boxed()),
        }
    }
}

/// Synthesizer returning a short 24 kHz PCM tone per utterance, in small chunks
#[derive(Default)]
pub struct ToneSynthesizer {
    pub texts: Mutex<Vec<String>>,
    pub samples_per_utterance: usize,
}

impl ToneSynthesizer {
    pub fn new(samples_per_utterance: usize) -> Arc<Self> {
        Arc::new(Self {
            texts: Mutex::new(Vec::new()),
            samples_per_utterance,
        })
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<AudioByteStream> {
        self.texts.lock().unwrap().push(text.to_string());

        let bytes: Vec<u8> = (0..self.samples_per_utterance)
            .flat_map(|i| {
                let v = if i % 2 == 0 { 4000_i16 } else { -4000 };
                v.to_le_bytes()
            })
            .collect();
        let chunks: Vec<Result<Bytes>> = bytes
            .chunks(481)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    fn encoding(&self) -> AudioEncoding {
        AudioEncoding::Pcm
    }

    fn pcm_sample_rate(&self) -> u32 {
        24000
    }
}

/// Synthesizer whose backend never answers, either the request or the stream
pub struct StalledSynthesizer {
    /// Hang before returning a stream instead of inside it
    pub hang_request: bool,
}

impl StalledSynthesizer {
    pub fn new(hang_request: bool) -> Arc<Self> {
        Arc::new(Self { hang_request })
    }
}

#[async_trait]
impl SpeechSynthesizer for StalledSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<AudioByteStream> {
        if self.hang_request {
            std::future::pending::<()>().await;
        }
        Ok(futures::stream::pending().boxed())
    }

    fn encoding(&self) -> AudioEncoding {
        AudioEncoding::Pcm
    }

    fn pcm_sample_rate(&self) -> u32 {
        24000
    }
}

/// Speaker that records what it was given and plays each chunk in `delay`
pub struct RecordingOutput {
    epoch: Mutex<u64>,
    delay: Duration,
    pub samples: AtomicUsize,
    pub stops: AtomicUsize,
    pub rates: Mutex<Vec<u32>>,
}

impl RecordingOutput {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            epoch: Mutex::new(0),
            delay,
            samples: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            rates: Mutex::new(Vec::new()),
        })
    }

    pub fn played(&self) -> usize {
        self.samples.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    fn current(&self) -> u64 {
        *self.epoch.lock().unwrap()
    }
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    fn session(&self) -> PlaybackSession {
        PlaybackSession::new(self.current())
    }

    async fn play(&self, session: PlaybackSession, samples: &[f32], sample_rate: u32) -> Result<bool> {
        if self.current() != session.epoch() {
            return Ok(false);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.current() != session.epoch() {
            return Ok(false);
        }
        self.samples.fetch_add(samples.len(), Ordering::SeqCst);
        self.rates.lock().unwrap().push(sample_rate);
        Ok(true)
    }

    async fn drain(&self, _session: PlaybackSession) -> Result<()> {
        Ok(())
    }

    fn stop_immediately(&self) {
        *self.epoch.lock().unwrap() += 1;
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// `count` frames of a 440 Hz tone starting at `start_ms`
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub fn tone_frames(start_ms: u64, count: usize, amplitude: f32) -> Vec<AudioFrame> {
    (0..count)
        .map(|i| {
            let offset = i * FRAME_SAMPLES;
            let samples = (0..FRAME_SAMPLES)
                .map(|n| {
                    let t = (offset + n) as f32 / RATE as f32;
                    ((2.0 * std::f32::consts::PI * 440.0 * t).sin() * amplitude * 32767.0) as i16
                })
                .collect();
            AudioFrame::new(
                samples,
                RATE,
                Duration::from_millis(start_ms + i as u64 * FRAME_MS),
            )
        })
        .collect()
}

/// `count` frames of digital silence starting at `start_ms`
pub fn silence_frames(start_ms: u64, count: usize) -> Vec<AudioFrame> {
    (0..count)
        .map(|i| {
            AudioFrame::new(
                vec![0; FRAME_SAMPLES],
                RATE,
                Duration::from_millis(start_ms + i as u64 * FRAME_MS),
            )
        })
        .collect()
}

/// A one-second speech segment
pub fn speech_segment() -> SpeechSegment {
    let frames = tone_frames(0, 50, 0.3);
    SpeechSegment::new(frames, Duration::ZERO, Duration::from_secs(1))
}
