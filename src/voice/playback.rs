//! Audio playback to speakers
//!
//! The output stream lives on a dedicated thread and pulls from a bounded
//! playout buffer. Writers are tagged with a [`PlaybackSession`]; a call to
//! `stop_immediately` starts a new session, so audio from a cancelled turn is
//! rejected even if its writer has not noticed the cancellation yet.

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::Notify;

use super::resample::StreamResampler;
use crate::{Error, POLL_INTERVAL, Result};

/// Playout buffer depth above which `play` waits
const HIGH_WATER: Duration = Duration::from_millis(200);

/// Extra time `drain` allows beyond the buffered audio
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Identifies the writer's turn; stale sessions are rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackSession {
    epoch: u64,
}

impl PlaybackSession {
    /// Session for outputs implemented outside this module
    #[must_use]
    pub const fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    #[must_use]
    pub const fn epoch(self) -> u64 {
        self.epoch
    }
}

/// An output device that can be stopped from any task
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Session for audio written from now on
    fn session(&self) -> PlaybackSession;

    /// Queue mono samples for playback, waiting while the buffer is full
    ///
    /// Returns `Ok(false)` if the session was stopped; nothing is queued then.
    async fn play(&self, session: PlaybackSession, samples: &[f32], sample_rate: u32)
    -> Result<bool>;

    /// Wait until everything queued in `session` has been played
    async fn drain(&self, session: PlaybackSession) -> Result<()>;

    /// Halt output and discard buffered audio, ending the current session
    fn stop_immediately(&self);
}

struct PlayoutBuffer {
    samples: VecDeque<f32>,
    epoch: u64,
}

struct SinkShared {
    buffer: Mutex<PlayoutBuffer>,
    space: Notify,
    failed: AtomicBool,
}

impl SinkShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, PlayoutBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resampler state belonging to a single playback session
///
/// Input buffered for one session must never come out in the next, so the
/// resampler is rebuilt whenever a different session writes to it.
#[derive(Default)]
struct SessionResampler {
    epoch: u64,
    resampler: Option<StreamResampler>,
}

impl SessionResampler {
    /// Convert for `session`; `None` once `current` has moved past it
    fn convert(
        &mut self,
        current: u64,
        session: PlaybackSession,
        samples: &[f32],
        sample_rate: u32,
        device_rate: u32,
    ) -> Result<Option<Vec<f32>>> {
        if session.epoch != current {
            return Ok(None);
        }
        let rebuild = self.epoch != session.epoch
            || self
                .resampler
                .as_ref()
                .is_none_or(|r| r.input_rate() != sample_rate);
        if rebuild {
            self.epoch = session.epoch;
            self.resampler = Some(StreamResampler::new(sample_rate, device_rate)?);
        }
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(samples).map(Some),
            None => Ok(Some(samples.to_vec())),
        }
    }

    /// Remaining output for `session`; empty if it is no longer current
    fn flush(&mut self, current: u64, session: PlaybackSession) -> Result<Vec<f32>> {
        if session.epoch != current || self.epoch != session.epoch {
            return Ok(Vec::new());
        }
        self.resampler
            .as_mut()
            .map_or_else(|| Ok(Vec::new()), StreamResampler::flush)
    }
}

/// Plays audio to the default output device
pub struct AudioPlayback {
    shared: Arc<SinkShared>,
    /// Locked before the playout buffer whenever both are held
    resampler: Mutex<SessionResampler>,
    device_rate: u32,
    device_name: String,
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the output device cannot be opened
    pub fn new() -> Result<Self> {
        let shared = Arc::new(SinkShared {
            buffer: Mutex::new(PlayoutBuffer {
                samples: VecDeque::new(),
                epoch: 0,
            }),
            space: Notify::new(),
            failed: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(u32, String)>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let thread_shared = Arc::clone(&shared);

        let thread = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let stream = match open_output_stream(thread_shared) {
                    Ok((stream, rate, name)) => {
                        let _ = ready_tx.send(Ok((rate, name)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = stop_rx.recv();
                drop(stream);
                tracing::debug!("audio playback stopped");
            })
            .map_err(|e| Error::Device(format!("failed to spawn playback thread: {e}")))?;

        let (device_rate, device_name) = ready_rx
            .recv()
            .map_err(|_| Error::Device("playback thread exited during startup".to_string()))??;

        tracing::info!(device = %device_name, sample_rate = device_rate, "audio playback started");

        Ok(Self {
            shared,
            resampler: Mutex::new(SessionResampler::default()),
            device_rate,
            device_name,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    #[must_use]
    pub const fn device_rate(&self) -> u32 {
        self.device_rate
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[allow(clippy::cast_possible_truncation)]
    fn high_water(&self) -> usize {
        (self.device_rate as usize * HIGH_WATER.as_millis() as usize) / 1000
    }

    /// Convert to the device rate; `None` if the session has been stopped
    fn convert(
        &self,
        session: PlaybackSession,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<Option<Vec<f32>>> {
        let mut slot = self.resampler.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.shared.lock().epoch;
        slot.convert(current, session, samples, sample_rate, self.device_rate)
    }

    fn flush_resampler(&self, session: PlaybackSession) -> Result<Vec<f32>> {
        let mut slot = self.resampler.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.shared.lock().epoch;
        slot.flush(current, session)
    }

    fn check_device(&self) -> Result<()> {
        if self.shared.failed.load(Ordering::Acquire) {
            return Err(Error::Device("output device failed".to_string()));
        }
        Ok(())
    }

    /// Append converted samples, waiting for room; false if the session ended
    async fn enqueue(&self, session: PlaybackSession, mut samples: Vec<f32>) -> Result<bool> {
        let high_water = self.high_water().max(1);

        while !samples.is_empty() {
            self.check_device()?;
            {
                let mut buffer = self.shared.lock();
                if buffer.epoch != session.epoch {
                    return Ok(false);
                }
                let room = high_water.saturating_sub(buffer.samples.len());
                if room > 0 {
                    let take = room.min(samples.len());
                    buffer.samples.extend(samples.drain(..take));
                    continue;
                }
            }
            let _ = tokio::time::timeout(POLL_INTERVAL, self.shared.space.notified()).await;
        }

        Ok(self.shared.lock().epoch == session.epoch)
    }
}

#[async_trait]
impl AudioOutput for AudioPlayback {
    fn session(&self) -> PlaybackSession {
        PlaybackSession {
            epoch: self.shared.lock().epoch,
        }
    }

    async fn play(
        &self,
        session: PlaybackSession,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<bool> {
        self.check_device()?;
        let Some(converted) = self.convert(session, samples, sample_rate)? else {
            return Ok(false);
        };
        self.enqueue(session, converted).await
    }

    async fn drain(&self, session: PlaybackSession) -> Result<()> {
        let tail = self.flush_resampler(session)?;
        if !self.enqueue(session, tail).await? {
            return Ok(());
        }

        let buffered = self.shared.lock().samples.len() as u64;
        let expected = Duration::from_millis(buffered * 1000 / u64::from(self.device_rate.max(1)));
        let deadline = tokio::time::Instant::now() + expected + DRAIN_GRACE;

        loop {
            self.check_device()?;
            {
                let buffer = self.shared.lock();
                if buffer.epoch != session.epoch || buffer.samples.is_empty() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("playback drain timed out");
                return Err(Error::Timeout("playback drain".to_string()));
            }
            let _ = tokio::time::timeout(POLL_INTERVAL, self.shared.space.notified()).await;
        }
    }

    fn stop_immediately(&self) {
        {
            let mut buffer = self.shared.lock();
            buffer.epoch += 1;
            let discarded = buffer.samples.len();
            buffer.samples.clear();
            tracing::debug!(epoch = buffer.epoch, discarded, "playback stopped");
        }
        self.shared.space.notify_waiters();
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open_output_stream(shared: Arc<SinkShared>) -> Result<(Stream, u32, String)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;
    let name = device.name().unwrap_or_default();

    let supported = device
        .default_output_config()
        .map_err(|e| Error::Device(format!("no suitable output config found: {e}")))?;
    let format = supported.sample_format();
    let config = supported.config();

    tracing::debug!(
        device = %name,
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        ?format,
        "audio playback initialized"
    );

    let stream = match format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, shared),
        SampleFormat::I16 => build_output::<i16>(&device, &config, shared),
        SampleFormat::U16 => build_output::<u16>(&device, &config, shared),
        other => Err(Error::Device(format!("unsupported sample format {other:?}"))),
    }?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok((stream, config.sample_rate.0, name))
}

fn build_output<T>(device: &Device, config: &StreamConfig, shared: Arc<SinkShared>) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels).max(1);
    let error_shared = Arc::clone(&shared);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut buffer = shared.lock();
                for frame in data.chunks_mut(channels) {
                    let sample = buffer.samples.pop_front().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = T::from_sample(sample);
                    }
                }
                drop(buffer);
                shared.space.notify_waiters();
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                error_shared.failed.store(true, Ordering::Release);
                error_shared.space.notify_waiters();
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}

/// Output that discards audio, for muted sessions
#[derive(Debug, Default)]
pub struct SilentOutput {
    epoch: Mutex<u64>,
}

impl SilentOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AudioOutput for SilentOutput {
    fn session(&self) -> PlaybackSession {
        PlaybackSession {
            epoch: self.current(),
        }
    }

    async fn play(&self, session: PlaybackSession, _samples: &[f32], _rate: u32) -> Result<bool> {
        Ok(self.current() == session.epoch)
    }

    async fn drain(&self, _session: PlaybackSession) -> Result<()> {
        Ok(())
    }

    fn stop_immediately(&self) {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

/// Generate a sine tone with short fades at both ends
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn tone(frequency: f32, duration: Duration, sample_rate: u32, amplitude: f32) -> Vec<f32> {
    let total = (u128::from(sample_rate) * duration.as_millis() / 1000) as usize;
    let fade = (sample_rate as usize / 200).min(total / 2).max(1);

    (0..total)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            let envelope = if i < fade {
                i as f32 / fade as f32
            } else if i + fade > total {
                (total - i) as f32 / fade as f32
            } else {
                1.0
            };
            (TAU * frequency * t).sin() * amplitude * envelope
        })
        .collect()
}

/// Short acknowledgement tone played when a turn opens
#[must_use]
pub fn chime(sample_rate: u32) -> Vec<f32> {
    tone(880.0, Duration::from_millis(120), sample_rate, 0.25)
}
