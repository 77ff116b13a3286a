//! Audio capture from microphone
//!
//! The cpal input stream lives on a dedicated thread for the lifetime of the
//! capture. The audio callback assembles fixed-size 16 kHz mono frames and
//! pushes them to the frame queue without ever blocking.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

use super::frame::{AudioFrame, FrameQueue};
use super::resample::{StreamResampler, downmix};
use crate::config::AudioConfig;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Called from the capture thread when the device fails after opening
pub type DeviceErrorCallback = Box<dyn Fn(Error) + Send + Sync + 'static>;

/// Captures audio from the default input device into a [`FrameQueue`]
pub struct AudioCapture {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    queue: Arc<FrameQueue>,
    device_name: String,
}

impl AudioCapture {
    /// Open the default input device and start capturing on a dedicated thread
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the device cannot be opened or started
    pub fn spawn(
        config: &AudioConfig,
        queue: Arc<FrameQueue>,
        on_error: DeviceErrorCallback,
    ) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<String>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let config = config.clone();
        let thread_queue = Arc::clone(&queue);

        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(&config, Arc::clone(&thread_queue), on_error)
                {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        thread_queue.close();
                        return;
                    }
                };

                // Park until stop is requested or the handle is dropped
                let _ = stop_rx.recv();
                drop(stream);
                thread_queue.close();
                tracing::debug!("audio capture stopped");
            })
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| Error::Device("capture thread exited during startup".to_string()))??;

        tracing::info!(device = %device_name, "audio capture started");

        Ok(Self {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            queue,
            device_name,
        })
    }

    /// Stop capturing and release the device
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.thread.is_some()
    }

    /// Frames dropped because the consumer fell behind
    #[must_use]
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    #[must_use]
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pick a mono config at the analysis rate if the device offers one,
/// otherwise fall back to the device default and convert in the callback
fn choose_input_config(device: &Device, sample_rate: u32) -> Result<(StreamConfig, SampleFormat)> {
    let exact = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        });

    if let Some(supported) = exact {
        let format = supported.sample_format();
        return Ok((supported.with_sample_rate(SampleRate(sample_rate)).config(), format));
    }

    let fallback = device
        .default_input_config()
        .map_err(|e| Error::Device(format!("no suitable audio config found: {e}")))?;
    let format = fallback.sample_format();
    Ok((fallback.config(), format))
}

fn open_input_stream(
    config: &AudioConfig,
    queue: Arc<FrameQueue>,
    on_error: DeviceErrorCallback,
) -> Result<(Stream, String)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;
    let name = device.name().unwrap_or_default();

    let (stream_config, format) = choose_input_config(&device, config.sample_rate)?;

    tracing::debug!(
        device = %name,
        device_rate = stream_config.sample_rate.0,
        channels = stream_config.channels,
        ?format,
        sample_rate = config.sample_rate,
        "audio capture initialized"
    );

    let assembler = FrameAssembler::new(
        stream_config.sample_rate.0,
        usize::from(stream_config.channels),
        config.sample_rate,
        config.frame_samples(),
    )?;

    let stream = match format {
        SampleFormat::F32 => build_input::<f32>(&device, &stream_config, assembler, queue, on_error),
        SampleFormat::I16 => build_input::<i16>(&device, &stream_config, assembler, queue, on_error),
        SampleFormat::U16 => build_input::<u16>(&device, &stream_config, assembler, queue, on_error),
        other => Err(Error::Device(format!("unsupported sample format {other:?}"))),
    }?;

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok((stream, name))
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut assembler: FrameAssembler,
    queue: Arc<FrameQueue>,
    on_error: DeviceErrorCallback,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
                for frame in assembler.push(&scratch) {
                    if !queue.push(frame) {
                        tracing::trace!(dropped = queue.dropped(), "frame queue full, dropped oldest");
                    }
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio capture error");
                on_error(Error::Device(err.to_string()));
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}

/// Cuts device audio into fixed-size analysis frames
///
/// Handles channel downmix and rate conversion when the device could not be
/// opened at the analysis rate. Frame timestamps come from the sample clock.
pub struct FrameAssembler {
    channels: usize,
    resampler: StreamResampler,
    frame_samples: usize,
    sample_rate: u32,
    pending: Vec<i16>,
    emitted: u64,
}

impl FrameAssembler {
    /// Create an assembler for a device running at `device_rate`
    ///
    /// # Errors
    ///
    /// Returns error if rate conversion cannot be set up
    pub fn new(
        device_rate: u32,
        channels: usize,
        sample_rate: u32,
        frame_samples: usize,
    ) -> Result<Self> {
        Ok(Self {
            channels: channels.max(1),
            resampler: StreamResampler::new(device_rate, sample_rate)?,
            frame_samples: frame_samples.max(1),
            sample_rate,
            pending: Vec::with_capacity(frame_samples * 2),
            emitted: 0,
        })
    }

    /// Feed interleaved device samples, returning any completed frames
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<AudioFrame> {
        let mono = downmix(interleaved, self.channels);
        let converted = match self.resampler.process(&mono) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(error = %e, "capture resample failed, dropping block");
                return Vec::new();
            }
        };

        self.pending.extend(converted.iter().map(|&s| to_i16(s)));

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let samples: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            let timestamp = Duration::from_micros(
                self.emitted * 1_000_000 / u64::from(self.sample_rate.max(1)),
            );
            self.emitted += self.frame_samples as u64;
            frames.push(AudioFrame::new(samples, self.sample_rate, timestamp));
        }
        frames
    }
}

/// Convert f32 [-1.0, 1.0] to i16
#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Convert 16-bit samples to WAV bytes for STT APIs
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Stt(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Stt(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Stt(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_cuts_fixed_frames() {
        let mut assembler = FrameAssembler::new(16000, 1, 16000, 320).unwrap();

        assert!(assembler.push(&[0.1; 200]).is_empty());
        let frames = assembler.push(&[0.1; 500]);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples().len(), 320);
        assert_eq!(frames[0].timestamp(), Duration::ZERO);
        assert_eq!(frames[1].timestamp(), Duration::from_millis(20));
    }

    #[test]
    fn test_assembler_downmixes_stereo() {
        let mut assembler = FrameAssembler::new(16000, 2, 16000, 4).unwrap();
        let frames = assembler.push(&[0.5, -0.5, 0.5, -0.5, 0.5, -0.5, 0.5, -0.5]);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].samples().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_to_i16_clamps() {
        assert_eq!(to_i16(2.0), 32767);
        assert_eq!(to_i16(-2.0), -32768);
        assert_eq!(to_i16(0.0), 0);
    }
}
