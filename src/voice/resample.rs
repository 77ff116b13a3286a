//! Streaming sample-rate conversion

use rubato::{FftFixedIn, Resampler};

use crate::{Error, Result};

/// Input block size fed to the FFT resampler
const CHUNK_SIZE: usize = 1024;

/// Mono resampler that accepts arbitrarily sized input blocks
///
/// Input is buffered until a full resampler chunk is available; `flush`
/// pushes out whatever is left at the end of a stream.
pub struct StreamResampler {
    inner: Option<FftFixedIn<f32>>,
    pending: Vec<f32>,
    from: u32,
    to: u32,
}

impl StreamResampler {
    /// Create a resampler from `from` Hz to `to` Hz
    ///
    /// # Errors
    ///
    /// Returns error if the rates are zero or the resampler cannot be built
    pub fn new(from: u32, to: u32) -> Result<Self> {
        if from == 0 || to == 0 {
            return Err(Error::Config(format!("invalid resample rates {from} -> {to}")));
        }

        let inner = if from == to {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(from as usize, to as usize, CHUNK_SIZE, 2, 1)
                    .map_err(|e| Error::Config(format!("resampler: {e}")))?,
            )
        };

        Ok(Self {
            inner,
            pending: Vec::new(),
            from,
            to,
        })
    }

    #[must_use]
    pub const fn input_rate(&self) -> u32 {
        self.from
    }

    #[must_use]
    pub const fn output_rate(&self) -> u32 {
        self.to
    }

    /// Resample a block, returning whatever output is ready
    ///
    /// # Errors
    ///
    /// Returns error if the resampler rejects the input
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        loop {
            let needed = inner.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let block: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = inner
                .process(std::slice::from_ref(&block), None)
                .map_err(|e| Error::Decode(format!("resample: {e}")))?;
            if let Some(channel) = resampled.into_iter().next() {
                out.extend(channel);
            }
        }

        Ok(out)
    }

    /// Push out buffered input at end of stream
    ///
    /// # Errors
    ///
    /// Returns error if the resampler rejects the input
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let Some(inner) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let block = std::mem::take(&mut self.pending);
        let resampled = inner
            .process_partial(Some(std::slice::from_ref(&block)), None)
            .map_err(|e| Error::Decode(format!("resample: {e}")))?;
        Ok(resampled.into_iter().next().unwrap_or_default())
    }
}

/// Average interleaved channels down to mono
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_same_rate() {
        let mut r = StreamResampler::new(16000, 16000).unwrap();
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(r.process(&input).unwrap(), input);
        assert!(r.flush().unwrap().is_empty());
    }

    #[test]
    fn test_upsample_length() {
        let mut r = StreamResampler::new(16000, 48000).unwrap();
        let input = vec![0.0f32; 16000];

        let mut out = r.process(&input).unwrap();
        out.extend(r.flush().unwrap());

        // Roughly three times as many samples, allowing for resampler delay
        assert!(out.len() > 40000, "got {}", out.len());
        assert!(out.len() <= 52000, "got {}", out.len());
    }

    #[test]
    fn test_small_blocks_are_buffered() {
        let mut r = StreamResampler::new(24000, 48000).unwrap();
        assert!(r.process(&[0.0; 100]).unwrap().is_empty());
    }

    #[test]
    fn test_zero_rate_rejected() {
        assert!(StreamResampler::new(0, 16000).is_err());
    }

    #[test]
    fn test_downmix() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
        assert_eq!(downmix(&[0.25], 1), vec![0.25]);
    }
}
