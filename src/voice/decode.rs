//! Incremental decoding of synthesized audio
//!
//! TTS backends stream bytes with no regard for frame boundaries. MP3 input is
//! split on frame headers so only whole frames reach the decoder; raw PCM
//! carries an odd trailing byte over to the next chunk.

use std::collections::VecDeque;
use std::io::Read;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{Error, Result};

/// Give up resyncing after this many bytes without a frame header
const MAX_UNSYNCED_BYTES: usize = 64 * 1024;

/// Encoding requested from (and returned by) a synthesis backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// MPEG-1/2 Layer III
    Mp3,
    /// Signed 16-bit little-endian mono PCM
    Pcm,
}

impl AudioEncoding {
    /// Name used in backend requests
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Pcm => "pcm",
        }
    }
}

impl FromStr for AudioEncoding {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "pcm" | "pcm_s16le" | "raw" => Ok(Self::Pcm),
            other => Err(Error::Config(format!("unknown audio format: {other}"))),
        }
    }
}

/// Decoded mono samples in [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Streaming decoder for one utterance
pub enum StreamDecoder {
    Mp3(Mp3StreamDecoder),
    Pcm(PcmStreamDecoder),
}

impl StreamDecoder {
    /// Create a decoder for `encoding`; `pcm_sample_rate` applies to raw PCM
    #[must_use]
    pub fn new(encoding: AudioEncoding, pcm_sample_rate: u32) -> Self {
        match encoding {
            AudioEncoding::Mp3 => Self::Mp3(Mp3StreamDecoder::new()),
            AudioEncoding::Pcm => Self::Pcm(PcmStreamDecoder::new(pcm_sample_rate)),
        }
    }

    /// Feed backend bytes, returning any audio that is now decodable
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the chunk cannot be decoded; the decoder
    /// stays usable for the next chunk
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<PcmChunk>> {
        match self {
            Self::Mp3(d) => d.push(bytes),
            Self::Pcm(d) => Ok(d.push(bytes)),
        }
    }

    /// Decode whatever is left at end of stream
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the trailing data cannot be decoded
    pub fn finish(&mut self) -> Result<Option<PcmChunk>> {
        match self {
            Self::Mp3(d) => d.finish(),
            Self::Pcm(d) => Ok(d.finish()),
        }
    }
}

/// Raw s16le mono PCM
pub struct PcmStreamDecoder {
    sample_rate: u32,
    leftover: Option<u8>,
}

impl PcmStreamDecoder {
    #[must_use]
    pub const fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            leftover: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Option<PcmChunk> {
        let mut data = Vec::with_capacity(bytes.len() + 1);
        if let Some(b) = self.leftover.take() {
            data.push(b);
        }
        data.extend_from_slice(bytes);

        if data.len() % 2 == 1 {
            self.leftover = data.pop();
        }
        if data.is_empty() {
            return None;
        }

        let samples = data
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
            .collect();

        Some(PcmChunk {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    pub fn finish(&mut self) -> Option<PcmChunk> {
        if self.leftover.take().is_some() {
            tracing::debug!("dropping odd trailing pcm byte");
        }
        None
    }
}

/// MP3 decoder that keeps bit-reservoir state across chunks
///
/// minimp3 only locks onto a frame when it can see the header of the frame
/// after it, so the newest frame stays queued inside the decoder until its
/// successor arrives or the stream ends.
pub struct Mp3StreamDecoder {
    splitter: Mp3FrameSplitter,
    feed: Arc<Mutex<VecDeque<u8>>>,
    decoder: minimp3::Decoder<FeedReader>,
    /// Frames handed to the decoder and not yet decoded
    queued: usize,
}

impl Mp3StreamDecoder {
    #[must_use]
    pub fn new() -> Self {
        let feed = Arc::new(Mutex::new(VecDeque::new()));
        Self {
            splitter: Mp3FrameSplitter::new(),
            decoder: minimp3::Decoder::new(FeedReader(Arc::clone(&feed))),
            feed,
            queued: 0,
        }
    }

    /// # Errors
    ///
    /// Returns `Error::Decode` on undecodable input
    pub fn push(&mut self, bytes: &[u8]) -> Result<Option<PcmChunk>> {
        let frames = self.splitter.push(bytes)?;
        if frames.is_empty() {
            return Ok(None);
        }
        self.queued += frames.len();
        self.feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(frames.into_iter().flatten());
        self.drain(1)
    }

    /// # Errors
    ///
    /// Returns `Error::Decode` on undecodable input
    pub fn finish(&mut self) -> Result<Option<PcmChunk>> {
        let remaining = self.splitter.take_remaining();
        if !remaining.is_empty() {
            tracing::debug!(bytes = remaining.len(), "dropping incomplete trailing mp3 frame");
        }
        self.drain(0)
    }

    /// Decode queued frames until at most `keep` remain
    fn drain(&mut self, keep: usize) -> Result<Option<PcmChunk>> {
        let mut samples = Vec::new();
        let mut sample_rate = 0u32;

        while self.queued > keep {
            match self.decoder.next_frame() {
                Ok(frame) => {
                    self.queued -= 1;
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or_default();
                    if frame.channels == 2 {
                        samples.extend(frame.data.chunks(2).map(|pair| {
                            let left = f32::from(pair[0]) / 32768.0;
                            let right = f32::from(pair.get(1).copied().unwrap_or(pair[0])) / 32768.0;
                            f32::midpoint(left, right)
                        }));
                    } else {
                        samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                    }
                }
                Err(minimp3::Error::Eof | minimp3::Error::InsufficientData) => {
                    // Whatever is still counted was skipped as junk
                    if keep == 0 {
                        self.queued = 0;
                    }
                    break;
                }
                Err(minimp3::Error::SkippedData) => {}
                Err(e) => return Err(Error::Decode(format!("mp3: {e}"))),
            }
        }

        if samples.is_empty() || sample_rate == 0 {
            return Ok(None);
        }
        Ok(Some(PcmChunk {
            samples,
            sample_rate,
        }))
    }
}

impl Default for Mp3StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader over bytes handed in by the splitter; returns 0 when empty
struct FeedReader(Arc<Mutex<VecDeque<u8>>>);

impl Read for FeedReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut feed = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        let n = buf.len().min(feed.len());
        for (slot, byte) in buf.iter_mut().zip(feed.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Splits an MP3 byte stream into whole frames
#[derive(Debug, Default)]
pub struct Mp3FrameSplitter {
    buffer: Vec<u8>,
    /// ID3v2 bytes still to skip
    skip: usize,
    /// Bytes discarded since the last good frame
    unsynced: usize,
    started: bool,
}

impl Mp3FrameSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete frame now available, in order
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if no frame header is found in a large run of
    /// input; that input is discarded
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buffer.extend_from_slice(bytes);

        if !self.started {
            if self.buffer.len() < 10 {
                return Ok(Vec::new());
            }
            self.started = true;
            if let Some(tag_len) = id3v2_len(&self.buffer) {
                tracing::trace!(tag_len, "skipping id3v2 tag");
                self.skip = tag_len;
            }
        }

        if self.skip > 0 {
            let n = self.skip.min(self.buffer.len());
            self.buffer.drain(..n);
            self.skip -= n;
            if self.skip > 0 {
                return Ok(Vec::new());
            }
        }

        let mut out = Vec::new();
        let mut pos = 0;
        let mut skipped = 0;

        while pos + 4 <= self.buffer.len() {
            let Some(len) = frame_len(&self.buffer[pos..pos + 4]) else {
                pos += 1;
                skipped += 1;
                continue;
            };
            if pos + len > self.buffer.len() {
                break;
            }
            out.push(self.buffer[pos..pos + len].to_vec());
            pos += len;
        }

        self.buffer.drain(..pos);

        if out.is_empty() {
            self.unsynced += skipped;
        } else {
            if skipped > 0 {
                tracing::debug!(skipped, "resynced mp3 stream");
            }
            self.unsynced = 0;
        }
        if self.unsynced > MAX_UNSYNCED_BYTES {
            let dropped = self.unsynced + self.buffer.len();
            self.buffer.clear();
            self.unsynced = 0;
            return Err(Error::Decode(format!(
                "no mp3 frame header in {dropped} bytes"
            )));
        }

        Ok(out)
    }

    /// Bytes of an incomplete trailing frame
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

/// Total length of a leading ID3v2 tag, if present
fn id3v2_len(data: &[u8]) -> Option<usize> {
    if data.len() < 10 || &data[..3] != b"ID3" {
        return None;
    }
    let size = data[6..10]
        .iter()
        .fold(0usize, |acc, &b| (acc << 7) | usize::from(b & 0x7F));
    let footer = if data[5] & 0x10 == 0 { 0 } else { 10 };
    Some(10 + size + footer)
}

/// Length in bytes of the Layer III frame starting with `header`
fn frame_len(header: &[u8]) -> Option<usize> {
    const BITRATES_V1: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
    const BITRATES_V2: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

    if header.len() < 4 || header[0] != 0xFF || header[1] & 0xE0 != 0xE0 {
        return None;
    }

    let version = (header[1] >> 3) & 0x03;
    let layer = (header[1] >> 1) & 0x03;
    let bitrate_idx = usize::from(header[2] >> 4);
    let rate_idx = usize::from((header[2] >> 2) & 0x03);
    let padding = u32::from((header[2] >> 1) & 0x01);

    // Layer III only; free-format and reserved values rejected
    if layer != 0x01 || version == 0x01 || bitrate_idx == 0 || bitrate_idx == 15 || rate_idx == 3
    {
        return None;
    }

    let (bitrate, sample_rate, coefficient) = match version {
        0x03 => (BITRATES_V1[bitrate_idx], [44100, 48000, 32000][rate_idx], 144),
        0x02 => (BITRATES_V2[bitrate_idx], [22050, 24000, 16000][rate_idx], 72),
        _ => (BITRATES_V2[bitrate_idx], [11025, 12000, 8000][rate_idx], 72),
    };

    usize::try_from(coefficient * bitrate * 1000 / sample_rate + padding).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// MPEG-1 Layer III, 128 kbps, 44.1 kHz, no CRC
    fn frame(padded: bool) -> Vec<u8> {
        let len = if padded { 418 } else { 417 };
        let mut f = vec![0u8; len];
        f[0] = 0xFF;
        f[1] = 0xFB;
        f[2] = if padded { 0x92 } else { 0x90 };
        f
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(frame_len(&[0xFF, 0xFB, 0x90, 0x00]), Some(417));
        assert_eq!(frame_len(&[0xFF, 0xFB, 0x92, 0x00]), Some(418));
        // MPEG-2, 64 kbps, 24 kHz
        assert_eq!(frame_len(&[0xFF, 0xF3, 0x84, 0x00]), Some(192));
        assert_eq!(frame_len(&[0x00, 0xFB, 0x90, 0x00]), None);
        assert_eq!(frame_len(&[0xFF, 0xFB, 0xF0, 0x00]), None);
    }

    #[test]
    fn test_splitter_waits_for_whole_frames() {
        let mut stream = frame(false);
        stream.extend(frame(true));

        let mut splitter = Mp3FrameSplitter::new();
        assert!(splitter.push(&stream[..300]).unwrap().is_empty());
        let first = splitter.push(&stream[300..500]).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].len(), 417);
        assert_eq!(splitter.push(&stream[500..]).unwrap()[0].len(), 418);
        assert!(splitter.take_remaining().is_empty());
    }

    #[test]
    fn test_splitter_skips_id3_and_garbage() {
        let mut stream = b"ID3\x04\x00\x00\x00\x00\x00\x05".to_vec();
        stream.extend([1, 2, 3, 4, 5]);
        stream.extend([0x00, 0x11]);
        stream.extend(frame(false));

        let mut splitter = Mp3FrameSplitter::new();
        let mut out = splitter.push(&stream[..12]).unwrap().concat();
        out.extend(splitter.push(&stream[12..]).unwrap().concat());
        assert_eq!(out.len(), 417);
        assert_eq!(&out[..2], &[0xFF, 0xFB]);
    }

    #[test]
    fn test_splitter_gives_up_on_noise() {
        let mut splitter = Mp3FrameSplitter::new();
        let noise = vec![0x42u8; MAX_UNSYNCED_BYTES + 16];
        assert!(matches!(splitter.push(&noise), Err(Error::Decode(_))));
        // Still usable afterwards
        assert_eq!(splitter.push(&frame(false)).unwrap().concat().len(), 417);
    }

    /// Silent frames: header followed by zeroed side info and main data
    fn silent_stream(frames: usize) -> Vec<u8> {
        (0..frames).flat_map(|i| frame(i % 3 == 0)).collect()
    }

    fn decoded_len(stream: &[u8], chunk: usize) -> usize {
        let mut decoder = Mp3StreamDecoder::new();
        let mut total = 0;
        for piece in stream.chunks(chunk) {
            if let Some(pcm) = decoder.push(piece).unwrap() {
                assert_eq!(pcm.sample_rate, 44100);
                total += pcm.samples.len();
            }
        }
        if let Some(pcm) = decoder.finish().unwrap() {
            total += pcm.samples.len();
        }
        total
    }

    #[test]
    fn test_mp3_small_chunks_decode_every_frame() {
        let stream = silent_stream(20);
        let whole = decoded_len(&stream, stream.len());

        assert_eq!(whole, 20 * 1152);
        assert_eq!(decoded_len(&stream, 200), whole);
        assert_eq!(decoded_len(&stream, 1000), whole);
        assert_eq!(decoded_len(&stream, 1), whole);
    }

    #[test]
    fn test_mp3_newest_frame_waits_for_successor() {
        let stream = silent_stream(3);
        let mut decoder = Mp3StreamDecoder::new();

        // One whole frame alone cannot be synced yet
        assert!(decoder.push(&stream[..418]).unwrap().is_none());

        let pcm = decoder.push(&stream[418..]).unwrap().unwrap();
        assert_eq!(pcm.samples.len(), 2 * 1152);
        assert_eq!(decoder.finish().unwrap().unwrap().samples.len(), 1152);
    }

    #[test]
    fn test_pcm_carries_odd_byte() {
        let mut decoder = PcmStreamDecoder::new(24000);
        let sample = 16384i16.to_le_bytes();

        assert!(decoder.push(&sample[..1]).is_none());
        let chunk = decoder.push(&[sample[1], sample[0], sample[1]]).unwrap();
        assert_eq!(chunk.sample_rate, 24000);
        assert_eq!(chunk.samples, vec![0.5, 0.5]);
    }

    #[test]
    fn test_encoding_from_str() {
        assert_eq!("MP3".parse::<AudioEncoding>().unwrap(), AudioEncoding::Mp3);
        assert_eq!("pcm".parse::<AudioEncoding>().unwrap(), AudioEncoding::Pcm);
        assert!("ogg".parse::<AudioEncoding>().is_err());
    }
}
