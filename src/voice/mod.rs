//! Voice processing module
//!
//! Handles audio capture, voice activity detection, wake triggers,
//! transcription, synthesis and playback.

mod capture;
mod decode;
mod frame;
mod playback;
mod resample;
mod stt;
mod synthesis;
mod tts;
mod vad;
mod wake_word;

pub use capture::{AudioCapture, DeviceErrorCallback, FrameAssembler, SAMPLE_RATE, samples_to_wav};
pub use decode::{AudioEncoding, Mp3FrameSplitter, PcmChunk, StreamDecoder};
pub use frame::{AudioFrame, FrameQueue, QueueRecv, SpeechSegment};
pub use playback::{AudioOutput, AudioPlayback, PlaybackSession, SilentOutput, chime, tone};
pub use resample::{StreamResampler, downmix};
pub use stt::{SpeechToText, SttProvider, Transcriber};
pub use synthesis::{DEFAULT_SYNTHESIS_TIMEOUT, SpeechSynthesisStage, SynthesisOutcome};
pub use tts::{AudioByteStream, SilentSynthesizer, SpeechSynthesizer, TextToSpeech, TtsProvider};
pub use vad::{
    EnergyClassifier, GateEvent, SpeechClassifier, VadConfig, VoiceActivityGate, run_gate,
};
pub use wake_word::{WakeEvent, WakeMatch, WakeSignal, WakeSource, WakeWordMatcher};
