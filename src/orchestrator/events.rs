//! Typed events consumed by the orchestrator loop

use std::fmt;

use crate::Error;
use crate::dialogue::ReplyEnd;
use crate::voice::{GateEvent, SynthesisOutcome, WakeEvent};

/// Identifies one turn, from listening through speaking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a segment was transcribed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptPurpose {
    /// Ambient speech checked for a wake phrase
    Wake,
    /// The user's request in a listening turn
    Request,
}

/// How a turn's reply ended
#[derive(Debug, Default)]
pub struct TurnOutcome {
    /// End marker from the dialogue engine, if it arrived
    pub reply: Option<ReplyEnd>,
    pub synthesis: SynthesisOutcome,
    pub cancelled: bool,
}

impl TurnOutcome {
    /// First backend failure, if any
    #[must_use]
    pub fn backend_error(&self) -> Option<&Error> {
        self.reply
            .as_ref()
            .and_then(|r| r.error.as_ref())
            .into_iter()
            .chain(self.synthesis.error.as_ref())
            .find(|e| e.is_backend())
    }

    /// First error of any kind
    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.reply
            .as_ref()
            .and_then(|r| r.error.as_ref())
            .or(self.synthesis.error.as_ref())
    }
}

/// Assistant output mirrored to an observer (e.g. the chat console)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutput {
    Utterance { turn: TurnId, text: String },
    Finished { turn: TurnId },
}

/// Everything the orchestrator reacts to
#[derive(Debug)]
pub enum Event {
    /// Wake signal fired
    Wake(WakeEvent),
    /// External interrupt or push-to-talk trigger
    InterruptRequested,
    /// Segment boundary from the voice activity gate
    Gate(GateEvent),
    /// Transcription finished
    Transcribed {
        turn: Option<TurnId>,
        purpose: TranscriptPurpose,
        result: crate::Result<String>,
    },
    /// Typed user input, bypassing capture and transcription
    TextSubmitted(String),
    /// First speakable utterance of a reply is ready
    UtteranceReady { turn: TurnId },
    /// Reply and playback are done
    TurnFinished { turn: TurnId, outcome: TurnOutcome },
    /// An audio device failed after opening
    DeviceFailed(Error),
    /// Graceful shutdown
    Shutdown,
}

impl From<GateEvent> for Event {
    fn from(event: GateEvent) -> Self {
        Self::Gate(event)
    }
}

impl From<WakeEvent> for Event {
    fn from(event: WakeEvent) -> Self {
        Self::Wake(event)
    }
}
