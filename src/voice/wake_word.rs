//! Wake triggers
//!
//! [`WakeSignal`] is a single-shot gate: once it fires it stays quiet until
//! re-armed. It only reports that a trigger happened; deciding whether that
//! starts a turn or interrupts one is up to the orchestrator.
//! [`WakeWordMatcher`] finds wake phrases in ambient transcripts.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

/// Where a wake trigger came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    /// Wake phrase heard in ambient speech
    Phrase,
    /// Enter pressed on the terminal
    Keyboard,
}

impl fmt::Display for WakeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phrase => write!(f, "phrase"),
            Self::Keyboard => write!(f, "keyboard"),
        }
    }
}

/// A trigger reported by the wake signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeEvent {
    pub source: WakeSource,
    /// Speech following the wake phrase, if any
    pub command: Option<String>,
}

/// Single-shot wake trigger
pub struct WakeSignal<E> {
    armed: AtomicBool,
    tx: mpsc::Sender<E>,
}

impl<E: From<WakeEvent>> WakeSignal<E> {
    /// Create an armed signal that reports on `tx`
    #[must_use]
    pub const fn new(tx: mpsc::Sender<E>) -> Self {
        Self {
            armed: AtomicBool::new(true),
            tx,
        }
    }

    /// Fire the trigger if armed, disarming it
    ///
    /// Returns `true` if the event was reported.
    pub fn trigger(&self, source: WakeSource, command: Option<String>) -> bool {
        if self
            .armed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::trace!(%source, "wake trigger ignored while disarmed");
            return false;
        }

        tracing::info!(%source, has_command = command.is_some(), "wake triggered");
        if self.tx.try_send(WakeEvent { source, command }.into()).is_err() {
            tracing::warn!(%source, "event queue full, wake dropped");
            self.arm();
            return false;
        }
        true
    }

    /// Allow the next trigger through
    pub fn arm(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

/// Wake phrase found in a transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeMatch {
    pub wake_word: String,
    /// Trailing request, if the user kept talking after the wake phrase
    pub command: Option<String>,
}

/// Detects wake phrases in transcripts
#[derive(Debug, Clone)]
pub struct WakeWordMatcher {
    wake_words: Vec<String>,
}

impl WakeWordMatcher {
    /// Create a matcher for the given phrases (e.g., "hey beacon")
    #[must_use]
    pub fn new(wake_words: Vec<String>) -> Self {
        let normalized: Vec<String> = wake_words
            .into_iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        tracing::debug!(wake_words = ?normalized, "wake word matcher initialized");

        Self {
            wake_words: normalized,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wake_words.is_empty()
    }

    #[must_use]
    pub fn wake_words(&self) -> &[String] {
        &self.wake_words
    }

    /// Check if a transcript contains a wake phrase
    #[must_use]
    pub fn detect(&self, transcript: &str) -> Option<WakeMatch> {
        let folded = transcript.to_ascii_lowercase();

        self.wake_words.iter().find_map(|wake_word| {
            let needle = wake_word.to_ascii_lowercase();
            let pos = folded.find(&needle)?;
            tracing::info!(wake_word, transcript, "wake word detected");

            let rest = transcript[pos + needle.len()..]
                .trim_start_matches(|c: char| c.is_whitespace() || is_separator(c))
                .trim_end();
            Some(WakeMatch {
                wake_word: wake_word.clone(),
                command: (!rest.is_empty()).then(|| rest.to_string()),
            })
        })
    }
}

fn is_separator(c: char) -> bool {
    matches!(c, ',' | '.' | '!' | '?' | '，' | '。' | '！' | '？' | '、')
}
