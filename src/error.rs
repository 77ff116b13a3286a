//! Error types for the Beacon voice loop

use thiserror::Error;

/// Result type alias for Beacon voice operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice loop
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone or speaker could not be opened or written
    #[error("audio device error: {0}")]
    Device(String),

    /// Generic backend failure (bad status, malformed stream payload)
    #[error("backend error: {0}")]
    Backend(String),

    /// Speech-to-text backend error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech backend error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Language model backend error
    #[error("LLM error: {0}")]
    Llm(String),

    /// Malformed audio chunk
    #[error("decode error: {0}")]
    Decode(String),

    /// A bounded wait elapsed
    #[error("timed out: {0}")]
    Timeout(String),

    /// Conversation history snapshot could not be read or written
    #[error("history error: {0}")]
    History(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether this error came from a remote backend (LLM, STT, TTS, HTTP)
    ///
    /// Backend errors end the current turn and start the cooldown.
    #[must_use]
    pub const fn is_backend(&self) -> bool {
        matches!(
            self,
            Self::Backend(_) | Self::Stt(_) | Self::Tts(_) | Self::Llm(_) | Self::Http(_)
        )
    }

    /// Whether this error is fatal to an audio stage
    #[must_use]
    pub const fn is_device(&self) -> bool {
        matches!(self, Self::Device(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Llm("503".to_string()).is_backend());
        assert!(Error::Tts("bad voice".to_string()).is_backend());
        assert!(!Error::Decode("short frame".to_string()).is_backend());
        assert!(Error::Device("no input device".to_string()).is_device());
        assert!(!Error::Timeout("silence".to_string()).is_device());
    }
}
