//! Configuration management for the Beacon voice loop
//!
//! Values are layered: built-in defaults, then the TOML file, then environment
//! variables (API keys), then CLI flags applied by `main`.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::dialogue::ChunkPolicy;
use crate::voice::{AudioEncoding, SttProvider, TtsProvider, VadConfig};
use crate::{Error, Result};

use file::BeaconVoiceConfigFile;

/// Default LLM model
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

/// Default system prompt for spoken conversation
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a warm, friendly voice companion. \
Answer in short, natural spoken sentences. Never use lists, markdown, emoji or \
symbols, because everything you write is read aloud.";

/// Beacon voice configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Microphone capture
    pub audio: AudioConfig,

    /// Voice activity gate
    pub vad: VadConfig,

    /// Wake triggers
    pub wake: WakeConfig,

    /// Language model backend
    pub llm: LlmConfig,

    /// Utterance chunking policy
    pub chunking: ChunkPolicy,

    /// Speech-to-text backend
    pub stt: SttConfig,

    /// Text-to-speech backend
    pub tts: TtsConfig,

    /// Conversation loop
    pub conversation: ConversationConfig,

    /// Path to data directory (history snapshot)
    pub data_dir: PathBuf,
}

/// Microphone capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Analysis sample rate in Hz
    pub sample_rate: u32,

    /// Frame duration in milliseconds
    pub frame_ms: u32,

    /// Capacity of the frame queue (oldest dropped when full)
    pub queue_capacity: usize,
}

impl AudioConfig {
    /// Number of samples in one frame
    #[must_use]
    pub const fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    /// Duration of one frame
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.frame_ms))
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::voice::SAMPLE_RATE,
            frame_ms: 20,
            queue_capacity: 500,
        }
    }
}

/// Wake trigger configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Wake phrases matched against ambient transcripts
    pub words: Vec<String>,

    /// Enter on stdin acts as push-to-talk and interrupt
    pub keyboard: bool,

    /// Play an acknowledgement tone when a turn opens
    pub chime: bool,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            words: Vec::new(),
            keyboard: true,
            chime: true,
        }
    }
}

/// Language model configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// OpenAI-compatible API base URL
    pub base_url: String,

    /// API key (from `BEACON_LLM_API_KEY` or `OPENAI_API_KEY`)
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,

    pub temperature: f32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub max_tokens: u32,
    pub stop: Vec<String>,

    /// Request timeout
    pub timeout: Duration,

    /// Evict history when reported total tokens exceed this
    pub token_ceiling: u32,

    pub system_prompt: String,

    /// Appended to every user message before it is sent
    pub user_suffix: Option<String>,

    /// Refuse new turns for this long after a backend error
    pub cooldown: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: 0.7,
            top_p: 0.7,
            frequency_penalty: 0.5,
            max_tokens: 1024,
            stop: Vec::new(),
            timeout: Duration::from_secs(30),
            token_ceiling: 600,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_suffix: None,
            cooldown: Duration::from_millis(1000),
        }
    }
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub provider: SttProvider,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            provider: SttProvider::Whisper,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            api_key: None,
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProvider,
    pub base_url: String,
    pub model: String,

    /// Target voice identifier
    pub voice: String,

    /// Requested output encoding
    pub format: AudioEncoding,

    /// Speed multiplier (0.25 to 4.0)
    pub speed: f32,

    /// Sample rate of raw PCM responses
    pub pcm_sample_rate: u32,

    /// Connect and read timeout for synthesis requests
    pub timeout: Duration,

    pub api_key: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProvider::OpenAI,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            format: AudioEncoding::Mp3,
            speed: 1.0,
            pcm_sample_rate: 24000,
            timeout: Duration::from_secs(30),
            api_key: None,
        }
    }
}

/// Conversation loop configuration
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// User sentences that end the conversation
    pub end_phrases: Vec<String>,

    /// Where the history snapshot is loaded from and saved to
    pub history_path: PathBuf,
}

/// Return the data directory, creating it if needed
///
/// Uses `~/.local/share/beacon-voice/` on Linux
pub fn data_dir() -> PathBuf {
    let dir = directories::ProjectDirs::from("dev", "omni", "beacon-voice").map_or_else(
        || PathBuf::from(".beacon-voice"),
        |d| d.data_dir().to_path_buf(),
    );

    if let Err(e) = std::fs::create_dir_all(&dir) {
        tracing::warn!(
            path = %dir.display(),
            error = %e,
            "failed to create data directory"
        );
    }

    dir
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            audio: AudioConfig::default(),
            vad: VadConfig::default(),
            wake: WakeConfig::default(),
            llm: LlmConfig::default(),
            chunking: ChunkPolicy::default(),
            stt: SttConfig::default(),
            tts: TtsConfig::default(),
            conversation: ConversationConfig {
                end_phrases: vec!["结束对话".to_string(), "end conversation".to_string()],
                history_path: data_dir.join("history.json"),
            },
            data_dir,
        }
    }
}

impl Config {
    /// Load configuration from the standard file (or an explicit one) and environment
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be read, or if the
    /// resulting configuration is invalid
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let file = match path {
            Some(path) => file::load_config_file_from(path)?,
            None => file::load_config_file(),
        };

        let mut config = Self::default();
        config.apply_file(file)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a parsed config file
    ///
    /// # Errors
    ///
    /// Returns error if an enumerated value (provider, format) is unknown
    #[allow(clippy::too_many_lines)]
    pub fn apply_file(&mut self, file: BeaconVoiceConfigFile) -> Result<()> {
        let audio = file.audio;
        if let Some(v) = audio.sample_rate {
            self.audio.sample_rate = v;
        }
        if let Some(v) = audio.frame_ms {
            self.audio.frame_ms = v;
        }
        if let Some(v) = audio.queue_capacity {
            self.audio.queue_capacity = v;
        }

        let vad = file.vad;
        if let Some(v) = vad.window_ms {
            self.vad.window = Duration::from_millis(v);
        }
        if let Some(v) = vad.min_speech_ratio {
            self.vad.min_speech_ratio = v;
        }
        if let Some(v) = vad.silence_timeout_ms {
            self.vad.silence_timeout = Duration::from_millis(v);
        }
        if let Some(v) = vad.energy_threshold {
            self.vad.energy_threshold = v;
        }
        if let Some(v) = vad.max_segment_ms {
            self.vad.max_segment = Duration::from_millis(v);
        }
        if let Some(v) = vad.no_speech_timeout_ms {
            self.vad.no_speech_timeout = Duration::from_millis(v);
        }

        let wake = file.wake;
        if let Some(v) = wake.words {
            self.wake.words = v;
        }
        if let Some(v) = wake.keyboard {
            self.wake.keyboard = v;
        }
        if let Some(v) = wake.chime {
            self.wake.chime = v;
        }

        let llm = file.llm;
        if let Some(v) = llm.base_url {
            self.llm.base_url = v;
        }
        if let Some(v) = llm.model {
            self.llm.model = v;
        }
        if let Some(v) = llm.temperature {
            self.llm.temperature = v;
        }
        if let Some(v) = llm.top_p {
            self.llm.top_p = v;
        }
        if let Some(v) = llm.frequency_penalty {
            self.llm.frequency_penalty = v;
        }
        if let Some(v) = llm.max_tokens {
            self.llm.max_tokens = v;
        }
        if let Some(v) = llm.stop {
            self.llm.stop = v;
        }
        if let Some(v) = llm.timeout_secs {
            self.llm.timeout = Duration::from_secs(v);
        }
        if let Some(v) = llm.token_ceiling {
            self.llm.token_ceiling = v;
        }
        if let Some(v) = llm.system_prompt {
            self.llm.system_prompt = v;
        }
        if let Some(v) = llm.user_suffix {
            self.llm.user_suffix = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = llm.cooldown_ms {
            self.llm.cooldown = Duration::from_millis(v);
        }

        let chunking = file.chunking;
        if let Some(v) = chunking.min_chars {
            self.chunking.min_chars = v;
        }
        if let Some(v) = chunking.terminators {
            self.chunking.terminators = v.chars().collect();
        }

        let stt = file.stt;
        if let Some(v) = stt.provider {
            self.stt.provider = v.parse()?;
        }
        if let Some(v) = stt.base_url {
            self.stt.base_url = v;
        }
        if let Some(v) = stt.model {
            self.stt.model = v;
        }

        let tts = file.tts;
        if let Some(v) = tts.provider {
            self.tts.provider = v.parse()?;
        }
        if let Some(v) = tts.base_url {
            self.tts.base_url = v;
        }
        if let Some(v) = tts.model {
            self.tts.model = v;
        }
        if let Some(v) = tts.voice {
            self.tts.voice = v;
        }
        if let Some(v) = tts.format {
            self.tts.format = v.parse()?;
        }
        if let Some(v) = tts.speed {
            self.tts.speed = v;
        }
        if let Some(v) = tts.timeout_secs {
            self.tts.timeout = Duration::from_secs(v);
        }
        if let Some(v) = tts.pcm_sample_rate {
            self.tts.pcm_sample_rate = v;
        }

        let conversation = file.conversation;
        if let Some(v) = conversation.end_phrases {
            self.conversation.end_phrases = v;
        }
        if let Some(v) = conversation.history_path {
            self.conversation.history_path = PathBuf::from(v);
        }

        Ok(())
    }

    /// Load API keys from environment
    pub fn apply_env(&mut self) {
        let openai = std::env::var("OPENAI_API_KEY").ok();

        self.llm.api_key = std::env::var("BEACON_LLM_API_KEY")
            .ok()
            .or_else(|| openai.clone());

        let stt_fallback = match self.stt.provider {
            SttProvider::Whisper => openai.clone(),
            SttProvider::Deepgram => std::env::var("DEEPGRAM_API_KEY").ok(),
        };
        self.stt.api_key = std::env::var("BEACON_STT_API_KEY").ok().or(stt_fallback);

        let tts_fallback = match self.tts.provider {
            TtsProvider::OpenAI => openai,
            TtsProvider::ElevenLabs => std::env::var("ELEVENLABS_API_KEY").ok(),
        };
        self.tts.api_key = std::env::var("BEACON_TTS_API_KEY").ok().or(tts_fallback);

        if let Ok(model) = std::env::var("BEACON_LLM_MODEL") {
            self.llm.model = model;
        }
    }

    /// Check that values are usable
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 || self.audio.frame_samples() == 0 {
            return Err(Error::Config(
                "audio.sample_rate and audio.frame_ms must be positive".to_string(),
            ));
        }
        if self.audio.queue_capacity == 0 {
            return Err(Error::Config("audio.queue_capacity must be positive".to_string()));
        }
        if !(self.vad.min_speech_ratio > 0.0 && self.vad.min_speech_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "vad.min_speech_ratio must be in (0, 1], got {}",
                self.vad.min_speech_ratio
            )));
        }
        if self.vad.window < self.audio.frame_duration() {
            return Err(Error::Config(
                "vad.window_ms must cover at least one frame".to_string(),
            ));
        }
        if self.vad.max_segment < self.vad.window {
            return Err(Error::Config(
                "vad.max_segment_ms must be at least vad.window_ms".to_string(),
            ));
        }
        if self.vad.silence_timeout.is_zero() {
            return Err(Error::Config("vad.silence_timeout_ms must be positive".to_string()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(Error::Config("llm.model must not be empty".to_string()));
        }
        if self.chunking.terminators.is_empty() {
            return Err(Error::Config("chunking.terminators must not be empty".to_string()));
        }
        if self.tts.timeout.is_zero() {
            return Err(Error::Config("tts.timeout_secs must be positive".to_string()));
        }
        if !(0.25..=4.0).contains(&self.tts.speed) {
            return Err(Error::Config(format!(
                "tts.speed must be between 0.25 and 4.0, got {}",
                self.tts.speed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay(toml: &str) -> Result<Config> {
        let file: BeaconVoiceConfigFile = toml::from_str(toml)?;
        let mut config = Config::default();
        config.apply_file(file)?;
        Ok(config)
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.audio.frame_samples(), 320);
        assert_eq!(config.vad.window, Duration::from_millis(500));
        assert_eq!(config.llm.token_ceiling, 600);
        assert!(config.conversation.end_phrases.contains(&"结束对话".to_string()));
    }

    #[test]
    fn test_file_overlay() {
        let config = overlay(
            r#"
            [vad]
            min_speech_ratio = 0.5
            [tts]
            provider = "elevenlabs"
            format = "pcm"
            timeout_secs = 12
            [llm]
            user_suffix = ""
            "#,
        )
        .unwrap();

        assert!((config.vad.min_speech_ratio - 0.5).abs() < f32::EPSILON);
        assert_eq!(config.tts.provider, TtsProvider::ElevenLabs);
        assert_eq!(config.tts.format, AudioEncoding::Pcm);
        assert_eq!(config.tts.timeout, Duration::from_secs(12));
        assert!(config.llm.user_suffix.is_none());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(overlay("[stt]\nprovider = \"vosk\"\n").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut config = Config::default();
        config.vad.min_speech_ratio = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_window_shorter_than_frame() {
        let mut config = Config::default();
        config.vad.window = Duration::from_millis(5);
        assert!(config.validate().is_err());
    }
}
