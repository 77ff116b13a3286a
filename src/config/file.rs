//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-voice/config.toml` as a persistent config source.
//! All fields are optional. The file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct BeaconVoiceConfigFile {
    #[serde(default)]
    pub audio: AudioFileConfig,

    #[serde(default)]
    pub vad: VadFileConfig,

    #[serde(default)]
    pub wake: WakeFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub chunking: ChunkingFileConfig,

    #[serde(default)]
    pub stt: SttFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub conversation: ConversationFileConfig,
}

/// Microphone capture settings
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub frame_ms: Option<u32>,
    pub queue_capacity: Option<usize>,
}

/// Voice activity gate settings
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub window_ms: Option<u64>,
    pub min_speech_ratio: Option<f32>,
    pub silence_timeout_ms: Option<u64>,
    pub energy_threshold: Option<f32>,
    pub max_segment_ms: Option<u64>,
    pub no_speech_timeout_ms: Option<u64>,
}

/// Wake trigger settings
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Wake phrases (e.g. "hey beacon")
    pub words: Option<Vec<String>>,

    /// Treat Enter on stdin as push-to-talk / interrupt
    pub keyboard: Option<bool>,

    /// Play a short tone when a turn opens
    pub chime: Option<bool>,
}

/// Language model settings
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub token_ceiling: Option<u32>,
    pub system_prompt: Option<String>,
    pub user_suffix: Option<String>,
    pub cooldown_ms: Option<u64>,
}

/// Utterance chunking policy
#[derive(Debug, Default, Deserialize)]
pub struct ChunkingFileConfig {
    pub min_chars: Option<usize>,

    /// Sentence-terminal characters, as one string (e.g. "。！？!?")
    pub terminators: Option<String>,
}

/// Speech-to-text settings
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// "whisper" or "deepgram"
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

/// Text-to-speech settings
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "openai" or "elevenlabs"
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,

    /// "mp3" or "pcm"
    pub format: Option<String>,
    pub speed: Option<f32>,
    pub pcm_sample_rate: Option<u32>,
    pub timeout_secs: Option<u64>,
}

/// Conversation loop settings
#[derive(Debug, Default, Deserialize)]
pub struct ConversationFileConfig {
    pub end_phrases: Option<Vec<String>>,
    pub history_path: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `BeaconVoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> BeaconVoiceConfigFile {
    let Some(path) = config_file_path() else {
        return BeaconVoiceConfigFile::default();
    };

    if !path.exists() {
        return BeaconVoiceConfigFile::default();
    }

    match load_config_file_from(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            BeaconVoiceConfigFile::default()
        }
    }
}

/// Load a TOML config file from an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn load_config_file_from(path: &Path) -> Result<BeaconVoiceConfigFile> {
    let content = std::fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/omni/beacon-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-voice")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_overlay_parses() {
        let toml = r#"
            [vad]
            silence_timeout_ms = 800

            [wake]
            words = ["hey beacon"]

            [chunking]
            terminators = "。！？"
        "#;

        let parsed: BeaconVoiceConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(parsed.vad.silence_timeout_ms, Some(800));
        assert_eq!(parsed.vad.window_ms, None);
        assert_eq!(parsed.wake.words.as_deref(), Some(&["hey beacon".to_string()][..]));
        assert_eq!(parsed.chunking.terminators.as_deref(), Some("。！？"));
        assert!(parsed.llm.model.is_none());
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[llm]\nmodel = \"deepseek-ai/DeepSeek-V3\"\n").unwrap();

        let parsed = load_config_file_from(&path).unwrap();
        assert_eq!(parsed.llm.model.as_deref(), Some("deepseek-ai/DeepSeek-V3"));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[vad\nwindow_ms = ").unwrap();

        assert!(load_config_file_from(&path).is_err());
    }
}
