//! Text-to-speech (TTS) processing

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;

use super::decode::AudioEncoding;
use crate::config::TtsConfig;
use crate::{Error, Result};

/// Stream of encoded audio bytes from a synthesis backend
pub type AudioByteStream = BoxStream<'static, Result<Bytes>>;

/// TTS provider backend
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TtsProvider {
    /// `OpenAI`-compatible `/audio/speech`
    OpenAI,
    ElevenLabs,
}

impl FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "elevenlabs" | "eleven_labs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown tts provider: {other}"))),
        }
    }
}

/// Streams synthesized audio for one utterance
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesis; bytes arrive in [`Self::encoding`]
    async fn synthesize(&self, text: &str) -> Result<AudioByteStream>;

    fn encoding(&self) -> AudioEncoding;

    /// Sample rate of raw PCM output
    fn pcm_sample_rate(&self) -> u32;
}

/// Synthesizes speech from text over HTTP
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    voice: String,
    speed: f32,
    model: String,
    format: AudioEncoding,
    pcm_sample_rate: u32,
    provider: TtsProvider,
}

impl TextToSpeech {
    /// Create a synthesizer from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or the HTTP client cannot be built
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let api_key = config.api_key.clone().unwrap_or_default();
        if api_key.is_empty() {
            let hint = match config.provider {
                TtsProvider::OpenAI => "set BEACON_TTS_API_KEY or OPENAI_API_KEY",
                TtsProvider::ElevenLabs => "set BEACON_TTS_API_KEY or ELEVENLABS_API_KEY",
            };
            return Err(Error::Config(format!("TTS API key required ({hint})")));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            voice: config.voice.clone(),
            speed: config.speed,
            model: config.model.clone(),
            format: config.format,
            pcm_sample_rate: config.pcm_sample_rate,
            provider: config.provider,
        })
    }

    /// Synthesize using OpenAI TTS
    async fn synthesize_openai(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
            speed: f32,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: self.format.as_str(),
            speed: self.speed,
        };

        let response = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("OpenAI TTS error {status}: {body}")));
        }

        Ok(response)
    }

    /// Synthesize using the ElevenLabs streaming endpoint
    async fn synthesize_elevenlabs(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let output_format = match self.format {
            AudioEncoding::Mp3 => "mp3_44100_128".to_string(),
            AudioEncoding::Pcm => format!("pcm_{}", self.pcm_sample_rate),
        };
        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream?output_format={output_format}",
            self.voice
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("ElevenLabs TTS error {status}: {body}")));
        }

        Ok(response)
    }
}

#[async_trait]
impl SpeechSynthesizer for TextToSpeech {
    async fn synthesize(&self, text: &str) -> Result<AudioByteStream> {
        tracing::debug!(chars = text.chars().count(), provider = ?self.provider, "requesting speech");

        let response = match self.provider {
            TtsProvider::OpenAI => self.synthesize_openai(text).await?,
            TtsProvider::ElevenLabs => self.synthesize_elevenlabs(text).await?,
        };

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed())
    }

    fn encoding(&self) -> AudioEncoding {
        self.format
    }

    fn pcm_sample_rate(&self) -> u32 {
        self.pcm_sample_rate
    }
}

/// Synthesizer that produces no audio, for muted sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSynthesizer;

#[async_trait]
impl SpeechSynthesizer for SilentSynthesizer {
    async fn synthesize(&self, _text: &str) -> Result<AudioByteStream> {
        Ok(futures::stream::empty().boxed())
    }

    fn encoding(&self) -> AudioEncoding {
        AudioEncoding::Pcm
    }

    fn pcm_sample_rate(&self) -> u32 {
        24000
    }
}
