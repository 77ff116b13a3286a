//! Streaming chat-completion backend
//!
//! Speaks the `OpenAI`-compatible `/chat/completions` protocol with
//! `stream: true`. Server-sent event lines are reassembled across network
//! chunks before parsing.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::history::Message;
use crate::config::LlmConfig;
use crate::{Error, Result};

/// Incremental output of a chat completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatDelta {
    /// Reply text to show and speak
    Content(String),
    /// Reasoning trace from reasoning models; never spoken
    Reasoning(String),
    /// Token accounting, usually sent last
    Usage { total_tokens: u32 },
}

/// Stream of deltas; ends after the completion signal
pub type ChatStream = BoxStream<'static, Result<ChatDelta>>;

/// Language model that streams replies
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send the full ordered history and stream the reply
    async fn stream_chat(&self, messages: &[Message]) -> Result<ChatStream>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    stream_options: StreamOptions,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    total_tokens: u32,
}

/// One parsed `data:` line
#[derive(Debug, PartialEq, Eq)]
enum SseData {
    Deltas(Vec<ChatDelta>),
    Done,
}

/// `OpenAI`-compatible streaming chat client
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    max_tokens: u32,
    stop: Vec<String>,
}

impl OpenAiChat {
    /// Create a client from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the API key is missing or the HTTP client cannot be built
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config.api_key.clone().unwrap_or_default();
        if api_key.is_empty() {
            return Err(Error::Config(
                "LLM API key required (set BEACON_LLM_API_KEY or OPENAI_API_KEY)".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            top_p: config.top_p,
            frequency_penalty: config.frequency_penalty,
            max_tokens: config.max_tokens,
            stop: config.stop.clone(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatBackend for OpenAiChat {
    async fn stream_chat(&self, messages: &[Message]) -> Result<ChatStream> {
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            temperature: self.temperature,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            max_tokens: self.max_tokens,
            stop: (!self.stop.is_empty()).then_some(self.stop.as_slice()),
        };

        tracing::debug!(model = %self.model, messages = messages.len(), "sending chat request");

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Llm(format!("chat request failed {status}: {body}")));
        }

        Ok(sse_deltas(response.bytes_stream()))
    }
}

/// Turn a raw SSE byte stream into chat deltas
///
/// The stream ends at `data: [DONE]`; a transport error or malformed payload
/// is yielded as an error item.
pub fn sse_deltas<S, B, E>(bytes: S) -> ChatStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Into<Error>,
{
    let mut lines = LineBuffer::default();

    bytes
        .map(move |chunk| -> Vec<Result<SseData>> {
            match chunk {
                Ok(chunk) => lines
                    .push(chunk.as_ref())
                    .into_iter()
                    .filter_map(|line| parse_sse_line(&line).transpose())
                    .collect(),
                Err(e) => vec![Err(e.into())],
            }
        })
        .flat_map(stream::iter)
        .take_while(|item| futures::future::ready(!matches!(item, Ok(SseData::Done))))
        .flat_map(|item| {
            let deltas: Vec<Result<ChatDelta>> = match item {
                Ok(SseData::Deltas(deltas)) => deltas.into_iter().map(Ok).collect(),
                Ok(SseData::Done) => Vec::new(),
                Err(e) => vec![Err(e)],
            };
            stream::iter(deltas)
        })
        .boxed()
}

/// Splits bytes into complete lines, keeping partial UTF-8 for later
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
        }
        lines
    }
}

/// Parse one SSE line; comments, blank lines and other fields yield `None`
fn parse_sse_line(line: &str) -> Result<Option<SseData>> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(SseData::Done));
    }

    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| Error::Llm(format!("malformed stream payload: {e}")))?;

    let mut deltas = Vec::new();
    for choice in chunk.choices {
        if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
            deltas.push(ChatDelta::Reasoning(reasoning));
        }
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            deltas.push(ChatDelta::Content(content));
        }
    }
    if let Some(usage) = chunk.usage {
        deltas.push(ChatDelta::Usage {
            total_tokens: usage.total_tokens,
        });
    }

    Ok(Some(SseData::Deltas(deltas)))
}
