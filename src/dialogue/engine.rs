//! Dialogue engine
//!
//! Submits user text to the chat backend and streams the reply back as
//! utterances followed by exactly one end marker, whatever happens to the
//! request.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::chunker::{ChunkPolicy, Utterance, UtteranceChunker};
use super::history::{ConversationHistory, SharedHistory};
use super::llm::{ChatBackend, ChatDelta};
use crate::Error;

/// Utterances buffered between the engine and its consumer
const REPLY_CHANNEL_CAPACITY: usize = 32;

/// How long a new submit waits for the previous reply task to wind down
const PREVIOUS_REPLY_GRACE: Duration = Duration::from_secs(1);

/// Assistant entry stored when a reply is interrupted before any text arrived
pub const INTERRUPTED_REPLY: &str = "(interrupted)";

/// Output of a submitted turn
#[derive(Debug)]
pub enum ReplyEvent {
    Utterance(Utterance),
    /// Always the last event of a reply
    End(ReplyEnd),
}

/// Summary carried by the end marker
#[derive(Debug, Default)]
pub struct ReplyEnd {
    /// Reply text generated before the stream ended
    pub text: String,
    /// Utterances emitted
    pub utterances: usize,
    /// Total tokens reported by the backend
    pub total_tokens: Option<u32>,
    pub cancelled: bool,
    pub error: Option<Error>,
}

impl ReplyEnd {
    /// Whether anything worth speaking was produced
    #[must_use]
    pub fn has_speech(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Maintains history and streams replies from a chat backend
pub struct DialogueEngine {
    backend: Arc<dyn ChatBackend>,
    history: SharedHistory,
    policy: ChunkPolicy,
    token_ceiling: u32,
    user_suffix: Option<String>,
    active: Mutex<Option<JoinHandle<()>>>,
}

impl DialogueEngine {
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        history: SharedHistory,
        policy: ChunkPolicy,
        token_ceiling: u32,
    ) -> Self {
        Self {
            backend,
            history,
            policy,
            token_ceiling,
            user_suffix: None,
            active: Mutex::new(None),
        }
    }

    /// Text appended to every user message before it is sent
    #[must_use]
    pub fn with_user_suffix(mut self, suffix: Option<String>) -> Self {
        self.user_suffix = suffix.filter(|s| !s.is_empty());
        self
    }

    #[must_use]
    pub const fn history(&self) -> &SharedHistory {
        &self.history
    }

    /// Copy of the current history
    #[must_use]
    pub fn snapshot(&self) -> ConversationHistory {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submit user text and stream the reply
    ///
    /// The previous reply task (normally already cancelled) is given a short
    /// grace period to record its partial reply, so history stays in
    /// user/assistant order.
    pub async fn submit(
        &self,
        turn: u64,
        user_text: &str,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ReplyEvent> {
        self.settle_previous(turn).await;

        let content = match &self.user_suffix {
            Some(suffix) => format!("{user_text}{suffix}"),
            None => user_text.to_string(),
        };

        let messages = {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_user(content);
            history.messages().to_vec()
        };

        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        let task = ReplyTask {
            turn,
            backend: Arc::clone(&self.backend),
            history: Arc::clone(&self.history),
            chunker: UtteranceChunker::new(self.policy.clone()),
            token_ceiling: self.token_ceiling,
            tx,
            cancel,
        };

        let handle = tokio::spawn(task.run(messages));
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        rx
    }

    async fn settle_previous(&self, turn: u64) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut handle) = previous else { return };

        if tokio::time::timeout(PREVIOUS_REPLY_GRACE, &mut handle)
            .await
            .is_err()
        {
            tracing::warn!(turn, "previous reply still running, aborting it");
            handle.abort();
        }
    }
}

struct ReplyTask {
    turn: u64,
    backend: Arc<dyn ChatBackend>,
    history: SharedHistory,
    chunker: UtteranceChunker,
    token_ceiling: u32,
    tx: mpsc::Sender<ReplyEvent>,
    cancel: CancellationToken,
}

impl ReplyTask {
    async fn run(mut self, messages: Vec<super::history::Message>) {
        let mut end = ReplyEnd::default();
        self.stream(&messages, &mut end).await;
        end.utterances = self.chunker.emitted();

        self.record(&end);

        if let Some(e) = &end.error {
            tracing::error!(turn = self.turn, stage = "dialogue", error = %e, "reply stream failed");
        } else {
            tracing::debug!(
                turn = self.turn,
                chars = end.text.chars().count(),
                utterances = end.utterances,
                total_tokens = ?end.total_tokens,
                cancelled = end.cancelled,
                "reply finished"
            );
        }

        // Receiver may already be gone after an interrupt
        let _ = self.tx.send(ReplyEvent::End(end)).await;
    }

    async fn stream(&mut self, messages: &[super::history::Message], end: &mut ReplyEnd) {
        let request = tokio::select! {
            () = self.cancel.cancelled() => {
                end.cancelled = true;
                return;
            }
            r = self.backend.stream_chat(messages) => r,
        };
        let mut stream = match request {
            Ok(stream) => stream,
            Err(e) => {
                end.error = Some(e);
                return;
            }
        };

        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => {
                    end.cancelled = true;
                    return;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(ChatDelta::Content(text))) => {
                    end.text.push_str(&text);
                    if let Some(utterance) = self.chunker.push(&text) {
                        if !self.emit(utterance).await {
                            end.cancelled = true;
                            return;
                        }
                    }
                }
                Some(Ok(ChatDelta::Reasoning(text))) => {
                    tracing::trace!(turn = self.turn, reasoning = %text, "reasoning delta");
                }
                Some(Ok(ChatDelta::Usage { total_tokens })) => {
                    end.total_tokens = Some(total_tokens);
                }
                Some(Err(e)) => {
                    end.error = Some(e);
                    break;
                }
                None => break,
            }
        }

        // Flush the tail even after an error so nothing generated is lost
        if let Some(utterance) = self.chunker.finish() {
            if !self.emit(utterance).await {
                end.cancelled = true;
            }
        }
    }

    /// Forward an utterance, waiting for room; false if cancelled
    async fn emit(&self, utterance: Utterance) -> bool {
        tracing::debug!(turn = self.turn, index = utterance.index, text = %utterance.text, "utterance ready");
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(ReplyEvent::Utterance(utterance)) => sent.is_ok(),
        }
    }

    fn record(&self, end: &ReplyEnd) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if !end.text.is_empty() {
            history.push_assistant(end.text.clone());
        } else if end.cancelled {
            // Keeps user/assistant alternation for the next request
            history.push_assistant(INTERRUPTED_REPLY);
        }
        if let Some(total_tokens) = end.total_tokens {
            history.evict_for_usage(total_tokens, self.token_ceiling);
        }
    }
}
