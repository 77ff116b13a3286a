//! Dialogue: history, language model streaming and sentence buffering

mod chunker;
mod engine;
mod history;
mod llm;

pub use chunker::{ChunkPolicy, DEFAULT_TERMINATORS, Utterance, UtteranceChunker};
pub use engine::{DialogueEngine, INTERRUPTED_REPLY, ReplyEnd, ReplyEvent};
pub use history::{ConversationHistory, EVICTION_BATCH, Message, Role, SharedHistory};
pub use llm::{ChatBackend, ChatDelta, ChatStream, OpenAiChat, sse_deltas};
