//! Beacon Voice - real-time spoken conversation with a language model
//!
//! This library provides the streaming voice loop:
//! - Microphone capture and voice activity gating
//! - Wake phrases, keyboard triggers and barge-in
//! - Streaming speech-to-text, chat completion and text-to-speech
//! - A conversation state machine that keeps every stage cancellable
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌──────────┐  segments  ┌────────────────┐
//! │ AudioCapture ├───────────▶│ VAD gate ├───────────▶│                │
//! └──────────────┘            └──────────┘            │  Conversation  │
//!                                                     │  Orchestrator  │
//! ┌──────────────┐   audio    ┌──────────┐ utterances │                │
//! │ AudioOutput  │◀───────────┤ Synthesis│◀───────────┤ DialogueEngine │
//! └──────────────┘            └──────────┘            └────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod dialogue;
pub mod error;
pub mod orchestrator;
pub mod voice;

use std::time::Duration;

pub use config::Config;
pub use daemon::Daemon;
pub use error::{Error, Result};
pub use orchestrator::{ConversationOrchestrator, OrchestratorHandle, Phase};

/// Upper bound on any wait for queue data, so cancellation is observed promptly
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
