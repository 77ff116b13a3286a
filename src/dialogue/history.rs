//! Conversation history with FIFO eviction and JSON snapshots

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of messages removed each time the token ceiling is exceeded
pub const EVICTION_BATCH: usize = 2;

/// History shared between the orchestrator and the dialogue engine
pub type SharedHistory = Arc<Mutex<ConversationHistory>>;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// On-disk form of the history
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    saved_at: DateTime<Utc>,
    messages: Vec<Message>,
}

/// Ordered chat history
///
/// At most one system message exists and it always sits at index 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    /// Create a history holding only the system prompt (if any)
    #[must_use]
    pub fn new(system_prompt: Option<&str>) -> Self {
        let messages = system_prompt
            .filter(|p| !p.trim().is_empty())
            .map(|p| vec![Message::system(p)])
            .unwrap_or_default();
        Self { messages }
    }

    /// Build from existing messages, keeping only the first system message
    ///
    /// If there is none and `system_prompt` is given, it is inserted at the front.
    #[must_use]
    pub fn from_messages(messages: Vec<Message>, system_prompt: Option<&str>) -> Self {
        let mut system = None;
        let mut rest = Vec::with_capacity(messages.len());
        let mut duplicates = 0usize;

        for message in messages {
            if message.role == Role::System {
                if system.is_none() {
                    system = Some(message);
                } else {
                    duplicates += 1;
                }
            } else {
                rest.push(message);
            }
        }

        if duplicates > 0 {
            tracing::warn!(duplicates, "dropped extra system messages from history");
        }

        let system = system.or_else(|| {
            system_prompt
                .filter(|p| !p.trim().is_empty())
                .map(Message::system)
        });

        let mut messages = Vec::with_capacity(rest.len() + 1);
        messages.extend(system);
        messages.extend(rest);
        Self { messages }
    }

    /// Wrap in a mutex for sharing across tasks
    #[must_use]
    pub fn shared(self) -> SharedHistory {
        Arc::new(Mutex::new(self))
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn system(&self) -> Option<&Message> {
        self.messages.first().filter(|m| m.role == Role::System)
    }

    /// Replace (or insert) the system message
    pub fn set_system(&mut self, prompt: impl Into<String>) {
        let message = Message::system(prompt);
        if self.system().is_some() {
            self.messages[0] = message;
        } else {
            self.messages.insert(0, message);
        }
    }

    /// Append a message; a system message replaces the existing one
    pub fn push(&mut self, message: Message) {
        if message.role == Role::System {
            self.set_system(message.content);
        } else {
            self.messages.push(message);
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(Message::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(Message::assistant(content));
    }

    /// Remove up to `count` of the oldest non-system messages
    ///
    /// Returns how many were removed.
    pub fn evict_oldest(&mut self, count: usize) -> usize {
        let first = usize::from(self.system().is_some());
        let available = self.messages.len() - first;
        let removed = count.min(available);
        self.messages.drain(first..first + removed);
        removed
    }

    /// Evict one batch if `total_tokens` exceeds `ceiling`
    pub fn evict_for_usage(&mut self, total_tokens: u32, ceiling: u32) -> usize {
        if total_tokens <= ceiling {
            return 0;
        }
        let removed = self.evict_oldest(EVICTION_BATCH);
        tracing::debug!(
            total_tokens,
            ceiling,
            removed,
            remaining = self.messages.len(),
            "evicted oldest history"
        );
        removed
    }

    /// Load a snapshot, starting fresh if the file does not exist
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &Path, system_prompt: Option<&str>) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no saved history, starting fresh");
                return Ok(Self::new(system_prompt));
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_str(&content)
            .map_err(|e| Error::History(format!("{}: {e}", path.display())))?;

        let history = Self::from_messages(snapshot.messages, system_prompt);
        tracing::info!(
            path = %path.display(),
            messages = history.len(),
            saved_at = %snapshot.saved_at,
            "loaded conversation history"
        );
        Ok(history)
    }

    /// Write a snapshot, replacing any previous one
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let snapshot = Snapshot {
            saved_at: Utc::now(),
            messages: self.messages.clone(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        tracing::info!(path = %path.display(), messages = self.messages.len(), "saved conversation history");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConversationHistory {
        let mut h = ConversationHistory::new(Some("be brief"));
        h.push_user("u1");
        h.push_assistant("a1");
        h.push_user("u2");
        h.push_assistant("a2");
        h
    }

    #[test]
    fn test_eviction_keeps_system() {
        let mut h = sample();
        assert_eq!(h.evict_for_usage(700, 600), 2);
        let contents: Vec<_> = h.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["be brief", "u2", "a2"]);
    }

    #[test]
    fn test_no_eviction_under_ceiling() {
        let mut h = sample();
        assert_eq!(h.evict_for_usage(600, 600), 0);
        assert_eq!(h.len(), 5);
    }

    #[test]
    fn test_eviction_with_one_left() {
        let mut h = ConversationHistory::new(Some("sys"));
        h.push_user("only");
        assert_eq!(h.evict_for_usage(900, 600), 1);
        assert_eq!(h.len(), 1);
        assert!(h.system().is_some());
        assert_eq!(h.evict_for_usage(900, 600), 0);
    }

    #[test]
    fn test_eviction_without_system() {
        let mut h = ConversationHistory::new(None);
        h.push_user("u1");
        h.push_assistant("a1");
        h.push_user("u2");
        assert_eq!(h.evict_oldest(2), 2);
        assert_eq!(h.messages()[0].content, "u2");
    }

    #[test]
    fn test_from_messages_normalizes_system() {
        let h = ConversationHistory::from_messages(
            vec![
                Message::user("hi"),
                Message::system("first"),
                Message::system("second"),
            ],
            Some("fallback"),
        );
        assert_eq!(h.len(), 2);
        assert_eq!(h.system().unwrap().content, "first");

        let h = ConversationHistory::from_messages(vec![Message::user("hi")], Some("fallback"));
        assert_eq!(h.system().unwrap().content, "fallback");
    }

    #[test]
    fn test_push_system_replaces() {
        let mut h = sample();
        h.push(Message::system("new"));
        assert_eq!(h.len(), 5);
        assert_eq!(h.system().unwrap().content, "new");
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");

        let h = sample();
        h.save(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["saved_at"].is_string());
        assert_eq!(raw["messages"][1]["role"], "user");

        let loaded = ConversationHistory::load(&path, Some("ignored")).unwrap();
        assert_eq!(loaded, h);
    }

    #[test]
    fn test_load_missing_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let h = ConversationHistory::load(&dir.path().join("none.json"), Some("sys")).unwrap();
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_load_corrupt_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            ConversationHistory::load(&path, None),
            Err(Error::History(_))
        ));
    }
}
