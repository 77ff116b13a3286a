//! Shared conversation state
//!
//! Only the orchestrator mutates it; stages and observers read it.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

/// Conversation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
}

impl Phase {
    /// Whether an assistant reply is in flight
    #[must_use]
    pub const fn is_replying(self) -> bool {
        matches!(self, Self::Thinking | Self::Speaking)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Point-in-time copy of the state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub interrupted: bool,
    pub shutdown_requested: bool,
}

/// Mutex-guarded conversation state with change notification
#[derive(Debug)]
pub struct ConversationState {
    inner: Mutex<StateSnapshot>,
    changes: watch::Sender<StateSnapshot>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationState {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(StateSnapshot::default());
        Self {
            inner: Mutex::new(StateSnapshot::default()),
            changes,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.snapshot().phase
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.snapshot().interrupted
    }

    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.snapshot().shutdown_requested
    }

    /// Receive every change to the state
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.changes.subscribe()
    }

    /// Wait until the phase equals `phase`, up to `timeout`
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for(&self, phase: Phase, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|s| s.phase == phase))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Move to `phase`, returning the previous phase
    pub(crate) fn transition(&self, phase: Phase) -> Phase {
        let previous = self.update(|s| {
            let previous = s.phase;
            s.phase = phase;
            previous
        });
        if previous != phase {
            tracing::debug!(from = %previous, to = %phase, "state transition");
        }
        previous
    }

    /// Raise the interrupt flag if a reply is in flight
    pub(crate) fn raise_interrupt(&self) -> bool {
        self.update(|s| {
            if s.phase.is_replying() {
                s.interrupted = true;
            }
            s.interrupted
        })
    }

    pub(crate) fn clear_interrupt(&self) {
        self.update(|s| s.interrupted = false);
    }

    pub(crate) fn request_shutdown(&self) {
        self.update(|s| s.shutdown_requested = true);
    }

    fn update<R>(&self, f: impl FnOnce(&mut StateSnapshot) -> R) -> R {
        let (result, snapshot) = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let result = f(&mut inner);
            (result, *inner)
        };
        self.changes.send_replace(snapshot);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_only_while_replying() {
        let state = ConversationState::new();
        assert!(!state.raise_interrupt());

        state.transition(Phase::Speaking);
        assert!(state.raise_interrupt());
        assert!(state.is_interrupted());

        state.clear_interrupt();
        assert!(!state.is_interrupted());
    }

    #[tokio::test]
    async fn test_wait_for_phase() {
        let state = std::sync::Arc::new(ConversationState::new());
        let writer = std::sync::Arc::clone(&state);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.transition(Phase::Listening);
        });

        assert!(state.wait_for(Phase::Listening, Duration::from_secs(2)).await);
        assert!(!state.wait_for(Phase::Speaking, Duration::from_millis(20)).await);
    }
}
