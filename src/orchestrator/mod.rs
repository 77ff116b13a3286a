//! Conversation orchestrator
//!
//! A single event loop owns the conversation state and decides every
//! transition. Stages report through typed [`Event`]s and never change the
//! state themselves.
//!
//! ```text
//!   IDLE ──wake──▶ LISTENING ──text──▶ THINKING ──utterance──▶ SPEAKING
//!    ▲               │ empty / timeout      │ nothing spoken       │ done
//!    └───────────────┴──────────────────────┴──────────────────────┘
//!
//!   THINKING / SPEAKING ──interrupt──▶ LISTENING
//! ```

mod events;
mod state;
mod turn;

pub use events::{Event, TranscriptPurpose, TurnId, TurnOutcome, TurnOutput};
pub use state::{ConversationState, Phase, StateSnapshot};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dialogue::DialogueEngine;
use crate::voice::{
    GateEvent, SpeechSegment, SpeechSynthesisStage, Transcriber, WakeEvent, WakeSignal,
    WakeSource, WakeWordMatcher, chime,
};
use crate::{Error, POLL_INTERVAL, Result};

use turn::TurnContext;

/// Capacity of the orchestrator event queue
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Sample rate the acknowledgement chime is generated at
const CHIME_SAMPLE_RATE: u32 = 24000;

/// How long shutdown waits for the active reply task
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// User sentences that end the conversation
    pub end_phrases: Vec<String>,

    /// Refuse new turns for this long after a backend error
    pub cooldown: Duration,

    /// End a listening turn if no speech starts within this time
    pub no_speech_timeout: Duration,

    /// Upper bound on a single transcription
    pub transcribe_timeout: Duration,

    /// Play a tone when a wake event opens a turn
    pub chime: bool,

    /// Where history is written at shutdown
    pub history_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            end_phrases: vec!["结束对话".to_string()],
            cooldown: Duration::from_millis(1000),
            no_speech_timeout: Duration::from_secs(5),
            transcribe_timeout: Duration::from_secs(30),
            chime: false,
            history_path: None,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            end_phrases: config.conversation.end_phrases.clone(),
            cooldown: config.llm.cooldown,
            no_speech_timeout: config.vad.no_speech_timeout,
            transcribe_timeout: config.llm.timeout,
            chime: config.wake.chime,
            history_path: Some(config.conversation.history_path.clone()),
        }
    }
}

/// Stages the orchestrator drives
pub struct Collaborators {
    /// Absent when input is typed
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub dialogue: Arc<DialogueEngine>,
    pub synthesis: SpeechSynthesisStage,
    pub wake_words: WakeWordMatcher,
    /// Mirror of assistant output, for consoles
    pub output: Option<mpsc::UnboundedSender<TurnOutput>>,
}

/// How the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Replies started
    pub turns: u64,
    /// Ended by the user saying an end phrase
    pub ended_by_user: bool,
}

/// Cloneable control surface for a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    events: mpsc::Sender<Event>,
    state: Arc<ConversationState>,
    wake: Arc<WakeSignal<Event>>,
}

impl OrchestratorHandle {
    /// Sender for stage events (gate, device errors)
    #[must_use]
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.events.clone()
    }

    #[must_use]
    pub fn state(&self) -> &Arc<ConversationState> {
        &self.state
    }

    /// The wake signal, for trigger sources such as the keyboard
    #[must_use]
    pub fn wake(&self) -> &Arc<WakeSignal<Event>> {
        &self.wake
    }

    /// Request a barge-in (or push-to-talk when idle)
    pub async fn interrupt(&self) {
        let _ = self.events.send(Event::InterruptRequested).await;
    }

    /// Submit typed user input
    pub async fn submit_text(&self, text: impl Into<String>) {
        let _ = self.events.send(Event::TextSubmitted(text.into())).await;
    }

    /// Request graceful shutdown
    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }
}

struct ActiveTurn {
    id: TurnId,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Listening-phase bookkeeping
#[derive(Default)]
struct Listening {
    since: Option<Instant>,
    speech_started: bool,
    transcribing: bool,
}

/// Drives the conversation state machine
pub struct ConversationOrchestrator {
    config: OrchestratorConfig,
    state: Arc<ConversationState>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    wake: Arc<WakeSignal<Event>>,
    transcriber: Option<Arc<dyn Transcriber>>,
    dialogue: Arc<DialogueEngine>,
    synthesis: SpeechSynthesisStage,
    wake_words: WakeWordMatcher,
    output: Option<mpsc::UnboundedSender<TurnOutput>>,
    shutdown: CancellationToken,
    current: Option<ActiveTurn>,
    listening: Listening,
    wake_transcribing: bool,
    cooldown_until: Option<Instant>,
    next_turn: u64,
    summary: RunSummary,
}

impl ConversationOrchestrator {
    #[must_use]
    pub fn new(config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let wake = Arc::new(WakeSignal::new(events_tx.clone()));

        Self {
            config,
            state: Arc::new(ConversationState::new()),
            events_tx,
            events_rx,
            wake,
            transcriber: collaborators.transcriber,
            dialogue: collaborators.dialogue,
            synthesis: collaborators.synthesis,
            wake_words: collaborators.wake_words,
            output: collaborators.output,
            shutdown: CancellationToken::new(),
            current: None,
            listening: Listening::default(),
            wake_transcribing: false,
            cooldown_until: None,
            next_turn: 1,
            summary: RunSummary::default(),
        }
    }

    #[must_use]
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            events: self.events_tx.clone(),
            state: Arc::clone(&self.state),
            wake: Arc::clone(&self.wake),
        }
    }

    #[must_use]
    pub fn state(&self) -> &Arc<ConversationState> {
        &self.state
    }

    /// Token cancelled when the loop exits; stage tasks can select on it
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown or an end phrase, then persist history
    ///
    /// # Errors
    ///
    /// Returns error if the history snapshot cannot be written
    pub async fn run(mut self) -> Result<RunSummary> {
        tracing::info!(
            wake_words = ?self.wake_words.wake_words(),
            "conversation loop started"
        );

        while !self.state.is_shutdown_requested() {
            match tokio::time::timeout(POLL_INTERVAL, self.events_rx.recv()).await {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => break,
                Err(_) => {}
            }
            self.check_deadlines();
        }

        self.finish().await
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Wake(wake) => self.on_wake(wake),
            Event::InterruptRequested => self.on_interrupt_requested(),
            Event::Gate(GateEvent::SpeechStarted { at }) => {
                if self.state.phase() == Phase::Listening {
                    tracing::debug!(at_ms = at.as_millis(), "user started speaking");
                    self.listening.speech_started = true;
                }
            }
            Event::Gate(GateEvent::SegmentClosed(segment)) => self.on_segment(segment),
            Event::Transcribed {
                turn,
                purpose,
                result,
            } => match purpose {
                TranscriptPurpose::Request => self.on_request_transcript(turn, result),
                TranscriptPurpose::Wake => self.on_wake_transcript(result),
            },
            Event::TextSubmitted(text) => self.on_text(text),
            Event::UtteranceReady { turn } => {
                if self.is_current(turn) && self.state.phase() == Phase::Thinking {
                    self.enter(Phase::Speaking);
                }
            }
            Event::TurnFinished { turn, outcome } => self.on_turn_finished(turn, &outcome),
            Event::DeviceFailed(e) => {
                tracing::error!(stage = "device", error = %e, "audio device failed");
            }
            Event::Shutdown => {
                tracing::info!("shutdown requested");
                self.state.request_shutdown();
            }
        }
    }

    fn on_wake(&mut self, wake: WakeEvent) {
        let phase = self.state.phase();
        tracing::debug!(source = %wake.source, %phase, "wake event");

        match phase {
            Phase::Idle => {
                if self.cooling_down() {
                    self.wake.arm();
                    return;
                }
                match wake.command {
                    Some(command) => {
                        let turn = self.open_turn();
                        self.begin_reply(turn, command);
                    }
                    None => self.start_listening(true),
                }
            }
            Phase::Thinking | Phase::Speaking => {
                self.interrupt();
                if let Some(command) = wake.command {
                    if let Some(turn) = self.current.as_ref().map(|t| t.id) {
                        self.begin_reply(turn, command);
                    }
                }
            }
            Phase::Listening => {
                tracing::trace!("wake ignored while listening");
            }
        }
    }

    fn on_interrupt_requested(&mut self) {
        match self.state.phase() {
            Phase::Thinking | Phase::Speaking => self.interrupt(),
            Phase::Idle => {
                // Push-to-talk
                self.on_wake(WakeEvent {
                    source: WakeSource::Keyboard,
                    command: None,
                });
            }
            Phase::Listening => tracing::debug!("interrupt ignored while listening"),
        }
    }

    /// Barge-in: stop the reply and listen again
    fn interrupt(&mut self) {
        if !self.state.raise_interrupt() {
            return;
        }

        let turn = self.current.as_ref().map(|t| t.id);
        tracing::info!(turn = ?turn, "interrupted");

        if let Some(active) = &self.current {
            active.cancel.cancel();
        }
        self.synthesis.sink().stop_immediately();
        self.state.clear_interrupt();

        self.start_listening(false);
    }

    fn on_segment(&mut self, segment: SpeechSegment) {
        if self.transcriber.is_none() {
            return;
        }
        match self.state.phase() {
            Phase::Listening => {
                if self.listening.transcribing {
                    tracing::debug!("segment dropped, transcription already running");
                    return;
                }
                let Some(turn) = self.current.as_ref().map(|t| t.id) else {
                    return;
                };
                self.listening.transcribing = true;
                self.listening.speech_started = true;
                self.spawn_transcription(Some(turn), TranscriptPurpose::Request, segment);
            }
            Phase::Idle | Phase::Thinking | Phase::Speaking => {
                if self.wake_words.is_empty() || !self.wake.is_armed() || self.wake_transcribing {
                    return;
                }
                self.wake_transcribing = true;
                self.spawn_transcription(None, TranscriptPurpose::Wake, segment);
            }
        }
    }

    fn on_request_transcript(&mut self, turn: Option<TurnId>, result: Result<String>) {
        if turn.is_none_or(|t| !self.is_current(t)) || self.state.phase() != Phase::Listening {
            tracing::debug!(turn = ?turn, "stale transcript dropped");
            return;
        }
        self.listening.transcribing = false;

        let text = match result {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(turn = ?turn, stage = "transcription", error = %e, "transcription failed");
                self.note_error(&e);
                self.end_turn();
                return;
            }
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            tracing::info!(turn = ?turn, "nothing recognized");
            self.end_turn();
            return;
        }

        tracing::info!(turn = ?turn, transcript = %text, "user said");

        if self.is_end_phrase(&text) {
            self.end_conversation();
            return;
        }

        if let Some(turn) = turn {
            self.begin_reply(turn, text);
        }
    }

    fn on_wake_transcript(&mut self, result: Result<String>) {
        self.wake_transcribing = false;
        let text = match result {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(stage = "wake", error = %e, "ambient transcription failed");
                return;
            }
        };

        if self.state.phase() == Phase::Listening {
            return;
        }
        if let Some(hit) = self.wake_words.detect(&text) {
            self.wake.trigger(WakeSource::Phrase, hit.command);
        }
    }

    fn on_text(&mut self, text: String) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.is_end_phrase(&text) {
            self.end_conversation();
            return;
        }

        match self.state.phase() {
            Phase::Thinking | Phase::Speaking => self.interrupt(),
            Phase::Idle if self.cooling_down() => return,
            Phase::Idle => {
                let turn = self.open_turn();
                self.begin_reply(turn, text);
                return;
            }
            Phase::Listening => {}
        }

        // Now listening, either interrupted or already waiting for speech
        if let Some(turn) = self.current.as_ref().map(|t| t.id) {
            self.listening.transcribing = false;
            self.begin_reply(turn, text);
        }
    }

    fn on_turn_finished(&mut self, turn: TurnId, outcome: &TurnOutcome) {
        if !self.is_current(turn) {
            tracing::trace!(%turn, "finished event for old turn");
            return;
        }

        if let Some(e) = outcome.error() {
            tracing::warn!(%turn, error = %e, "turn ended with error");
            self.note_error(e);
        }
        if outcome.reply.as_ref().is_some_and(|r| !r.has_speech()) {
            tracing::info!(%turn, "reply was empty");
        }

        self.end_turn();
    }

    fn check_deadlines(&mut self) {
        if self.state.phase() != Phase::Listening
            || self.listening.speech_started
            || self.listening.transcribing
        {
            return;
        }
        let expired = self
            .listening
            .since
            .is_some_and(|since| since.elapsed() >= self.config.no_speech_timeout);
        if expired {
            tracing::info!("no speech heard, going idle");
            self.end_turn();
        }
    }

    /// Allocate a turn with a fresh cancellation token
    fn open_turn(&mut self) -> TurnId {
        let id = TurnId(self.next_turn);
        self.next_turn += 1;
        self.current = Some(ActiveTurn {
            id,
            cancel: self.shutdown.child_token(),
            task: None,
        });
        id
    }

    fn start_listening(&mut self, acknowledge: bool) {
        let turn = self.open_turn();
        self.listening = Listening {
            since: Some(Instant::now()),
            ..Listening::default()
        };
        self.enter(Phase::Listening);
        tracing::info!(%turn, "listening");

        if acknowledge && self.config.chime {
            self.play_chime();
        }
    }

    fn begin_reply(&mut self, turn: TurnId, text: String) {
        let Some(active) = self.current.as_mut().filter(|t| t.id == turn) else {
            return;
        };

        let ctx = TurnContext {
            turn,
            text,
            dialogue: Arc::clone(&self.dialogue),
            synthesis: self.synthesis.clone(),
            cancel: active.cancel.clone(),
            events: self.events_tx.clone(),
            output: self.output.clone(),
        };
        active.task = Some(turn::spawn_reply(ctx));
        self.summary.turns += 1;

        self.enter(Phase::Thinking);
    }

    fn end_turn(&mut self) {
        if let Some(active) = self.current.take() {
            active.cancel.cancel();
        }
        self.listening = Listening::default();
        self.enter(Phase::Idle);
    }

    fn end_conversation(&mut self) {
        tracing::info!("end phrase heard, ending conversation");
        self.summary.ended_by_user = true;
        if let Some(active) = &self.current {
            active.cancel.cancel();
        }
        self.synthesis.sink().stop_immediately();
        self.state.request_shutdown();
    }

    /// Set the phase and the wake arming that goes with it
    fn enter(&self, phase: Phase) {
        self.state.transition(phase);
        match phase {
            Phase::Idle | Phase::Thinking => self.wake.arm(),
            Phase::Listening => self.wake.disarm(),
            Phase::Speaking => {}
        }
    }

    fn note_error(&mut self, error: &Error) {
        if error.is_backend() && !self.config.cooldown.is_zero() {
            tracing::debug!(cooldown_ms = self.config.cooldown.as_millis(), "backend cooldown started");
            self.cooldown_until = Some(Instant::now() + self.config.cooldown);
        }
    }

    fn cooling_down(&mut self) -> bool {
        match self.cooldown_until {
            Some(until) if Instant::now() < until => {
                tracing::info!("backend cooling down, turn refused");
                true
            }
            Some(_) => {
                self.cooldown_until = None;
                false
            }
            None => false,
        }
    }

    fn is_current(&self, turn: TurnId) -> bool {
        self.current.as_ref().is_some_and(|t| t.id == turn)
    }

    fn is_end_phrase(&self, text: &str) -> bool {
        let said = normalize_phrase(text);
        !said.is_empty()
            && self
                .config
                .end_phrases
                .iter()
                .any(|p| normalize_phrase(p) == said)
    }

    fn spawn_transcription(
        &self,
        turn: Option<TurnId>,
        purpose: TranscriptPurpose,
        segment: SpeechSegment,
    ) {
        let Some(transcriber) = self.transcriber.clone() else {
            return;
        };
        let events = self.events_tx.clone();
        let limit = self.config.transcribe_timeout;

        tracing::debug!(
            turn = ?turn,
            ?purpose,
            audio_ms = segment.audio_duration().as_millis(),
            "transcribing segment"
        );

        tokio::spawn(async move {
            let result = tokio::time::timeout(limit, transcriber.transcribe(&segment))
                .await
                .unwrap_or_else(|_| Err(Error::Timeout("transcription".to_string())));
            let _ = events
                .send(Event::Transcribed {
                    turn,
                    purpose,
                    result,
                })
                .await;
        });
    }

    fn play_chime(&self) {
        let sink = Arc::clone(self.synthesis.sink());
        tokio::spawn(async move {
            let session = sink.session();
            let tone = chime(CHIME_SAMPLE_RATE);
            match sink.play(session, &tone, CHIME_SAMPLE_RATE).await {
                Ok(true) => {
                    let _ = sink.drain(session).await;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(stage = "playback", error = %e, "chime failed"),
            }
        });
    }

    async fn finish(mut self) -> Result<RunSummary> {
        if let Some(active) = self.current.take() {
            active.cancel.cancel();
            self.synthesis.sink().stop_immediately();
            if let Some(task) = active.task {
                if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                    tracing::warn!(turn = %active.id, "reply task did not stop in time");
                }
            }
        }
        self.shutdown.cancel();
        self.state.transition(Phase::Idle);

        if let Some(path) = &self.config.history_path {
            self.dialogue.snapshot().save(path)?;
        }

        tracing::info!(
            turns = self.summary.turns,
            ended_by_user = self.summary.ended_by_user,
            "conversation loop stopped"
        );
        Ok(self.summary)
    }
}

/// Lowercase and strip surrounding whitespace and punctuation
fn normalize_phrase(text: &str) -> String {
    text.trim()
        .trim_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation() || is_cjk_punctuation(c))
        .to_lowercase()
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(c, '。' | '！' | '？' | '，' | '、' | '～' | '…' | '；' | '：')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phrase() {
        assert_eq!(normalize_phrase(" 结束对话。"), "结束对话");
        assert_eq!(normalize_phrase("End conversation!"), "end conversation");
        assert_eq!(normalize_phrase("..."), "");
    }
}
