//! Daemon - wires capture, gate, backends and the orchestrator into a process
//!
//! Two front ends share one conversation loop: the microphone (`run`) and a
//! typed console (`chat`).

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dialogue::{ConversationHistory, DialogueEngine, OpenAiChat};
use crate::orchestrator::{
    Collaborators, ConversationOrchestrator, Event, OrchestratorConfig, OrchestratorHandle, Phase,
    RunSummary, TurnOutput,
};
use crate::voice::{
    AudioCapture, AudioOutput, AudioPlayback, FrameQueue, SilentOutput, SilentSynthesizer,
    SpeechSynthesisStage, SpeechSynthesizer, SpeechToText, TextToSpeech, Transcriber,
    VoiceActivityGate, WakeSource, WakeWordMatcher, run_gate,
};
use crate::{Config, Error, POLL_INTERVAL, Result};

/// How often the capture drop counter is checked
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// The Beacon voice daemon
pub struct Daemon {
    config: Config,
}

impl Daemon {
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Run the spoken conversation loop until Ctrl-C or an end phrase
    ///
    /// # Errors
    ///
    /// Returns error if a device or backend cannot be initialized, or if
    /// history cannot be saved at shutdown
    pub async fn run(self) -> Result<RunSummary> {
        let config = &self.config;

        let transcriber: Arc<dyn Transcriber> = Arc::new(SpeechToText::from_config(&config.stt)?);
        let synthesizer: Arc<dyn SpeechSynthesizer> =
            Arc::new(TextToSpeech::from_config(&config.tts)?);
        let sink: Arc<dyn AudioOutput> = Arc::new(AudioPlayback::new()?);

        let orchestrator = ConversationOrchestrator::new(
            OrchestratorConfig::from_config(config),
            Collaborators {
                transcriber: Some(transcriber),
                dialogue: self.dialogue()?,
                synthesis: SpeechSynthesisStage::new(synthesizer, sink).with_timeout(config.tts.timeout),
                wake_words: WakeWordMatcher::new(config.wake.words.clone()),
                output: None,
            },
        );
        let handle = orchestrator.handle();
        let shutdown = orchestrator.shutdown_token();

        let queue = Arc::new(FrameQueue::new(config.audio.queue_capacity));
        let device_events = handle.sender();
        let mut capture = AudioCapture::spawn(
            &config.audio,
            Arc::clone(&queue),
            Box::new(move |e: Error| {
                let _ = device_events.try_send(Event::DeviceFailed(e));
            }),
        )?;

        let gate = tokio::spawn(run_gate(
            VoiceActivityGate::with_energy(config.vad.clone()),
            Arc::clone(&queue),
            handle.sender(),
            shutdown.clone(),
            POLL_INTERVAL,
        ));

        spawn_ctrl_c(handle.clone());
        spawn_drop_reporter(Arc::clone(&queue), shutdown.clone());

        if config.wake.keyboard {
            spawn_keyboard_trigger(handle.clone(), shutdown.clone());
        }

        if config.wake.words.is_empty() {
            tracing::info!("beacon voice ready - press Enter to talk");
        } else {
            tracing::info!(wake_words = ?config.wake.words, "beacon voice ready - say a wake phrase");
        }

        let summary = orchestrator.run().await;

        capture.stop();
        queue.close();
        if tokio::time::timeout(POLL_INTERVAL * 5, gate).await.is_err() {
            tracing::warn!("voice gate did not stop in time");
        }
        if queue.dropped() > 0 {
            tracing::info!(dropped = queue.dropped(), "capture frames dropped this session");
        }

        summary
    }

    /// Run a typed conversation; replies are printed and (unless muted) spoken
    ///
    /// # Errors
    ///
    /// Returns error if a backend or the speaker cannot be initialized, or if
    /// history cannot be saved at shutdown
    pub async fn chat(self, mute: bool) -> Result<RunSummary> {
        let config = &self.config;

        let synthesizer: Arc<dyn SpeechSynthesizer> = if mute {
            Arc::new(SilentSynthesizer)
        } else {
            Arc::new(TextToSpeech::from_config(&config.tts)?)
        };
        let sink: Arc<dyn AudioOutput> = if mute {
            Arc::new(SilentOutput::new())
        } else {
            Arc::new(AudioPlayback::new()?)
        };

        let (output_tx, output_rx) = mpsc::unbounded_channel();

        let mut orchestrator_config = OrchestratorConfig::from_config(config);
        orchestrator_config.chime = false;

        let orchestrator = ConversationOrchestrator::new(
            orchestrator_config,
            Collaborators {
                transcriber: None,
                dialogue: self.dialogue()?,
                synthesis: SpeechSynthesisStage::new(synthesizer, sink).with_timeout(config.tts.timeout),
                wake_words: WakeWordMatcher::new(Vec::new()),
                output: Some(output_tx),
            },
        );
        let handle = orchestrator.handle();
        let shutdown = orchestrator.shutdown_token();

        spawn_ctrl_c(handle.clone());
        let printer = tokio::spawn(print_replies(output_rx));

        let lines = spawn_stdin_reader();
        let input_handle = handle.clone();
        tokio::spawn(async move {
            let mut lines = lines;
            prompt();
            loop {
                let line = tokio::select! {
                    () = shutdown.cancelled() => break,
                    line = lines.recv() => line,
                };
                match line {
                    Some(line) if line.trim().is_empty() => prompt(),
                    Some(line) => input_handle.submit_text(line).await,
                    None => {
                        input_handle.shutdown().await;
                        break;
                    }
                }
            }
        });

        let summary = orchestrator.run().await;
        let _ = tokio::time::timeout(POLL_INTERVAL * 5, printer).await;
        summary
    }

    /// Build the dialogue engine, restoring history from disk
    fn dialogue(&self) -> Result<Arc<DialogueEngine>> {
        let config = &self.config;
        let backend = Arc::new(OpenAiChat::from_config(&config.llm)?);

        let path = &config.conversation.history_path;
        let history = ConversationHistory::load(path, Some(&config.llm.system_prompt))?;
        tracing::info!(
            path = %path.display(),
            messages = history.len(),
            "conversation history loaded"
        );

        let engine = DialogueEngine::new(
            backend,
            history.shared(),
            config.chunking.clone(),
            config.llm.token_ceiling,
        )
        .with_user_suffix(config.llm.user_suffix.clone());

        Ok(Arc::new(engine))
    }
}

fn spawn_ctrl_c(handle: OrchestratorHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown().await;
        }
    });
}

/// Log when the capture queue starts dropping frames
fn spawn_drop_reporter(queue: Arc<FrameQueue>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DROP_REPORT_INTERVAL);
        // Skip the first immediate tick
        interval.tick().await;

        let mut reported = 0;
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let dropped = queue.dropped();
                    if dropped > reported {
                        tracing::debug!(dropped, new = dropped - reported, "capture falling behind");
                        reported = dropped;
                    }
                }
            }
        }
    });
}

/// Enter on stdin: push-to-talk when idle, barge-in while replying
fn spawn_keyboard_trigger(handle: OrchestratorHandle, shutdown: CancellationToken) {
    let mut lines = spawn_stdin_reader();
    tokio::spawn(async move {
        loop {
            let line = tokio::select! {
                () = shutdown.cancelled() => break,
                line = lines.recv() => line,
            };
            if line.is_none() {
                break;
            }

            if handle.state().phase() == Phase::Idle {
                handle.wake().trigger(WakeSource::Keyboard, None);
            } else {
                handle.interrupt().await;
            }
        }
    });
}

/// Read stdin lines on a dedicated thread; the channel closes at EOF
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "failed to spawn stdin reader");
    }
    rx
}

async fn print_replies(mut output: mpsc::UnboundedReceiver<TurnOutput>) {
    while let Some(item) = output.recv().await {
        match item {
            TurnOutput::Utterance { text, .. } => {
                print!("{text}");
                let _ = std::io::stdout().flush();
            }
            TurnOutput::Finished { .. } => {
                println!();
                prompt();
            }
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
