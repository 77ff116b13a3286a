//! One reply: dialogue stream feeding the synthesis stage

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::{Event, TurnId, TurnOutcome, TurnOutput};
use crate::dialogue::{DialogueEngine, ReplyEvent, Utterance};
use crate::voice::{SpeechSynthesisStage, SynthesisOutcome};

/// Utterances buffered ahead of synthesis
const UTTERANCE_CHANNEL_CAPACITY: usize = 8;

/// Everything a reply task needs
pub(crate) struct TurnContext {
    pub turn: TurnId,
    pub text: String,
    pub dialogue: Arc<DialogueEngine>,
    pub synthesis: SpeechSynthesisStage,
    pub cancel: CancellationToken,
    pub events: mpsc::Sender<Event>,
    pub output: Option<mpsc::UnboundedSender<TurnOutput>>,
}

/// Spawn the reply pipeline for a turn
///
/// The task always finishes by sending [`Event::TurnFinished`].
pub(crate) fn spawn_reply(ctx: TurnContext) -> JoinHandle<()> {
    tokio::spawn(run_reply(ctx))
}

async fn run_reply(ctx: TurnContext) {
    let TurnContext {
        turn,
        text,
        dialogue,
        synthesis,
        cancel,
        events,
        output,
    } = ctx;

    tracing::info!(%turn, user = %text, "turn started");

    let mut replies = dialogue.submit(turn.0, &text, cancel.clone()).await;

    let (utterance_tx, utterance_rx) = mpsc::channel::<Utterance>(UTTERANCE_CHANNEL_CAPACITY);
    let speaker_cancel = cancel.clone();
    let speaker =
        tokio::spawn(async move { synthesis.run(turn.0, utterance_rx, speaker_cancel).await });

    let mut announced = false;
    let mut reply_end = None;

    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = replies.recv() => event,
        };

        match event {
            Some(ReplyEvent::Utterance(utterance)) => {
                if utterance.is_speakable() {
                    if !announced {
                        announced = true;
                        let _ = events.send(Event::UtteranceReady { turn }).await;
                    }
                    if let Some(out) = &output {
                        let _ = out.send(TurnOutput::Utterance {
                            turn,
                            text: utterance.text.clone(),
                        });
                    }
                }

                let sent = tokio::select! {
                    () = cancel.cancelled() => false,
                    sent = utterance_tx.send(utterance) => sent.is_ok(),
                };
                if !sent {
                    break;
                }
            }
            Some(ReplyEvent::End(end)) => {
                reply_end = Some(end);
                break;
            }
            None => break,
        }
    }

    // Closing the channel lets synthesis finish the utterances it has
    drop(utterance_tx);

    let synthesis = match speaker.await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(%turn, stage = "synthesis", error = %e, "speaker task failed");
            SynthesisOutcome::default()
        }
    };

    if let Some(out) = &output {
        let _ = out.send(TurnOutput::Finished { turn });
    }

    let outcome = TurnOutcome {
        reply: reply_end,
        cancelled: cancel.is_cancelled(),
        synthesis,
    };

    tracing::debug!(
        %turn,
        played = outcome.synthesis.played,
        cancelled = outcome.cancelled,
        "turn finished"
    );

    let _ = events.send(Event::TurnFinished { turn, outcome }).await;
}
