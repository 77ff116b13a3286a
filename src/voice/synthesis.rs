//! Speech synthesis stage
//!
//! One turn's utterances are synthesized strictly in order by a producer
//! task that decodes backend bytes into PCM and writes them to a bounded
//! channel. The consumer side plays each chunk through the sink. Both sides
//! check the turn's cancellation token at every chunk.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::decode::{PcmChunk, StreamDecoder};
use super::playback::AudioOutput;
use super::tts::SpeechSynthesizer;
use crate::dialogue::Utterance;
use crate::{Error, Result};

/// Decoded chunks buffered between synthesis and playback
const PCM_CHANNEL_CAPACITY: usize = 16;

/// Longest wait for a synthesis response or its next chunk
pub const DEFAULT_SYNTHESIS_TIMEOUT: Duration = Duration::from_secs(30);

enum Playout {
    Audio(PcmChunk),
    UtteranceDone { index: usize },
}

/// How a turn's speech output ended
#[derive(Debug, Default)]
pub struct SynthesisOutcome {
    /// Utterances played to completion
    pub played: usize,
    /// Stopped by cancellation
    pub cancelled: bool,
    /// Backend or device failure that ended output early
    pub error: Option<Error>,
}

/// Turns utterances into audio on the sink
#[derive(Clone)]
pub struct SpeechSynthesisStage {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioOutput>,
    timeout: Duration,
}

impl SpeechSynthesisStage {
    #[must_use]
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, sink: Arc<dyn AudioOutput>) -> Self {
        Self {
            synthesizer,
            sink,
            timeout: DEFAULT_SYNTHESIS_TIMEOUT,
        }
    }

    /// Bound every wait on the synthesis backend
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn AudioOutput> {
        &self.sink
    }

    /// Speak every utterance received until the channel closes or `cancel` fires
    ///
    /// Returns once playback has drained (or stopped).
    pub async fn run(
        &self,
        turn: u64,
        utterances: mpsc::Receiver<Utterance>,
        cancel: CancellationToken,
    ) -> SynthesisOutcome {
        let session = self.sink.session();
        let (pcm_tx, mut pcm_rx) = mpsc::channel::<Playout>(PCM_CHANNEL_CAPACITY);

        let producer = tokio::spawn(produce(
            turn,
            Arc::clone(&self.synthesizer),
            self.timeout,
            utterances,
            pcm_tx,
            cancel.clone(),
        ));

        let mut outcome = SynthesisOutcome::default();

        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => None,
                item = pcm_rx.recv() => item,
            };
            let Some(item) = item else { break };

            match item {
                Playout::Audio(chunk) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match self.sink.play(session, &chunk.samples, chunk.sample_rate).await {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(turn, "playback session stopped");
                            outcome.cancelled = true;
                            break;
                        }
                        Err(e) => {
                            tracing::error!(turn, stage = "playback", error = %e, "playback failed");
                            outcome.error = Some(e);
                            cancel.cancel();
                            break;
                        }
                    }
                }
                Playout::UtteranceDone { index } => {
                    tracing::debug!(turn, index, "utterance synthesized");
                    outcome.played += 1;
                }
            }
        }

        // Stop the producer if playback ended first
        drop(pcm_rx);

        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if outcome.error.is_none() {
                    outcome.error = Some(e);
                }
            }
            Err(e) => tracing::error!(turn, stage = "synthesis", error = %e, "synthesis task panicked"),
        }

        if cancel.is_cancelled() {
            outcome.cancelled = outcome.error.is_none();
            return outcome;
        }

        if outcome.error.is_none() {
            if let Err(e) = self.sink.drain(session).await {
                tracing::warn!(turn, stage = "playback", error = %e, "playback drain failed");
                outcome.error = Some(e);
            }
        }

        outcome
    }
}

async fn produce(
    turn: u64,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    timeout: Duration,
    mut utterances: mpsc::Receiver<Utterance>,
    tx: mpsc::Sender<Playout>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let utterance = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            u = utterances.recv() => u,
        };
        let Some(utterance) = utterance else {
            return Ok(());
        };

        if !utterance.is_speakable() {
            continue;
        }

        tracing::debug!(turn, index = utterance.index, text = %utterance.text, "synthesizing utterance");

        let stream = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            s = tokio::time::timeout(timeout, synthesizer.synthesize(&utterance.text)) => {
                s.unwrap_or_else(|_| Err(Error::Timeout(format!("no synthesis response in {timeout:?}"))))
            }
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(turn, stage = "synthesis", index = utterance.index, error = %e, "synthesis request failed");
                return Err(e);
            }
        };

        let mut decoder =
            StreamDecoder::new(synthesizer.encoding(), synthesizer.pcm_sample_rate());

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                next = tokio::time::timeout(timeout, stream.next()) => match next {
                    Ok(next) => next,
                    Err(_) => Some(Err(Error::Timeout(format!("synthesis stream stalled for {timeout:?}")))),
                },
            };
            let Some(bytes) = next else { break };

            let bytes = match bytes {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(turn, stage = "synthesis", index = utterance.index, error = %e, "synthesis stream failed");
                    return Err(e);
                }
            };

            match decoder.push(&bytes) {
                Ok(Some(chunk)) => {
                    if !send(&tx, &cancel, Playout::Audio(chunk)).await {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(turn, stage = "synthesis", index = utterance.index, error = %e, "skipping undecodable chunk");
                }
            }
        }

        match decoder.finish() {
            Ok(Some(chunk)) => {
                if !send(&tx, &cancel, Playout::Audio(chunk)).await {
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(turn, stage = "synthesis", index = utterance.index, error = %e, "skipping undecodable tail");
            }
        }

        let done = Playout::UtteranceDone {
            index: utterance.index,
        };
        if !send(&tx, &cancel, done).await {
            return Ok(());
        }
    }
}

/// Send unless cancelled or the consumer is gone
async fn send(tx: &mpsc::Sender<Playout>, cancel: &CancellationToken, item: Playout) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
