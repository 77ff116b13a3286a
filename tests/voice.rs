//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beacon_voice::dialogue::Utterance;
use beacon_voice::voice::{
    AudioEncoding, FrameQueue, GateEvent, SpeechSynthesisStage, StreamDecoder, VadConfig,
    VoiceActivityGate, WakeEvent, WakeSignal, WakeSource, WakeWordMatcher, run_gate,
};

mod common;

use common::{
    RecordingOutput, StalledSynthesizer, ToneSynthesizer, silence_frames, speech_segment,
    tone_frames,
};

/// Push frames into a closed queue and collect every gate event
async fn gate_events(frames: Vec<beacon_voice::voice::AudioFrame>) -> Vec<GateEvent> {
    let queue = Arc::new(FrameQueue::new(1000));
    for frame in frames {
        queue.push(frame);
    }
    queue.close();

    let (tx, mut rx) = mpsc::channel::<GateEvent>(16);
    run_gate(
        VoiceActivityGate::with_energy(VadConfig::default()),
        queue,
        tx,
        CancellationToken::new(),
        Duration::from_millis(20),
    )
    .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_silence_produces_no_segment() {
    // 3 seconds of silence
    let events = gate_events(silence_frames(0, 150)).await;
    assert!(events.is_empty(), "unexpected events: {events:?}");
}

#[tokio::test]
async fn test_sentence_produces_one_segment_without_trailing_silence() {
    let mut frames = silence_frames(0, 25);
    frames.extend(tone_frames(500, 50, 0.3));
    frames.extend(silence_frames(1500, 75));

    let events = gate_events(frames).await;
    assert_eq!(events.len(), 2, "events: {events:?}");

    let GateEvent::SpeechStarted { at } = &events[0] else {
        panic!("expected speech start first");
    };
    assert_eq!(*at, Duration::from_millis(500));

    let GateEvent::SegmentClosed(segment) = &events[1] else {
        panic!("expected a closed segment");
    };
    assert_eq!(segment.started_at(), Duration::from_millis(500));
    assert_eq!(segment.frames().len(), 50);
    assert!(segment.ended_at() >= Duration::from_millis(1500));

    // Every frame belongs to the segment's span, in capture order
    let timestamps: Vec<_> = segment.frames().iter().map(|f| f.timestamp()).collect();
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    assert!(timestamps.iter().all(|t| *t >= segment.started_at()));
}

#[tokio::test]
async fn test_speech_at_end_of_capture_is_flushed() {
    let events = gate_events(tone_frames(0, 40, 0.3)).await;
    assert!(matches!(events.last(), Some(GateEvent::SegmentClosed(s)) if s.frames().len() == 40));
}

#[test]
fn test_queue_drops_oldest_when_full() {
    let queue = FrameQueue::new(10);
    for frame in tone_frames(0, 15, 0.1) {
        queue.push(frame);
    }

    assert_eq!(queue.len(), 10);
    assert_eq!(queue.dropped(), 5);
    let first = queue.try_pop().unwrap();
    assert_eq!(first.timestamp(), Duration::from_millis(100));
}

#[test]
fn test_segment_to_wav() {
    let segment = speech_segment();
    let wav = segment.to_wav().unwrap();

    let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 1);
    assert_eq!(spec.sample_rate, 16000);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len() as usize, segment.samples().len());
}

#[test]
fn test_pcm_decoder_across_chunk_boundaries() {
    let samples: Vec<i16> = (0..101).map(|i| i * 100).collect();
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();

    let mut decoder = StreamDecoder::new(AudioEncoding::Pcm, 24000);
    let mut decoded = Vec::new();
    for chunk in bytes.chunks(7) {
        if let Some(pcm) = decoder.push(chunk).unwrap() {
            assert_eq!(pcm.sample_rate, 24000);
            decoded.extend(pcm.samples);
        }
    }
    assert!(decoder.finish().unwrap().is_none());

    assert_eq!(decoded.len(), samples.len());
    #[allow(clippy::cast_possible_truncation)]
    let restored: Vec<i16> = decoded.iter().map(|s| (s * 32768.0).round() as i16).collect();
    assert_eq!(restored, samples);
}

#[tokio::test]
async fn test_synthesis_plays_every_utterance_in_order() {
    let synthesizer = ToneSynthesizer::new(2400);
    let sink = RecordingOutput::new(Duration::ZERO);
    let stage = SpeechSynthesisStage::new(synthesizer.clone(), sink.clone());

    let (tx, rx) = mpsc::channel(4);
    for (index, text) in ["你好！", "  ", "很高兴认识你。"].iter().enumerate() {
        tx.send(Utterance {
            index,
            text: (*text).to_string(),
        })
        .await
        .unwrap();
    }
    drop(tx);

    let outcome = stage.run(1, rx, CancellationToken::new()).await;

    assert!(outcome.error.is_none());
    assert!(!outcome.cancelled);
    assert_eq!(outcome.played, 2);
    // Whitespace-only utterances are never sent to the backend
    assert_eq!(synthesizer.texts(), vec!["你好！", "很高兴认识你。"]);
    assert_eq!(sink.played(), 4800);
}

#[tokio::test]
async fn test_stop_immediately_ends_synthesis() {
    let synthesizer = ToneSynthesizer::new(24000);
    let sink = RecordingOutput::new(Duration::from_millis(20));
    let stage = SpeechSynthesisStage::new(synthesizer, sink.clone());

    let (tx, rx) = mpsc::channel(4);
    tx.send(Utterance {
        index: 0,
        text: "a long sentence that takes a while to play".to_string(),
    })
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let cancel = cancel.clone();
        async move { stage.run(1, rx, cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(60)).await;
    cancel.cancel();
    beacon_voice::voice::AudioOutput::stop_immediately(sink.as_ref());

    let outcome = tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("synthesis should stop promptly")
        .unwrap();
    drop(tx);

    assert!(outcome.cancelled);
    assert!(sink.played() < 24000);
}

#[tokio::test]
async fn test_unanswered_synthesis_request_times_out() {
    let sink = RecordingOutput::new(Duration::ZERO);
    let stage = SpeechSynthesisStage::new(StalledSynthesizer::new(true), sink.clone())
        .with_timeout(Duration::from_millis(100));

    let (tx, rx) = mpsc::channel(1);
    tx.send(Utterance {
        index: 0,
        text: "hello there".to_string(),
    })
    .await
    .unwrap();
    drop(tx);

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        stage.run(1, rx, CancellationToken::new()),
    )
    .await
    .expect("synthesis wait should be bounded");

    assert!(matches!(outcome.error, Some(beacon_voice::Error::Timeout(_))));
    assert!(!outcome.cancelled);
    assert_eq!(sink.played(), 0);
}

#[tokio::test]
async fn test_wake_phrase_triggers_once_until_rearmed() {
    let matcher = WakeWordMatcher::new(vec!["Hey Beacon".to_string()]);
    let (tx, mut rx) = mpsc::channel::<WakeEvent>(4);
    let signal = WakeSignal::new(tx);

    let hit = matcher.detect("hey beacon, what time is it?").unwrap();
    assert_eq!(hit.command.as_deref(), Some("what time is it?"));

    assert!(signal.trigger(WakeSource::Phrase, hit.command.clone()));
    assert!(!signal.is_armed());
    assert!(!signal.trigger(WakeSource::Keyboard, None));

    signal.arm();
    assert!(signal.trigger(WakeSource::Keyboard, None));

    let first = rx.recv().await.unwrap();
    assert_eq!(first.source, WakeSource::Phrase);
    assert_eq!(first.command.as_deref(), Some("what time is it?"));
    assert_eq!(rx.recv().await.unwrap().source, WakeSource::Keyboard);

    assert!(matcher.detect("nothing to see here").is_none());
}
