//! Dialogue engine integration tests

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use beacon_voice::dialogue::{
    ChunkPolicy, ConversationHistory, DialogueEngine, INTERRUPTED_REPLY, Message, ReplyEnd,
    ReplyEvent, Role, Utterance,
};

mod common;

use common::{Reply, ScriptedChat};

const SYSTEM: &str = "You are a voice companion.";

fn engine(chat: &Arc<ScriptedChat>, policy: ChunkPolicy, ceiling: u32) -> DialogueEngine {
    let history = ConversationHistory::new(Some(SYSTEM)).shared();
    DialogueEngine::new(chat.clone(), history, policy, ceiling)
}

async fn collect(
    engine: &DialogueEngine,
    turn: u64,
    text: &str,
    cancel: CancellationToken,
) -> (Vec<Utterance>, ReplyEnd) {
    let mut rx = engine.submit(turn, text, cancel).await;
    let mut utterances = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            ReplyEvent::Utterance(u) => utterances.push(u),
            ReplyEvent::End(end) => return (utterances, end),
        }
    }
    panic!("reply channel closed without an end marker");
}

fn roles(messages: &[Message]) -> Vec<Role> {
    messages.iter().map(|m| m.role).collect()
}

#[tokio::test]
async fn test_short_fragments_form_one_utterance() {
    let chat = ScriptedChat::new(vec![Reply::text(&["你好", "！", "很高兴", "认识你。"])]);
    let policy = ChunkPolicy {
        min_chars: 5,
        ..ChunkPolicy::default()
    };
    let engine = engine(&chat, policy, 600);

    let (utterances, end) = collect(&engine, 1, "你好", CancellationToken::new()).await;

    assert_eq!(utterances.len(), 1);
    assert_eq!(utterances[0].text, "你好！很高兴认识你。");
    assert_eq!(end.text, "你好！很高兴认识你。");
    assert_eq!(end.utterances, 1);
    assert!(end.error.is_none());
    assert!(!end.cancelled);

    let history = engine.snapshot();
    assert_eq!(
        roles(history.messages()),
        vec![Role::System, Role::User, Role::Assistant]
    );
    assert_eq!(history.messages()[2].content, "你好！很高兴认识你。");
}

#[tokio::test]
async fn test_utterances_rejoin_to_full_reply() {
    let fragments = [
        "Sure", "!", " The weather", " today is", " sunny and warm.", " ", "Bring", " a hat",
        " if you go out", "?", " Have fun", "~",
    ];
    let chat = ScriptedChat::new(vec![Reply::text(&fragments)]);
    let engine = engine(&chat, ChunkPolicy::default(), 600);

    let (utterances, end) = collect(&engine, 1, "weather?", CancellationToken::new()).await;

    let joined: String = utterances.iter().map(|u| u.text.as_str()).collect();
    assert_eq!(joined, fragments.concat());
    assert_eq!(end.text, fragments.concat());
    assert!(utterances.len() > 1);
    assert!(utterances.iter().enumerate().all(|(i, u)| u.index == i));
}

#[tokio::test]
async fn test_history_sent_in_order_with_suffix() {
    let chat = ScriptedChat::new(vec![Reply::text(&["First answer."]), Reply::text(&["Second."])]);
    let engine =
        engine(&chat, ChunkPolicy::default(), 600).with_user_suffix(Some(" (be brief)".to_string()));

    collect(&engine, 1, "one", CancellationToken::new()).await;
    collect(&engine, 2, "two", CancellationToken::new()).await;

    let requests = chat.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);

    let second = &requests[1];
    assert_eq!(
        roles(second),
        vec![Role::System, Role::User, Role::Assistant, Role::User]
    );
    assert_eq!(second[0].content, SYSTEM);
    assert_eq!(second[1].content, "one (be brief)");
    assert_eq!(second[2].content, "First answer.");
    assert_eq!(second[3].content, "two (be brief)");
}

#[tokio::test]
async fn test_usage_over_ceiling_evicts_oldest_pair() {
    let chat = ScriptedChat::new(vec![
        Reply::text(&["a1."]).with_usage(300),
        Reply::text(&["a2."]).with_usage(700),
    ]);
    let engine = engine(&chat, ChunkPolicy::default(), 600);

    collect(&engine, 1, "u1", CancellationToken::new()).await;
    assert_eq!(engine.snapshot().len(), 3);

    let (_, end) = collect(&engine, 2, "u2", CancellationToken::new()).await;
    assert_eq!(end.total_tokens, Some(700));

    let history = engine.snapshot();
    let contents: Vec<_> = history.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec![SYSTEM, "u2", "a2."]);
}

#[tokio::test]
async fn test_backend_error_ends_reply() {
    let chat = ScriptedChat::new(vec![Reply::Fail("503 service unavailable".to_string())]);
    let engine = engine(&chat, ChunkPolicy::default(), 600);

    let (utterances, end) = collect(&engine, 1, "hello", CancellationToken::new()).await;

    assert!(utterances.is_empty());
    let error = end.error.as_ref().expect("error should be reported");
    assert!(error.is_backend());
    assert!(!end.has_speech());

    // The user message stays; nothing was generated for the assistant
    assert_eq!(roles(engine.snapshot().messages()), vec![Role::System, Role::User]);
}

#[tokio::test]
async fn test_cancel_keeps_partial_reply() {
    let chat = ScriptedChat::new(vec![Reply::slow(
        &["This is a long answer.", " It keeps going.", " And going.", " Forever."],
        Duration::from_millis(50),
    )]);
    let engine = engine(&chat, ChunkPolicy::default(), 600);

    let cancel = CancellationToken::new();
    let mut rx = engine.submit(1, "talk", cancel.clone()).await;

    let first = rx.recv().await.unwrap();
    assert!(matches!(first, ReplyEvent::Utterance(ref u) if u.text == "This is a long answer."));
    cancel.cancel();

    let end = loop {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
            Ok(Some(ReplyEvent::End(end))) => break end,
            Ok(Some(ReplyEvent::Utterance(_))) => {}
            other => panic!("expected end marker, got {other:?}"),
        }
    };

    assert!(end.cancelled);
    assert!(end.text.starts_with("This is a long answer."));
    assert!(!end.text.contains("Forever"));

    let history = engine.snapshot();
    assert_eq!(
        roles(history.messages()),
        vec![Role::System, Role::User, Role::Assistant]
    );
    assert_eq!(history.messages()[2].content, end.text);
}

#[tokio::test]
async fn test_cancel_before_any_text_keeps_alternation() {
    let chat = ScriptedChat::new(vec![
        Reply::slow(&["Too late."], Duration::from_millis(500)),
        Reply::text(&["Second answer."]),
    ]);
    let engine = engine(&chat, ChunkPolicy::default(), 600);

    let cancel = CancellationToken::new();
    let mut rx = engine.submit(1, "first", cancel.clone()).await;
    cancel.cancel();

    let end = match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(ReplyEvent::End(end))) => end,
        other => panic!("expected end marker, got {other:?}"),
    };
    assert!(end.cancelled);
    assert!(end.text.is_empty());

    collect(&engine, 2, "second", CancellationToken::new()).await;

    let requests = chat.requests.lock().unwrap().clone();
    assert_eq!(
        roles(&requests[1]),
        vec![Role::System, Role::User, Role::Assistant, Role::User]
    );
    assert_eq!(requests[1][2].content, INTERRUPTED_REPLY);
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.json");

    let chat = ScriptedChat::new(vec![Reply::text(&["Nice to meet you."])]);
    let engine = engine(&chat, ChunkPolicy::default(), 600);
    collect(&engine, 1, "hi", CancellationToken::new()).await;
    engine.snapshot().save(&path).unwrap();

    let restored = ConversationHistory::load(&path, Some("a different prompt")).unwrap();
    let contents: Vec<_> = restored.messages().iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec![SYSTEM, "hi", "Nice to meet you."]);
}
