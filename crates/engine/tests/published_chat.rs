//! Published chat front: mode enforcement and session continuity.

mod common;

use std::sync::Arc;

use common::{deps, text_reply, MockLlm};
use sk_domain::error::Error;
use sk_engine::published::{AgentPreset, ApiResponseMode, PresetStore, PublishedChat};

fn preset(id: &str, mode: Option<ApiResponseMode>, published: bool) -> AgentPreset {
    AgentPreset {
        id: id.into(),
        name: format!("{id}-agent"),
        system_prompt: Some("Answer briefly.".into()),
        skill_names: None,
        mcp_servers: Vec::new(),
        builtin_tools: None,
        max_turns: 10,
        model_provider: "anthropic".into(),
        model_name: None,
        is_published: published,
        api_response_mode: mode,
        executor_name: None,
    }
}

#[tokio::test]
async fn wrong_transport_mode_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let presets = Arc::new(PresetStore::new());
    presets.insert(preset("a1", Some(ApiResponseMode::NonStreaming), true));
    presets.insert(preset("a2", Some(ApiResponseMode::Streaming), true));

    let chat = PublishedChat::new(deps(&tmp), presets)
        .with_client_override(MockLlm::new(vec![]));

    // Streaming request against a non-streaming preset.
    let err = chat.run_streaming("a1", "hi", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert!(err.to_string().contains("non-streaming"));

    // Non-streaming request against a streaming preset.
    let err = chat.run_blocking("a2", "hi", None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));
    assert!(err.to_string().contains("streaming"));
}

#[tokio::test]
async fn unpublished_and_unknown_presets_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let presets = Arc::new(PresetStore::new());
    presets.insert(preset("draft", Some(ApiResponseMode::NonStreaming), false));

    let chat = PublishedChat::new(deps(&tmp), presets)
        .with_client_override(MockLlm::new(vec![]));

    let err = chat.run_blocking("draft", "hi", None).await.unwrap_err();
    assert!(err.to_string().contains("not published"));

    let err = chat.run_blocking("ghost", "hi", None).await.unwrap_err();
    assert!(err.to_string().contains("unknown agent"));
}

#[tokio::test]
async fn blocking_chat_persists_both_session_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let engine_deps = deps(&tmp);
    let sessions = engine_deps.sessions.clone();

    let presets = Arc::new(PresetStore::new());
    presets.insert(preset("chat", Some(ApiResponseMode::NonStreaming), true));

    let chat = PublishedChat::new(engine_deps, presets)
        .with_client_override(MockLlm::new(vec![
            text_reply("first reply", 20),
            text_reply("second reply", 40),
        ]));

    let (result, session_id) = chat.run_blocking("chat", "hello", None).await.unwrap();
    assert!(result.success);
    assert_eq!(result.answer, "first reply");

    let record = sessions.get(&session_id).unwrap();
    // Display history: the user/assistant exchange.
    assert_eq!(record.messages.len(), 2);
    // Agent context: the engine's final working list.
    assert_eq!(record.agent_context.as_ref().unwrap().len(), 2);

    // Second request continues the same session.
    let (result, sid2) = chat
        .run_blocking("chat", "and again", Some(&session_id))
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(sid2, session_id);
    assert_eq!(result.answer, "second reply");

    let record = sessions.get(&session_id).unwrap();
    // Display only grows.
    assert_eq!(record.messages.len(), 4);
    // Working context carried the prior exchange plus the new one.
    assert_eq!(record.agent_context.as_ref().unwrap().len(), 4);
}

#[tokio::test]
async fn streaming_chat_delivers_events_and_saves_in_background() {
    let tmp = tempfile::tempdir().unwrap();
    let engine_deps = deps(&tmp);
    let sessions = engine_deps.sessions.clone();

    let presets = Arc::new(PresetStore::new());
    presets.insert(preset("live", Some(ApiResponseMode::Streaming), true));

    let chat = PublishedChat::new(engine_deps, presets)
        .with_client_override(MockLlm::new(vec![text_reply("streamed reply", 15)]));

    let (session_id, mut rx, _cancel) = chat.run_streaming("live", "hello", None).await.unwrap();

    let mut types = Vec::new();
    while let Some(event) = rx.recv().await {
        types.push(event.event_type());
    }
    assert_eq!(types.first(), Some(&"run_started"));
    assert_eq!(types.last(), Some(&"complete"));

    // The background task saves after the stream closes; give it a beat.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let record = sessions.get(&session_id).unwrap();
    assert_eq!(record.messages.len(), 2);
}
