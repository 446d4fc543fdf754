//! End-to-end conversation flows through the full application state.

mod support;

use std::time::Duration;

use hub_domain::error::ErrorCode;
use hub_domain::message::MessageSender;
use hub_domain::task::TaskStatus;
use hub_gateway::runtime::context::ConversationRole;
use hub_gateway::runtime::engine::TaskDraft;
use hub_gateway::runtime::orchestrator::SendEvent;

use support::{app_state, ScriptedLlm, ScriptedTransport};

fn draft(title: &str) -> TaskDraft {
    TaskDraft {
        title: title.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn happy_task_path() {
    let llm = ScriptedLlm::replying("OK");
    let state = app_state(llm.clone(), ScriptedTransport::new(true), |_| {});

    let task = state.engine.create(draft("T")).await.unwrap();
    state.engine.start(task.id).await.unwrap();

    let outcome = state
        .orchestrator
        .send(task.id, "hi", ConversationRole::User, None)
        .await
        .unwrap();
    assert_eq!(outcome.reply, "OK");

    let task = state.engine.get(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::ProcessingCursor);
    assert!(task.started_at.is_some());
    assert!(task.progress >= 5);

    let summary = state.orchestrator.conversation_summary(task.id).unwrap();
    assert_eq!(summary.message_count, 2);

    let messages = state.engine.messages(task.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].sender, MessageSender::User);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].sender, MessageSender::Gemini);
    assert_eq!(messages[1].content, "OK");
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_surfaces_external_service() {
    let llm = ScriptedLlm::failing();
    let state = app_state(llm.clone(), ScriptedTransport::new(true), |c| {
        c.llm.max_retries = 2;
    });

    let task = state.engine.create(draft("T")).await.unwrap();

    let started = tokio::time::Instant::now();
    let err = state
        .orchestrator
        .send(task.id, "x", ConversationRole::User, None)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code(), ErrorCode::ExternalService);
    // Initial attempt plus two retries.
    assert_eq!(llm.call_count(), 3);
    // Backoff slept roughly 2s then 4s.
    assert!(elapsed >= Duration::from_secs(6), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "elapsed {elapsed:?}");

    // Only the user turn was recorded; no assistant reply appended.
    let summary = state.orchestrator.conversation_summary(task.id).unwrap();
    assert_eq!(summary.message_count, 1);
    let messages = state.engine.messages(task.id).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, MessageSender::User);
}

#[tokio::test]
async fn stream_cancel_via_task_cascade() {
    let llm = ScriptedLlm::stalling();
    let state = app_state(llm, ScriptedTransport::new(true), |_| {});

    let task = state.engine.create(draft("T")).await.unwrap();
    state.engine.start(task.id).await.unwrap();

    let mut rx = state
        .orchestrator
        .send_stream(task.id, "long", ConversationRole::User, None)
        .await
        .unwrap();

    // Two chunks arrive, then we cancel the task itself.
    assert!(matches!(rx.recv().await, Some(SendEvent::Chunk(_))));
    assert!(matches!(rx.recv().await, Some(SendEvent::Chunk(_))));

    let cancelled = state.cancel_task_cascade(task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);

    // The stream terminates with its end-of-stream marker.
    assert!(matches!(rx.recv().await, Some(SendEvent::Cancelled)));
    assert!(rx.recv().await.is_none());

    // The partial assistant reply was discarded everywhere.
    let summary = state.orchestrator.conversation_summary(task.id).unwrap();
    assert_eq!(summary.message_count, 1);
    let messages = state.engine.messages(task.id).await.unwrap();
    assert_eq!(messages.len(), 1);

    let task = state.engine.get(task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.completed_at.is_some());
}

#[tokio::test]
async fn context_window_truncation_keeps_recent_turns() {
    let llm = ScriptedLlm::replying("OK");
    let state = app_state(llm, ScriptedTransport::new(true), |c| {
        c.llm.context_window = 100;
        c.llm.max_tokens = 20;
    });

    let task = state.engine.create(draft("T")).await.unwrap();
    state
        .orchestrator
        .create_conversation(task.id, Some("stay brief".into()));

    for i in 0..50 {
        state
            .orchestrator
            .send(
                task.id,
                &format!("{i:02}{}", "x".repeat(38)),
                ConversationRole::User,
                None,
            )
            .await
            .unwrap();
    }

    let summary = state.orchestrator.conversation_summary(task.id).unwrap();
    assert!(
        summary.estimated_tokens <= 100,
        "estimated_tokens = {}",
        summary.estimated_tokens
    );
    assert!(summary.has_system_prompt);
    // The most recent turn survives truncation.
    assert!(summary.message_count >= 2);
}

#[tokio::test]
async fn clear_and_summary_endpoints_behavior() {
    let llm = ScriptedLlm::replying("OK");
    let state = app_state(llm, ScriptedTransport::new(true), |_| {});

    let task = state.engine.create(draft("T")).await.unwrap();
    assert!(state.orchestrator.conversation_summary(task.id).is_none());

    state
        .orchestrator
        .send(task.id, "hello", ConversationRole::User, None)
        .await
        .unwrap();
    assert!(state.orchestrator.conversation_summary(task.id).is_some());

    assert!(state.orchestrator.clear(task.id));
    assert!(!state.orchestrator.clear(task.id));
    assert!(state.orchestrator.conversation_summary(task.id).is_none());
}
