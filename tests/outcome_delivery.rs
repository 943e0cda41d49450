//! Outcome pipeline delivery paths with a recording host runtime.

use clawline::config::OutcomeConfig;
use clawline::host::RecordingHost;
use clawline::manager::{CallMetadata, CallMode, CallRecord, CallState, Speaker, TranscriptEntry};
use clawline::outcome::OutcomePipeline;
use clawline::providers::{CallDirection, EndReason};
use std::sync::Arc;

fn terminal_record(session_key: Option<&str>, message_to: Option<&str>) -> CallRecord {
    CallRecord {
        call_id: "call-1".into(),
        provider_call_id: Some("MOCK-1".into()),
        from: "+15550009999".into(),
        to: "+15550001111".into(),
        direction: CallDirection::Outbound,
        state: CallState::HangupUser,
        end_reason: Some(EndReason::HangupUser),
        started_at: 1_700_000_000_000,
        ended_at: Some(1_700_000_120_000),
        transcript: vec![
            TranscriptEntry {
                speaker: Speaker::Bot,
                text: "Здравствуйте, хочу забронировать столик".into(),
                timestamp: 1_700_000_010_000,
            },
            TranscriptEntry {
                speaker: Speaker::User,
                text: "Записала, ждём вас".into(),
                timestamp: 1_700_000_020_000,
            },
        ],
        metadata: CallMetadata {
            prompt: "позвонить по номеру +7 925 000-11-22 и забронировать столик".into(),
            mode: CallMode::Notify,
            message_to: message_to.map(String::from),
            session_key: session_key.map(String::from),
            ..Default::default()
        },
        stream_sid: None,
        control_url: None,
        last_activity_at: 1_700_000_020_000,
    }
}

fn offline_pipeline(host: Arc<RecordingHost>) -> Arc<OutcomePipeline> {
    // No api key: the summary model is skipped and the deterministic
    // template summary is used.
    let config = OutcomeConfig {
        api_key: None,
        ..Default::default()
    };
    OutcomePipeline::new(config, host)
}

#[tokio::test]
async fn delivers_to_chat_resolved_from_session_key() {
    let host = Arc::new(RecordingHost::new());
    let pipeline = offline_pipeline(host.clone());

    pipeline
        .run(&terminal_record(Some("agent:main:telegram:dm:4242"), None))
        .await;

    let sent = host.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "4242");
    // Template summary mentions the number, the reason, and the sanitized task.
    assert!(sent[0].1.contains("+15550001111"));
    assert!(sent[0].1.contains("hangup-user"));
    assert!(sent[0].1.contains("Забронировать столик"));
    assert!(host.enqueued.lock().unwrap().is_empty());
}

#[tokio::test]
async fn message_to_fallback_when_session_key_has_no_channel() {
    let host = Arc::new(RecordingHost::new());
    let pipeline = offline_pipeline(host.clone());

    pipeline
        .run(&terminal_record(
            Some("agent:main:cli:session:7"),
            Some("telegram:-100555"),
        ))
        .await;

    let sent = host.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "-100555");
}

#[tokio::test]
async fn send_failure_is_logged_not_retried() {
    let mut host = RecordingHost::new();
    host.fail_sends = true;
    let host = Arc::new(host);
    let pipeline = offline_pipeline(host.clone());

    pipeline
        .run(&terminal_record(Some("agent:main:telegram:dm:1"), None))
        .await;

    // Nothing delivered, nothing enqueued, nothing panicked.
    assert!(host.sent.lock().unwrap().is_empty());
    assert!(host.enqueued.lock().unwrap().is_empty());
}

#[tokio::test]
async fn enqueue_path_dedups_on_context_key() {
    let host = Arc::new(RecordingHost::new());
    let pipeline = offline_pipeline(host.clone());
    let record = terminal_record(Some("agent:main:cli:session:7"), None);

    // Redelivered hook (e.g. crash between pipeline and record removal)
    // must not duplicate the system event.
    pipeline.run(&record).await;
    pipeline.run(&record).await;

    let enqueued = host.enqueued.lock().unwrap().clone();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].2, "voice-call:call-1:ended");
    assert!(enqueued[0].0.contains("+15550001111"));
}
