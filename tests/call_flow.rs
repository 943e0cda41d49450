//! End-to-end call flow through the real HTTP server and the mock
//! provider: webhook dispatch, state progression, hook delivery, outcome
//! delivery, and the hook-endpoint rate limit.

use clawline::config::{Config, ProviderKind};
use clawline::host::RecordingHost;
use clawline::manager::{CallMode, CallOptions, CallState};
use clawline::providers::EndReason;
use clawline::runtime::VoiceRuntime;
use std::sync::Arc;
use std::time::Duration;

async fn start_runtime(
    configure: impl FnOnce(&mut Config),
) -> (VoiceRuntime, Arc<RecordingHost>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_provider(ProviderKind::Mock);
    config.serve.listen = "127.0.0.1:0".to_string();
    config.history_path = dir.path().join("calls.jsonl");
    // Keep the pipeline offline: the template summary path is deterministic.
    config.outcome.api_key = None;
    configure(&mut config);
    let host = Arc::new(RecordingHost::new());
    let runtime = VoiceRuntime::start(config, host.clone(), None)
        .await
        .unwrap();
    (runtime, host, dir)
}

async fn post_event(base: &str, body: serde_json::Value) -> u16 {
    reqwest::Client::new()
        .post(format!("{}/voice/webhook", base))
        .json(&body)
        .send()
        .await
        .unwrap()
        .status()
        .as_u16()
}

#[tokio::test]
async fn happy_outbound_call_through_webhooks() {
    let (runtime, host, _dir) = start_runtime(|_| {}).await;
    let manager = runtime.manager();
    let base = runtime.public_url().to_string();

    let outcome = manager
        .initiate_call(
            "+15550001111",
            Some("agent:main:telegram:dm:42"),
            CallOptions {
                prompt: "Забронировать столик на имя Елена, завтра 20:00, 4 гостя".into(),
                mode: CallMode::Notify,
                ..Default::default()
            },
        )
        .await;
    assert!(outcome.success, "{:?}", outcome.error);
    let call_id = outcome.call_id.unwrap();

    // Carrier progresses the call over real webhook HTTP.
    for event in ["ringing", "answered"] {
        let status = post_event(
            &base,
            serde_json::json!({ "event": event, "providerCallId": "MOCK-1" }),
        )
        .await;
        assert_eq!(status, 200);
    }
    assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::Active);

    post_event(
        &base,
        serde_json::json!({
            "event": "speech",
            "providerCallId": "MOCK-1",
            "transcript": "Да, столик на четверых, жду вас",
            "isFinal": true
        }),
    )
    .await;

    post_event(
        &base,
        serde_json::json!({
            "event": "ended",
            "providerCallId": "MOCK-1",
            "reason": "hangup-user"
        }),
    )
    .await;

    // Outcome pipeline runs off the hook; give it a beat.
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Summary was delivered to the chat resolved from the session key.
    let sent = host.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "42");
    assert!(sent[0].1.contains("+15550001111"));

    // Terminal record persisted to history with the right end state.
    let history = manager.get_call_history(10);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, CallState::HangupUser);
    assert_eq!(history[0].end_reason, Some(EndReason::HangupUser));
    assert!(history[0].ended_at.is_some());
    assert_eq!(history[0].transcript.len(), 1);

    runtime.stop().await;
}

#[tokio::test]
async fn redelivered_terminal_webhook_is_idempotent() {
    let (runtime, host, _dir) = start_runtime(|_| {}).await;
    let manager = runtime.manager();
    let base = runtime.public_url().to_string();

    let outcome = manager
        .initiate_call(
            "+15550002222",
            Some("agent:main:telegram:dm:42"),
            CallOptions::default(),
        )
        .await;
    assert!(outcome.success);

    post_event(&base, serde_json::json!({"event": "answered", "providerCallId": "MOCK-1"})).await;
    for _ in 0..3 {
        post_event(
            &base,
            serde_json::json!({"event": "ended", "providerCallId": "MOCK-1", "reason": "completed"}),
        )
        .await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The hook (and therefore delivery) fired exactly once.
    assert_eq!(host.sent.lock().unwrap().len(), 1);
    runtime.stop().await;
}

#[tokio::test]
async fn conversation_realtime_loss_is_terminal() {
    let (runtime, _host, _dir) = start_runtime(|config| {
        config.streaming.enabled = true;
    })
    .await;
    let manager = runtime.manager();

    let outcome = manager
        .initiate_call(
            "+15550003333",
            None,
            CallOptions {
                prompt: "поговорить".into(),
                mode: CallMode::Conversation,
                ..Default::default()
            },
        )
        .await;
    let call_id = outcome.call_id.unwrap();
    manager.apply_event(
        &clawline::NormalizedEvent::new(clawline::EventKind::Ringing)
            .with_provider_call_id("MOCK-1"),
    );
    manager.apply_event(
        &clawline::NormalizedEvent::new(clawline::EventKind::Answered)
            .with_provider_call_id("MOCK-1"),
    );
    manager.append_transcript(&call_id, clawline::manager::Speaker::User, "Алло");

    // The realtime socket dies mid-call (e.g. close 1011). No reconnect in
    // conversation mode: the call fails with realtime-disconnected.
    manager.on_realtime_lost(&call_id, "close 1011");

    let record = manager.get_call(&call_id).unwrap();
    assert_eq!(record.state, CallState::Failed);
    assert_eq!(record.end_reason, Some(EndReason::RealtimeDisconnected));
    // Transcript captured so far survives into the outcome.
    assert_eq!(record.transcript.len(), 1);
    runtime.stop().await;
}

#[tokio::test]
async fn unknown_routes_and_bad_payloads() {
    let (runtime, _host, _dir) = start_runtime(|_| {}).await;
    let base = runtime.public_url().to_string();
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{}/definitely-not-a-route", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);

    // Mock adapter rejects unintelligible payloads with 400.
    let resp = client
        .post(format!("{}/voice/webhook", base))
        .body("not json at all")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    runtime.stop().await;
}

#[tokio::test]
async fn hook_token_sweep_throttles_then_recovers() {
    let (runtime, _host, _dir) = start_runtime(|config| {
        config.serve.hook_token = Some("hook-secret".into());
    })
    .await;
    let base = runtime.public_url().to_string();
    let client = reqwest::Client::new();

    // 20 failures fill the window...
    for i in 0..20 {
        let resp = client
            .post(format!("{}/hooks/wake", base))
            .bearer_auth("wrong-token")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401, "attempt {}", i);
    }

    // ...the 21st invalid attempt is throttled with Retry-After >= 1...
    let resp = client
        .post(format!("{}/hooks/wake", base))
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 429);
    let retry_after: u64 = resp
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);

    // ...and a valid token still succeeds and clears the counter.
    let resp = client
        .post(format!("{}/hooks/wake", base))
        .bearer_auth("hook-secret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client
        .post(format!("{}/hooks/wake", base))
        .bearer_auth("wrong-token")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401, "counter was cleared");

    runtime.stop().await;
}

#[tokio::test]
async fn outcome_enqueues_system_event_without_chat_channel() {
    let (runtime, host, _dir) = start_runtime(|_| {}).await;
    let manager = runtime.manager();
    let base = runtime.public_url().to_string();

    // Session key with no telegram channel and no messageTo fallback.
    let outcome = manager
        .initiate_call(
            "+15550004444",
            Some("agent:main:cli:session:1"),
            CallOptions {
                prompt: "спросить про график работы".into(),
                ..Default::default()
            },
        )
        .await;
    let call_id = outcome.call_id.unwrap();

    post_event(&base, serde_json::json!({"event": "answered", "providerCallId": "MOCK-1"})).await;
    post_event(
        &base,
        serde_json::json!({"event": "ended", "providerCallId": "MOCK-1", "reason": "completed"}),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(host.sent.lock().unwrap().is_empty());
    let enqueued = host.enqueued.lock().unwrap().clone();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].1, "agent:main:cli:session:1");
    assert_eq!(enqueued[0].2, format!("voice-call:{}:ended", call_id));

    runtime.stop().await;
}
