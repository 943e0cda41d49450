//! Media bridge behavior over a real WebSocket pair: framed-JSON
//! transport, identity resolution, realtime wiring, TTS serialization,
//! and barge-in.
//!
//! The realtime endpoint is a local fake that speaks just enough of the
//! session protocol: it acknowledges `session.update` and lets the test
//! inject server-side events (VAD speech-start, transcripts).

use clawline::audio;
use clawline::bridge::{BridgeEvents, MediaBridge, PlayOutcome, StreamAccept};
use clawline::config::RealtimeConfig;
use clawline::providers::MediaTransport;
use clawline::realtime::{RealtimeMode, SessionParams};
use clawline::tts::TelephonyTts;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Minimal realtime-model stand-in.
struct FakeRealtime {
    endpoint: String,
    /// Everything the "model" received from the bridge.
    received: mpsc::UnboundedReceiver<serde_json::Value>,
    /// Inject a server->client event.
    inject: mpsc::UnboundedSender<String>,
}

async fn spawn_fake_realtime() -> FakeRealtime {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, received) = mpsc::unbounded_channel();
    let (inject, mut inject_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else { return };
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let (mut sink, mut source) = ws.split();
        loop {
            tokio::select! {
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let value: serde_json::Value =
                                serde_json::from_str(&text).unwrap_or_default();
                            if value["type"] == "session.update" {
                                let ack = serde_json::json!({"type": "session.updated"});
                                let _ = sink.send(Message::Text(ack.to_string().into())).await;
                            }
                            let _ = received_tx.send(value);
                        }
                        Some(Ok(Message::Close(_))) | None => return,
                        _ => {}
                    }
                }
                injected = inject_rx.recv() => {
                    match injected {
                        Some(text) => {
                            let _ = sink.send(Message::Text(text.into())).await;
                        }
                        None => return,
                    }
                }
            }
        }
    });

    FakeRealtime {
        endpoint: format!("ws://{}", addr),
        received,
        inject,
    }
}

#[derive(Default)]
struct TestEvents {
    user_finals: Mutex<Vec<String>>,
    speech_starts: AtomicUsize,
    started: AtomicUsize,
    closed: AtomicUsize,
}

impl BridgeEvents for TestEvents {
    fn resolve_call_id_by_token(&self, token: &str) -> Option<String> {
        (token == "tok").then(|| "call-1".to_string())
    }

    fn resolve_provider_call_id(&self, provider_call_id: &str) -> Option<String> {
        (provider_call_id == "CA900").then(|| "call-1".to_string())
    }

    fn should_accept_stream(&self, accept: &StreamAccept) -> bool {
        accept.call_id == "call-1"
    }

    fn session_params(&self, _call_id: &str) -> SessionParams {
        SessionParams {
            mode: RealtimeMode::Transcription,
            instructions: None,
            voice: "alloy".into(),
            force_opening: None,
        }
    }

    fn on_stream_started(&self, _call_id: &str, _stream_sid: &str) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_user_final(&self, _call_id: &str, text: &str) {
        self.user_finals.lock().unwrap().push(text.to_string());
    }

    fn on_speech_start(&self, _call_id: &str) {
        self.speech_starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_assistant_final(&self, _call_id: &str, _text: &str) {}

    fn on_stream_closed(&self, _call_id: &str, _reason: &str) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_realtime_lost(&self, _call_id: &str, _reason: &str) {}
}

/// One second of silence per utterance (fifty 160-byte frames), counting
/// synthesis calls.
const FAKE_TTS_FRAMES: usize = 50;

struct FakeTts {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl TelephonyTts for FakeTts {
    fn provider_name(&self) -> &'static str {
        "fake"
    }

    async fn synthesize(&self, _text: &str) -> clawline::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0xFFu8; audio::FRAME_BYTES * FAKE_TTS_FRAMES])
    }
}

struct Harness {
    bridge: Arc<MediaBridge>,
    events: Arc<TestEvents>,
    tts: Arc<FakeTts>,
    fake: FakeRealtime,
    /// Carrier-side frames received from the bridge.
    carrier_rx: mpsc::UnboundedReceiver<serde_json::Value>,
    carrier_tx: mpsc::UnboundedSender<Message>,
}

async fn start_harness() -> Harness {
    let fake = spawn_fake_realtime().await;
    let realtime = RealtimeConfig {
        api_key: None,
        endpoint: fake.endpoint.clone(),
        ..Default::default()
    };

    let bridge = MediaBridge::new(MediaTransport::FramedJson, realtime);
    let events = Arc::new(TestEvents::default());
    let tts = Arc::new(FakeTts {
        calls: AtomicUsize::new(0),
    });
    bridge.set_events(events.clone());
    bridge.set_tts(Some(tts.clone()));

    // Carrier socket: a real WS handshake over an in-memory duplex pipe.
    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let _ = bridge.handle_upgrade(server_io).await;
        });
    }
    let (ws, _) = tokio_tungstenite::client_async("ws://carrier.test/voice/stream", client_io)
        .await
        .unwrap();
    let (mut sink, mut source) = ws.split();

    // Carrier reader: parse every text frame into JSON for assertions.
    let (carrier_json_tx, carrier_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(Ok(msg)) = source.next().await {
            if let Message::Text(text) = msg {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                    let _ = carrier_json_tx.send(value);
                }
            }
        }
    });
    // Carrier writer.
    let (carrier_tx, mut carrier_out) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = carrier_out.recv().await {
            if sink.send(msg).await.is_err() {
                return;
            }
        }
    });

    Harness {
        bridge,
        events,
        tts,
        fake,
        carrier_rx,
        carrier_tx,
    }
}

fn text_frame(value: serde_json::Value) -> Message {
    Message::Text(value.to_string().into())
}

async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<serde_json::Value>,
    wanted: &str,
) -> serde_json::Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let value = rx.recv().await.expect("carrier socket closed");
            if value["event"] == wanted {
                return value;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no '{}' frame within 5s", wanted))
}

async fn send_start(harness: &Harness) {
    harness
        .carrier_tx
        .send(text_frame(serde_json::json!({"event": "connected"})))
        .unwrap();
    harness
        .carrier_tx
        .send(text_frame(serde_json::json!({
            "event": "start",
            "start": {
                "streamSid": "MZ1",
                "customParameters": { "callId": "call-1" },
                "mediaFormat": { "encoding": "audio/x-mulaw", "sampleRate": 8000 }
            }
        })))
        .unwrap();
}

#[tokio::test]
async fn framed_stream_wires_into_realtime_session() {
    let mut harness = start_harness().await;
    send_start(&harness).await;

    // The bridge acknowledges with a server-originated start frame.
    let ack = next_event(&mut harness.carrier_rx, "start").await;
    assert_eq!(ack["streamSid"], "MZ1");
    assert_eq!(harness.events.started.load(Ordering::SeqCst), 1);

    // Carrier media is forwarded to the model unbuffered.
    let payload = audio::encode_payload(&[0x55u8; audio::FRAME_BYTES]);
    harness
        .carrier_tx
        .send(text_frame(serde_json::json!({
            "event": "media",
            "media": { "payload": payload }
        })))
        .unwrap();

    let appended = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let value = harness.fake.received.recv().await.unwrap();
            if value["type"] == "input_audio_buffer.append" {
                return value;
            }
        }
    })
    .await
    .expect("model never saw the audio");
    assert_eq!(
        audio::decode_payload(appended["audio"].as_str().unwrap())
            .unwrap()
            .len(),
        audio::FRAME_BYTES
    );

    // A final user transcript reaches the event sink.
    harness
        .fake
        .inject
        .send(
            serde_json::json!({
                "type": "conversation.item.input_audio_transcription.completed",
                "transcript": "Добрый вечер"
            })
            .to_string(),
        )
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if harness
                .events
                .user_finals
                .lock()
                .unwrap()
                .contains(&"Добрый вечер".to_string())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transcript never delivered");
}

#[tokio::test]
async fn barge_in_stops_playback_and_skips_queued_ops() {
    let mut harness = start_harness().await;
    send_start(&harness).await;
    next_event(&mut harness.carrier_rx, "start").await;

    let first = harness.bridge.enqueue_speak("MZ1", "Здравствуйте, я по поводу брони".into());
    let second = harness.bridge.enqueue_speak("MZ1", "Вторая реплика".into());

    // Wait for the first op to emit a few media frames.
    for _ in 0..3 {
        next_event(&mut harness.carrier_rx, "media").await;
    }

    harness.bridge.clear_tts_queue("MZ1");

    // Both promises resolve (never reject) as cancelled.
    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, PlayOutcome::Cancelled);
    assert_eq!(second, PlayOutcome::Cancelled);

    // The queued op never ran: only one synthesis happened.
    assert_eq!(harness.tts.calls.load(Ordering::SeqCst), 1);

    // A clear frame went to the carrier, and no media follows it.
    next_event(&mut harness.carrier_rx, "clear").await;
    let trailing_media = tokio::time::timeout(Duration::from_millis(250), async {
        loop {
            let value = harness.carrier_rx.recv().await.unwrap();
            if value["event"] == "media" {
                return value;
            }
        }
    })
    .await;
    assert!(trailing_media.is_err(), "media frame after clear: {:?}", trailing_media);
}

#[tokio::test]
async fn speech_start_triggers_barge_in() {
    let mut harness = start_harness().await;
    send_start(&harness).await;
    next_event(&mut harness.carrier_rx, "start").await;

    let playing = harness.bridge.enqueue_speak("MZ1", "Долгая реплика".into());
    next_event(&mut harness.carrier_rx, "media").await;

    // Server VAD: the peer starts talking over the bot.
    harness
        .fake
        .inject
        .send(serde_json::json!({"type": "input_audio_buffer.speech_started"}).to_string())
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), playing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, PlayOutcome::Cancelled);
    assert_eq!(harness.events.speech_starts.load(Ordering::SeqCst), 1);
    next_event(&mut harness.carrier_rx, "clear").await;
}

#[tokio::test]
async fn tts_ops_play_in_enqueue_order() {
    let mut harness = start_harness().await;
    send_start(&harness).await;
    next_event(&mut harness.carrier_rx, "start").await;

    let first = harness.bridge.enqueue_speak("MZ1", "раз".into());
    let second = harness.bridge.enqueue_speak("MZ1", "два".into());

    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first, PlayOutcome::Completed);
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(second, PlayOutcome::Completed);

    // Two utterances, every frame delivered, in order.
    assert_eq!(harness.tts.calls.load(Ordering::SeqCst), 2);
    let mut media_count = 0;
    while let Ok(value) =
        tokio::time::timeout(Duration::from_millis(100), harness.carrier_rx.recv()).await
    {
        if value.map(|v| v["event"] == "media").unwrap_or(false) {
            media_count += 1;
        }
    }
    assert_eq!(media_count, FAKE_TTS_FRAMES * 2);
}

#[tokio::test]
async fn unresolvable_identity_is_closed_with_policy_violation() {
    let fake = spawn_fake_realtime().await;
    let realtime = RealtimeConfig {
        api_key: None,
        endpoint: fake.endpoint.clone(),
        ..Default::default()
    };
    let bridge = MediaBridge::new(MediaTransport::FramedJson, realtime);
    bridge.set_events(Arc::new(TestEvents::default()));

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let _ = bridge.handle_upgrade(server_io).await;
        });
    }
    let (ws, _) = tokio_tungstenite::client_async("ws://carrier.test/voice/stream", client_io)
        .await
        .unwrap();
    let (mut sink, mut source) = ws.split();

    // A start frame with no identity at all.
    sink.send(text_frame(serde_json::json!({
        "event": "start",
        "start": { "streamSid": "MZ9", "customParameters": {} }
    })))
    .await
    .unwrap();

    let close = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(msg)) = source.next().await {
            if let Message::Close(frame) = msg {
                return frame;
            }
        }
        None
    })
    .await
    .expect("no close frame");
    let frame = close.expect("close frame carries a code");
    assert_eq!(u16::from(frame.code), 1008);
}
