//! Realtime speech-model session.
//!
//! One WebSocket session per call, in one of two modes. Transcription mode
//! turns carrier audio into user transcripts and VAD speech-start
//! notifications. Conversation mode additionally produces assistant audio
//! (μ-law frames) and assistant transcripts, driven by a per-call system
//! prompt.
//!
//! Consumers get a single stream of [`RealtimeEvent`] variants instead of
//! per-callback registration, so nothing ever swaps a callback mid-call.
//!
//! Reconnect policy: transcription mode retries with exponential backoff
//! (up to 5 attempts); conversation mode never reconnects, because the
//! model keeps no session state across sockets and resumption would desync
//! the dialog. The call proceeds toward hangup instead.

use crate::audio;
use crate::config::RealtimeConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames buffered toward the model socket before drops begin.
const AUDIO_QUEUE_FRAMES: usize = 64;

/// Session operating mode, chosen per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeMode {
    Transcription,
    Conversation,
}

/// Everything a session can tell its consumer.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    UserPartial(String),
    UserFinal(String),
    /// Server VAD noticed the peer speaking; any buffered partial user
    /// transcript has been discarded.
    SpeechStart,
    AssistantPartial(String),
    AssistantFinal(String),
    /// μ-law assistant audio ready for the carrier.
    AssistantAudio(Vec<u8>),
    /// The session is gone for good (conversation-mode close, or
    /// transcription-mode reconnects exhausted).
    Closed { reason: String },
}

/// Per-call session parameters.
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub mode: RealtimeMode,
    /// Per-call system prompt (conversation mode).
    pub instructions: Option<String>,
    pub voice: String,
    /// One-time per-response instruction to force the opening line.
    pub force_opening: Option<String>,
}

/// Handle to a live session. Dropping it does not close the socket; call
/// [`RealtimeSession::close`].
pub struct RealtimeSession {
    audio_tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
    dropped_frames: AtomicU64,
}

impl RealtimeSession {
    /// Open a session and spawn its supervisor. Resolves only after the
    /// server confirmed the session configuration (bounded by 5 s with a
    /// warning on expiry), which prevents the model starting its first
    /// response under default instructions and resetting mid-utterance.
    pub async fn connect(
        config: &RealtimeConfig,
        params: SessionParams,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RealtimeEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_FRAMES);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let supervisor = Supervisor {
            config: config.clone(),
            params,
            event_tx,
            connected: connected.clone(),
            shutdown: shutdown.clone(),
        };
        supervisor.spawn(audio_rx).await?;

        Ok((
            Self {
                audio_tx,
                connected,
                shutdown,
                dropped_frames: AtomicU64::new(0),
            },
            event_rx,
        ))
    }

    /// Append carrier audio. No-op when not connected. Frames are dropped
    /// rather than buffered unboundedly when the socket cannot keep up;
    /// the first and every 100th drop are logged.
    pub fn send_audio(&self, bytes: Vec<u8>) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        if self.audio_tx.try_send(bytes).is_err() {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                warn!(dropped, "realtime socket backpressure, dropping audio frames");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

struct Supervisor {
    config: RealtimeConfig,
    params: SessionParams,
    event_tx: mpsc::UnboundedSender<RealtimeEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Establish the first connection inline (so `connect` can fail fast),
    /// then keep the session alive per the reconnect policy.
    async fn spawn(self, mut audio_rx: mpsc::Receiver<Vec<u8>>) -> Result<()> {
        let mut conn = Connection::open(&self.config, &self.params, true).await?;
        self.connected.store(true, Ordering::Relaxed);

        tokio::spawn(async move {
            let policy = RetryPolicy::realtime_reconnect();
            let mut attempts: u32 = 0;
            loop {
                let end = conn.run(&mut audio_rx, &self.event_tx, &self.shutdown).await;
                self.connected.store(false, Ordering::Relaxed);

                let reason = match end {
                    ConnectionEnd::Shutdown => return,
                    ConnectionEnd::Closed(reason) => reason,
                };

                if self.params.mode == RealtimeMode::Conversation {
                    // Server-side dialog state is not preserved; resuming
                    // would desync. The call proceeds toward hangup.
                    info!(%reason, "conversation realtime socket closed, not reconnecting");
                    let _ = self.event_tx.send(RealtimeEvent::Closed { reason });
                    return;
                }

                attempts += 1;
                if attempts >= policy.max_attempts {
                    warn!(attempts, "realtime reconnect attempts exhausted");
                    let _ = self.event_tx.send(RealtimeEvent::Closed { reason });
                    return;
                }
                let delay = policy.with_jitter(policy.backoff_delay(attempts));
                debug!(attempt = attempts, ?delay, "reconnecting realtime session");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => return,
                }
                match Connection::open(&self.config, &self.params, false).await {
                    Ok(next) => {
                        attempts = 0;
                        self.connected.store(true, Ordering::Relaxed);
                        conn = next;
                    }
                    Err(e) => {
                        warn!(error = %e, attempt = attempts, "realtime reconnect failed");
                        conn = match Self::retry_open(&self.config, &self.params, &policy, &mut attempts, &self.shutdown).await {
                            Some(next) => {
                                self.connected.store(true, Ordering::Relaxed);
                                next
                            }
                            None => {
                                let _ = self.event_tx.send(RealtimeEvent::Closed {
                                    reason: "reconnect failed".into(),
                                });
                                return;
                            }
                        };
                    }
                }
            }
        });
        Ok(())
    }

    async fn retry_open(
        config: &RealtimeConfig,
        params: &SessionParams,
        policy: &RetryPolicy,
        attempts: &mut u32,
        shutdown: &CancellationToken,
    ) -> Option<Connection> {
        while *attempts < policy.max_attempts {
            *attempts += 1;
            let delay = policy.with_jitter(policy.backoff_delay(*attempts));
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return None,
            }
            match Connection::open(config, params, false).await {
                Ok(conn) => {
                    *attempts = 0;
                    return Some(conn);
                }
                Err(e) => warn!(error = %e, attempt = *attempts, "realtime reconnect failed"),
            }
        }
        None
    }
}

enum ConnectionEnd {
    Closed(String),
    Shutdown,
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Connection {
    ws: WsStream,
    mode: RealtimeMode,
}

impl Connection {
    async fn open(
        config: &RealtimeConfig,
        params: &SessionParams,
        first: bool,
    ) -> Result<Connection> {
        let url = format!("{}?model={}", config.endpoint, config.model);
        let mut request = url
            .into_client_request()
            .map_err(|e| Error::other(format!("realtime url: {}", e)))?;
        if let Some(key) = &config.api_key {
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {}", key)
                    .parse()
                    .map_err(|_| Error::other("invalid api key header"))?,
            );
        }
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse().unwrap());

        let (ws, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| Error::RealtimeDisconnected("connect timeout".into()))?
        .map_err(|e| Error::RealtimeDisconnected(e.to_string()))?;

        let mut conn = Connection {
            ws,
            mode: params.mode,
        };
        conn.configure(config, params).await?;
        if first && params.mode == RealtimeMode::Conversation {
            conn.trigger_opening(params).await?;
        }
        Ok(conn)
    }

    async fn send_json(&mut self, value: serde_json::Value) -> Result<()> {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .map_err(|e| Error::RealtimeDisconnected(e.to_string()))
    }

    /// Send `session.update` and wait for the server acknowledgement.
    async fn configure(&mut self, config: &RealtimeConfig, params: &SessionParams) -> Result<()> {
        let session = match params.mode {
            RealtimeMode::Transcription => serde_json::json!({
                "modalities": ["text"],
                "input_audio_format": "g711_ulaw",
                "input_audio_transcription": { "model": "whisper-1" },
                "turn_detection": { "type": "server_vad" },
            }),
            RealtimeMode::Conversation => serde_json::json!({
                "modalities": ["text", "audio"],
                "instructions": params.instructions.clone()
                    .or_else(|| config.instructions.clone())
                    .unwrap_or_default(),
                "voice": params.voice,
                "input_audio_format": "g711_ulaw",
                "output_audio_format": "g711_ulaw",
                "input_audio_transcription": { "model": "whisper-1" },
                "turn_detection": { "type": "server_vad" },
            }),
        };
        self.send_json(serde_json::json!({
            "type": "session.update",
            "session": session,
        }))
        .await?;

        // Do not trigger the first response until the server confirms the
        // configuration; the model would otherwise start generating under
        // default instructions and reset mid-utterance.
        let ack = tokio::time::timeout(SESSION_ACK_TIMEOUT, async {
            while let Some(msg) = self.ws.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let value: serde_json::Value =
                            serde_json::from_str(&text).unwrap_or_default();
                        if value["type"] == "session.updated" {
                            return true;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => return false,
                    _ => {}
                }
            }
            false
        })
        .await;

        match ack {
            Ok(true) => debug!("realtime session configuration acknowledged"),
            Ok(false) => {
                return Err(Error::RealtimeDisconnected(
                    "socket closed during configuration".into(),
                ))
            }
            Err(_) => warn!("no session.updated within 5s, proceeding anyway"),
        }
        Ok(())
    }

    async fn trigger_opening(&mut self, params: &SessionParams) -> Result<()> {
        let mut response = serde_json::json!({});
        if let Some(opening) = &params.force_opening {
            response["instructions"] = serde_json::Value::String(opening.clone());
        }
        self.send_json(serde_json::json!({
            "type": "response.create",
            "response": response,
        }))
        .await
    }

    async fn run(
        &mut self,
        audio_rx: &mut mpsc::Receiver<Vec<u8>>,
        event_tx: &mpsc::UnboundedSender<RealtimeEvent>,
        shutdown: &CancellationToken,
    ) -> ConnectionEnd {
        let mut user_partial = String::new();
        // Response ids whose final assistant text was already emitted;
        // guards against double emission from transcript-done + item-done.
        let mut finals_emitted: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = self.ws.send(Message::Close(None)).await;
                    return ConnectionEnd::Shutdown;
                }
                chunk = audio_rx.recv() => {
                    let Some(chunk) = chunk else {
                        return ConnectionEnd::Shutdown;
                    };
                    let append = serde_json::json!({
                        "type": "input_audio_buffer.append",
                        "audio": audio::encode_payload(&chunk),
                    });
                    if self.ws.send(Message::Text(append.to_string().into())).await.is_err() {
                        return ConnectionEnd::Closed("write failed".into());
                    }
                }
                msg = self.ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let value: serde_json::Value =
                                serde_json::from_str(&text).unwrap_or_default();
                            dispatch_event(
                                self.mode,
                                value,
                                &mut user_partial,
                                &mut finals_emitted,
                                event_tx,
                            );
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("close {}", f.code))
                                .unwrap_or_else(|| "close".into());
                            return ConnectionEnd::Closed(reason);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return ConnectionEnd::Closed(e.to_string()),
                        None => return ConnectionEnd::Closed("stream ended".into()),
                    }
                }
            }
        }
    }

}

/// Translate one server message into consumer events.
fn dispatch_event(
    mode: RealtimeMode,
    value: serde_json::Value,
    user_partial: &mut String,
    finals_emitted: &mut HashSet<String>,
    event_tx: &mpsc::UnboundedSender<RealtimeEvent>,
) {
    match value["type"].as_str().unwrap_or_default() {
        "input_audio_buffer.speech_started" => {
            // Anything buffered was superseded by new speech.
            user_partial.clear();
            let _ = event_tx.send(RealtimeEvent::SpeechStart);
        }
        "conversation.item.input_audio_transcription.delta" => {
            if let Some(delta) = value["delta"].as_str() {
                user_partial.push_str(delta);
                let _ = event_tx.send(RealtimeEvent::UserPartial(user_partial.clone()));
            }
        }
        "conversation.item.input_audio_transcription.completed" => {
            user_partial.clear();
            if let Some(transcript) = value["transcript"].as_str() {
                let transcript = transcript.trim();
                if !transcript.is_empty() {
                    let _ = event_tx.send(RealtimeEvent::UserFinal(transcript.to_string()));
                }
            }
        }
        "response.audio.delta" => {
            if mode == RealtimeMode::Conversation {
                if let Some(audio) = value["delta"].as_str().and_then(audio::decode_payload) {
                    let _ = event_tx.send(RealtimeEvent::AssistantAudio(audio));
                }
            }
        }
        "response.audio_transcript.delta" => {
            if let Some(delta) = value["delta"].as_str() {
                let _ = event_tx.send(RealtimeEvent::AssistantPartial(delta.to_string()));
            }
        }
        "response.audio_transcript.done" => {
            let response_id = value["response_id"].as_str().unwrap_or_default().to_string();
            if finals_emitted.insert(response_id) {
                if let Some(transcript) = value["transcript"].as_str() {
                    let _ = event_tx.send(RealtimeEvent::AssistantFinal(transcript.to_string()));
                }
            }
        }
        "response.output_item.done" => {
            // Assistant-final already emitted from audio_transcript.done;
            // emit here only if that signal never came for this response.
            let response_id = value["response_id"].as_str().unwrap_or_default().to_string();
            if !finals_emitted.contains(&response_id) {
                if let Some(transcript) = value["item"]["content"]
                    .as_array()
                    .and_then(|parts| parts.iter().find_map(|p| p["transcript"].as_str()))
                {
                    finals_emitted.insert(response_id);
                    let _ = event_tx.send(RealtimeEvent::AssistantFinal(transcript.to_string()));
                }
            }
        }
        "error" => {
            warn!(error = %value["error"], "realtime server error");
        }
        _ => {}
    }
}
