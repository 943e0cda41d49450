//! Media-stream bridge.
//!
//! Accepts carrier WebSocket upgrades and mediates between the carrier's
//! media framing and the realtime speech session. Two transports:
//!
//! - **Framed JSON** (Twilio-style): `{event: connected|start|media|stop|
//!   mark|clear}` envelopes with base64 μ-law payloads. Identity arrives in
//!   the `start` frame's custom parameters.
//! - **Raw binary** (Voximplant-style): binary frames are raw μ-law;
//!   identity is the query-string stream token.
//!
//! The bridge owns both the media socket and the realtime session for each
//! stream: closing either closes the other and the call transitions.

pub mod tts_queue;

pub use tts_queue::{PlayOutcome, PlayResult, TtsQueue};

use crate::audio;
use crate::config::RealtimeConfig;
use crate::error::{Error, Result};
use crate::providers::MediaTransport;
use crate::realtime::{RealtimeEvent, RealtimeSession, SessionParams};
use crate::tts::TelephonyTts;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long the bridge waits for the framed-JSON `start` envelope.
const START_FRAME_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity facts for an incoming stream, pre-acceptance.
#[derive(Debug, Clone)]
pub struct StreamAccept {
    pub call_id: String,
    pub stream_sid: Option<String>,
    pub token: Option<String>,
}

/// The bridge's view of the rest of the system. Implemented by the runtime
/// over the call manager and the provider adapter.
pub trait BridgeEvents: Send + Sync {
    /// Reverse-resolve a stream token (raw-binary transport).
    fn resolve_call_id_by_token(&self, token: &str) -> Option<String>;

    /// Map a carrier call id from the start frame to the local call id.
    fn resolve_provider_call_id(&self, provider_call_id: &str) -> Option<String>;

    /// Final gate before a stream is wired up.
    fn should_accept_stream(&self, accept: &StreamAccept) -> bool;

    /// Per-call realtime session parameters.
    fn session_params(&self, call_id: &str) -> SessionParams;

    fn on_stream_started(&self, call_id: &str, stream_sid: &str);
    fn on_user_final(&self, call_id: &str, text: &str);
    fn on_speech_start(&self, call_id: &str);
    fn on_assistant_final(&self, call_id: &str, text: &str);
    /// Media socket closed (peer hangup path).
    fn on_stream_closed(&self, call_id: &str, reason: &str);
    /// Realtime session lost for good; terminal in conversation mode.
    fn on_realtime_lost(&self, call_id: &str, reason: &str);
}

struct StreamHandle {
    call_id: String,
    out_tx: mpsc::UnboundedSender<Message>,
    session: Arc<RealtimeSession>,
}

pub struct MediaBridge {
    transport: MediaTransport,
    realtime: RealtimeConfig,
    tts_queue: Arc<TtsQueue>,
    tts: RwLock<Option<Arc<dyn TelephonyTts>>>,
    events: RwLock<Option<Arc<dyn BridgeEvents>>>,
    streams: DashMap<String, StreamHandle>,
}

impl MediaBridge {
    pub fn new(transport: MediaTransport, realtime: RealtimeConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            realtime,
            tts_queue: TtsQueue::new(),
            tts: RwLock::new(None),
            events: RwLock::new(None),
            streams: DashMap::new(),
        })
    }

    pub fn set_events(&self, events: Arc<dyn BridgeEvents>) {
        *self.events.write().unwrap() = Some(events);
    }

    /// Telephony TTS adapter. Left unset in realtime-conversation mode,
    /// where the session owns assistant audio.
    pub fn set_tts(&self, tts: Option<Arc<dyn TelephonyTts>>) {
        *self.tts.write().unwrap() = tts;
    }

    pub fn has_tts(&self) -> bool {
        self.tts.read().unwrap().is_some()
    }

    fn events(&self) -> Option<Arc<dyn BridgeEvents>> {
        self.events.read().unwrap().clone()
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    /// Accept a carrier WebSocket upgrade on a raw socket and run the
    /// stream to completion.
    pub async fn handle_upgrade<S>(self: Arc<Self>, raw: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let captured_uri: Arc<std::sync::Mutex<Option<String>>> =
            Arc::new(std::sync::Mutex::new(None));
        let uri_slot = captured_uri.clone();
        let ws = tokio_tungstenite::accept_hdr_async(raw, move |req: &Request, resp: Response| {
            *uri_slot.lock().unwrap() = Some(req.uri().to_string());
            Ok(resp)
        })
        .await
        .map_err(|e| Error::other(format!("ws accept: {}", e)))?;

        let query = captured_uri
            .lock()
            .unwrap()
            .as_deref()
            .map(parse_query)
            .unwrap_or_default();
        self.run_connection(ws, query).await
    }

    async fn run_connection<S>(
        self: Arc<Self>,
        ws: WebSocketStream<S>,
        query: HashMap<String, String>,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut source) = ws.split();
        let token = query.get("token").cloned();

        // Resolve identity per transport, closing 1008 when it cannot be
        // established or the stream is rejected.
        let (call_id, stream_sid, start_ack) = match self.transport {
            MediaTransport::RawBinary => {
                let resolved = token
                    .as_deref()
                    .and_then(|t| self.events()?.resolve_call_id_by_token(t));
                match resolved {
                    Some(call_id) => {
                        let sid = call_id.clone();
                        (call_id, sid, false)
                    }
                    None => {
                        close_policy(&mut sink, "unresolved stream identity").await;
                        return Err(Error::UnauthorizedWebhook("bad stream token".into()));
                    }
                }
            }
            MediaTransport::FramedJson => {
                match self.read_start_frame(&mut source, token.as_deref()).await {
                    Ok((call_id, stream_sid)) => (call_id, stream_sid, true),
                    Err(e) => {
                        close_policy(&mut sink, "unresolved stream identity").await;
                        return Err(e);
                    }
                }
            }
        };

        let accept = StreamAccept {
            call_id: call_id.clone(),
            stream_sid: Some(stream_sid.clone()),
            token,
        };
        let Some(events) = self.events() else {
            close_policy(&mut sink, "bridge not wired").await;
            return Err(Error::other("bridge has no event sink"));
        };
        if !events.should_accept_stream(&accept) {
            close_policy(&mut sink, "stream rejected").await;
            return Err(Error::UnauthorizedWebhook("stream rejected".into()));
        }

        // The session is established before the carrier starts pushing
        // inbound audio in earnest.
        let params = events.session_params(&call_id);
        let (session, session_rx) = RealtimeSession::connect(&self.realtime, params).await?;
        let session = Arc::new(session);

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        self.streams.insert(
            stream_sid.clone(),
            StreamHandle {
                call_id: call_id.clone(),
                out_tx: out_tx.clone(),
                session: session.clone(),
            },
        );

        // Writer task: single owner of the sink half.
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || is_close {
                    break;
                }
            }
        });

        // Server-originated start acknowledgement so the provider begins
        // playing inbound audio.
        if start_ack {
            let ack = serde_json::json!({
                "event": "start",
                "streamSid": stream_sid,
            });
            let _ = out_tx.send(Message::Text(ack.to_string().into()));
        }

        info!(%call_id, %stream_sid, "media stream established");
        events.on_stream_started(&call_id, &stream_sid);

        // Session event pump (transcripts, barge-in, assistant audio).
        let pump = {
            let bridge = self.clone();
            let call_id = call_id.clone();
            let stream_sid = stream_sid.clone();
            let events = events.clone();
            tokio::spawn(async move {
                bridge.pump_session(call_id, stream_sid, session_rx, events).await;
            })
        };

        // Media read loop: carrier -> session, no buffering.
        let close_reason = loop {
            match source.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    if self.transport == MediaTransport::RawBinary {
                        session.send_audio(bytes.to_vec());
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    if self.transport == MediaTransport::FramedJson {
                        match serde_json::from_str::<FramedMessage>(&text) {
                            Ok(frame) => match frame.event.as_str() {
                                "media" => {
                                    if let Some(payload) =
                                        frame.media.and_then(|m| audio::decode_payload(&m.payload))
                                    {
                                        session.send_audio(payload);
                                    }
                                }
                                "stop" => break "stop frame".to_string(),
                                _ => {}
                            },
                            Err(e) => debug!(error = %e, "ignoring unparseable media frame"),
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|f| format!("close {}", f.code))
                        .unwrap_or_else(|| "close".into());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
                None => break "stream ended".into(),
            }
        };

        // Closing the media socket also closes the realtime session.
        session.close();
        self.streams.remove(&stream_sid);
        self.tts_queue.remove_stream(&stream_sid);
        let _ = out_tx.send(Message::Close(None));
        pump.abort();
        let _ = writer.await;
        info!(%call_id, %stream_sid, reason = %close_reason, "media stream closed");
        events.on_stream_closed(&call_id, &close_reason);
        Ok(())
    }

    /// Framed-JSON transport: wait for `start` and resolve the call id from
    /// its custom parameters, falling back to the query token.
    async fn read_start_frame<S>(
        &self,
        source: &mut futures_util::stream::SplitStream<WebSocketStream<S>>,
        token: Option<&str>,
    ) -> Result<(String, String)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = tokio::time::sleep(START_FRAME_TIMEOUT);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(Error::RequestTimeout);
                }
                msg = source.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::other("socket closed before start frame"));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(Error::other(e.to_string())),
                    };
                    let frame: FramedMessage = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(_) => continue,
                    };
                    if frame.event != "start" {
                        continue;
                    }
                    let start = frame.start.unwrap_or_default();
                    let stream_sid = start
                        .stream_sid
                        .or(frame.stream_sid)
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

                    let events = self.events();
                    let params = &start.custom_parameters;
                    let call_id = params
                        .get("callId")
                        .cloned()
                        .or_else(|| {
                            let provider_id = params
                                .get("callSid")
                                .or_else(|| params.get("providerCallId"))
                                .or_else(|| params.get("call_session_history_id"))?;
                            events.as_ref()?.resolve_provider_call_id(provider_id)
                        })
                        .or_else(|| {
                            events.as_ref()?.resolve_call_id_by_token(token?)
                        });
                    return match call_id {
                        Some(call_id) => Ok((call_id, stream_sid)),
                        None => Err(Error::UnauthorizedWebhook(
                            "no call identity in start frame".into(),
                        )),
                    };
                }
            }
        }
    }

    async fn pump_session(
        self: Arc<Self>,
        call_id: String,
        stream_sid: String,
        mut rx: mpsc::UnboundedReceiver<RealtimeEvent>,
        events: Arc<dyn BridgeEvents>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                RealtimeEvent::UserFinal(text) => events.on_user_final(&call_id, &text),
                RealtimeEvent::UserPartial(_) | RealtimeEvent::AssistantPartial(_) => {}
                RealtimeEvent::SpeechStart => {
                    // Barge-in: kill any bot audio still in flight.
                    self.clear_tts_queue(&stream_sid);
                    events.on_speech_start(&call_id);
                }
                RealtimeEvent::AssistantAudio(bytes) => {
                    if let Err(e) = self.send_audio(&stream_sid, &bytes) {
                        debug!(error = %e, "dropping assistant audio for closed stream");
                    }
                }
                RealtimeEvent::AssistantFinal(text) => {
                    events.on_assistant_final(&call_id, &text)
                }
                RealtimeEvent::Closed { reason } => {
                    events.on_realtime_lost(&call_id, &reason);
                    // Session gone for good: release the media socket too.
                    if let Some(handle) = self.streams.get(&stream_sid) {
                        let _ = handle.out_tx.send(Message::Close(None));
                    }
                    return;
                }
            }
        }
    }

    /// Emit μ-law audio to the carrier on this stream.
    pub fn send_audio(&self, stream_sid: &str, mulaw: &[u8]) -> Result<()> {
        let handle = self
            .streams
            .get(stream_sid)
            .ok_or_else(|| Error::other(format!("no stream {}", stream_sid)))?;
        let msg = match self.transport {
            MediaTransport::FramedJson => Message::Text(
                serde_json::json!({
                    "event": "media",
                    "streamSid": stream_sid,
                    "media": { "payload": audio::encode_payload(mulaw) },
                })
                .to_string()
                .into(),
            ),
            MediaTransport::RawBinary => Message::Binary(mulaw.to_vec().into()),
        };
        handle
            .out_tx
            .send(msg)
            .map_err(|_| Error::other("stream writer gone"))
    }

    pub fn send_mark(&self, stream_sid: &str, name: &str) -> Result<()> {
        let handle = self
            .streams
            .get(stream_sid)
            .ok_or_else(|| Error::other(format!("no stream {}", stream_sid)))?;
        let msg = serde_json::json!({
            "event": "mark",
            "streamSid": stream_sid,
            "mark": { "name": name },
        });
        handle
            .out_tx
            .send(Message::Text(msg.to_string().into()))
            .map_err(|_| Error::other("stream writer gone"))
    }

    /// Tell the carrier to flush any buffered bot audio.
    pub fn clear_audio(&self, stream_sid: &str) -> Result<()> {
        let handle = self
            .streams
            .get(stream_sid)
            .ok_or_else(|| Error::other(format!("no stream {}", stream_sid)))?;
        let msg = serde_json::json!({
            "event": "clear",
            "streamSid": stream_sid,
        });
        handle
            .out_tx
            .send(Message::Text(msg.to_string().into()))
            .map_err(|_| Error::other("stream writer gone"))
    }

    /// Abort in-flight playback, drop the queue, and emit a clear frame.
    pub fn clear_tts_queue(&self, stream_sid: &str) {
        self.tts_queue.clear(stream_sid);
        if let Err(e) = self.clear_audio(stream_sid) {
            debug!(error = %e, "clear frame not delivered");
        }
    }

    /// Queue a synthesized utterance for serialized playback.
    pub fn enqueue_speak(
        self: &Arc<Self>,
        stream_sid: &str,
        text: String,
    ) -> oneshot::Receiver<PlayResult> {
        let bridge = self.clone();
        let sid = stream_sid.to_string();
        self.tts_queue.enqueue_fn(stream_sid, move |cancel| async move {
            let tts = bridge
                .tts
                .read()
                .unwrap()
                .clone()
                .ok_or_else(|| Error::TtsUnavailable("no telephony tts adapter".into()))?;
            let mulaw = tts.synthesize(&text).await?;
            bridge.play_frames(&sid, &mulaw, &cancel).await
        })
    }

    /// Pace μ-law playout at real time: one 160-byte frame per 20 ms,
    /// checking the abort signal before each chunk and after each sleep.
    pub async fn play_frames(
        &self,
        stream_sid: &str,
        mulaw: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        for frame in audio::chunk(mulaw, audio::FRAME_BYTES) {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.send_audio(stream_sid, frame)?;
            tokio::time::sleep(audio::FRAME_INTERVAL).await;
            if cancel.is_cancelled() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Stream sid for a live call, if its media socket is up.
    pub fn stream_for_call(&self, call_id: &str) -> Option<String> {
        self.streams
            .iter()
            .find(|entry| entry.value().call_id == call_id)
            .map(|entry| entry.key().clone())
    }

    /// Force-close every live stream (shutdown path).
    pub fn close_all(&self) {
        for entry in self.streams.iter() {
            let _ = entry.value().out_tx.send(Message::Close(None));
            entry.value().session.close();
        }
    }
}

async fn close_policy<S>(
    sink: &mut futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
    reason: &str,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // 1008: policy violation.
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: reason.to_string().into(),
        })))
        .await;
}

fn parse_query(uri: &str) -> HashMap<String, String> {
    let Some(query) = uri.splitn(2, '?').nth(1) else {
        return HashMap::new();
    };
    query
        .split('&')
        .filter_map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or_default();
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

#[derive(Debug, Default, Deserialize)]
struct FramedMessage {
    #[serde(default)]
    event: String,
    #[serde(rename = "streamSid")]
    stream_sid: Option<String>,
    start: Option<StartFrame>,
    media: Option<MediaFrame>,
}

#[derive(Debug, Default, Deserialize)]
struct StartFrame {
    #[serde(rename = "streamSid")]
    stream_sid: Option<String>,
    #[serde(rename = "customParameters", default)]
    custom_parameters: HashMap<String, String>,
    #[serde(rename = "mediaFormat")]
    #[allow(dead_code)]
    media_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MediaFrame {
    payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_handles_tokens() {
        let query = parse_query("/voice/stream?token=abc%2B1&x=2");
        assert_eq!(query.get("token").unwrap(), "abc+1");
        assert_eq!(query.get("x").unwrap(), "2");
        assert!(parse_query("/voice/stream").is_empty());
    }

    #[test]
    fn framed_start_parses_custom_parameters() {
        let text = serde_json::json!({
            "event": "start",
            "start": {
                "streamSid": "MZ123",
                "customParameters": { "callId": "call-7" },
                "mediaFormat": { "encoding": "audio/x-mulaw", "sampleRate": 8000 }
            }
        })
        .to_string();
        let frame: FramedMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(frame.event, "start");
        let start = frame.start.unwrap();
        assert_eq!(start.stream_sid.as_deref(), Some("MZ123"));
        assert_eq!(start.custom_parameters.get("callId").unwrap(), "call-7");
    }

    #[test]
    fn framed_media_payload_round_trips() {
        let payload = audio::encode_payload(&[0x7F; 160]);
        let text = serde_json::json!({
            "event": "media",
            "media": { "payload": payload }
        })
        .to_string();
        let frame: FramedMessage = serde_json::from_str(&text).unwrap();
        let media = frame.media.unwrap();
        assert_eq!(audio::decode_payload(&media.payload).unwrap().len(), 160);
    }
}
