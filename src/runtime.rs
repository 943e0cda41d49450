//! Runtime assembly.
//!
//! Wires the provider adapter, call manager, media bridge, TTS adapter,
//! outcome pipeline, and HTTP/WS server together per configuration,
//! resolves the public URL, and exposes `stop()`.

use crate::bridge::{BridgeEvents, MediaBridge, StreamAccept};
use crate::config::{Config, ProviderKind, StreamingMode};
use crate::error::{Error, Result};
use crate::host::HostRuntime;
use crate::manager::{CallManager, CallMode};
use crate::outcome::{sanitize_task, OutcomePipeline};
use crate::providers::{
    MockProvider, PlivoProvider, ProviderAdapter, TelnyxProvider, TwilioProvider,
    VoximplantProvider,
};
use crate::realtime::{RealtimeMode, SessionParams};
use crate::server::WebhookServer;
use crate::tts;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External tunnel collaborator (ngrok-style). The bridge only consumes
/// the contract; opening and keeping the tunnel is the host's business.
#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Open a tunnel to `local_addr` and return its public URL.
    async fn open(&self, local_addr: SocketAddr) -> Result<String>;
    async fn close(&self);
}

/// Bridge-to-system wiring: stream admission and media-event fan-in.
struct BridgeWiring {
    manager: Arc<CallManager>,
    adapter: Arc<dyn ProviderAdapter>,
    realtime_voice: String,
    streaming_mode: StreamingMode,
}

impl BridgeEvents for BridgeWiring {
    fn resolve_call_id_by_token(&self, token: &str) -> Option<String> {
        self.adapter.resolve_call_id_by_token(token)
    }

    fn resolve_provider_call_id(&self, provider_call_id: &str) -> Option<String> {
        self.manager.resolve_provider_call_id(provider_call_id)
    }

    fn should_accept_stream(&self, accept: &StreamAccept) -> bool {
        let Some(record) = self.manager.get_call(&accept.call_id) else {
            return false;
        };
        if record.state.is_terminal() {
            return false;
        }
        // A supplied token must match the per-call secret.
        if let Some(token) = &accept.token {
            return self.adapter.is_valid_stream_token(&accept.call_id, token);
        }
        true
    }

    fn session_params(&self, call_id: &str) -> SessionParams {
        let record = self.manager.get_call(call_id);
        let conversation = self.streaming_mode == StreamingMode::RealtimeConversation
            && record
                .as_ref()
                .map(|r| r.metadata.mode == CallMode::Conversation)
                .unwrap_or(false);

        let instructions = record.as_ref().map(|r| {
            let task = sanitize_task(&r.metadata.prompt);
            let mut text = format!(
                "Ты звонишь по телефону по поручению пользователя. Задача: {}.",
                task
            );
            if let Some(objective) = &r.metadata.objective {
                text.push_str(&format!(" Цель: {}.", objective));
            }
            if let Some(context) = &r.metadata.context {
                text.push_str(&format!(" Контекст: {}.", context));
            }
            if let Some(language) = &r.metadata.language {
                text.push_str(&format!(" Говори на языке: {}.", language));
            }
            text.push_str(" Говори коротко и вежливо, как живой собеседник.");
            text
        });

        SessionParams {
            mode: if conversation {
                RealtimeMode::Conversation
            } else {
                RealtimeMode::Transcription
            },
            instructions,
            voice: self.realtime_voice.clone(),
            force_opening: record.as_ref().and_then(|r| {
                conversation.then(|| {
                    format!(
                        "Поздоровайся и сразу изложи задачу: {}",
                        sanitize_task(&r.metadata.prompt)
                    )
                })
            }),
        }
    }

    fn on_stream_started(&self, call_id: &str, stream_sid: &str) {
        self.manager.on_stream_started(call_id, stream_sid);
    }

    fn on_user_final(&self, call_id: &str, text: &str) {
        self.manager
            .append_transcript(call_id, crate::manager::Speaker::User, text);
    }

    fn on_speech_start(&self, call_id: &str) {
        self.manager.note_speech_start(call_id);
    }

    fn on_assistant_final(&self, call_id: &str, text: &str) {
        self.manager
            .append_transcript(call_id, crate::manager::Speaker::Assistant, text);
    }

    fn on_stream_closed(&self, call_id: &str, _reason: &str) {
        // Media socket gone: the peer (or carrier) ended the call. The
        // provider's own terminal webhook, if any, dedups behind this.
        let live = self
            .manager
            .get_call(call_id)
            .map(|r| !r.state.is_terminal())
            .unwrap_or(false);
        if live {
            self.manager
                .terminalize(call_id, crate::providers::EndReason::HangupUser);
        }
    }

    fn on_realtime_lost(&self, call_id: &str, reason: &str) {
        self.manager.on_realtime_lost(call_id, reason);
    }
}

pub struct VoiceRuntime {
    config: Config,
    manager: Arc<CallManager>,
    bridge: Arc<MediaBridge>,
    adapter: Arc<dyn ProviderAdapter>,
    public_url: String,
    cancel: CancellationToken,
    tunnel: Option<Arc<dyn TunnelProvider>>,
}

impl std::fmt::Debug for VoiceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceRuntime")
            .field("public_url", &self.public_url)
            .finish_non_exhaustive()
    }
}

impl VoiceRuntime {
    /// Assemble and start everything. Refuses to start on invalid config
    /// or missing credentials.
    pub async fn start(
        config: Config,
        host: Arc<dyn HostRuntime>,
        tunnel: Option<Arc<dyn TunnelProvider>>,
    ) -> Result<VoiceRuntime> {
        config.validate()?;
        if config.skip_signature_verification {
            warn!("WEBHOOK SIGNATURE VERIFICATION IS DISABLED; do not run this in production");
        }

        let adapter = build_adapter(&config);
        let manager = CallManager::new(
            adapter.clone(),
            config.limits.clone(),
            config.streaming.clone(),
            config.history_path.clone(),
        );
        let bridge = MediaBridge::new(adapter.media_transport(), config.realtime.clone());
        manager.set_bridge(bridge.clone());

        // In realtime-conversation mode the session owns assistant audio;
        // a separate telephony TTS adapter is deliberately not configured.
        if config.streaming.mode != StreamingMode::RealtimeConversation {
            match tts::build_adapter(&config.tts.merged(&config.tts_overrides)) {
                Ok(adapter) => bridge.set_tts(Some(adapter.into())),
                Err(Error::TtsUnavailable(reason)) => {
                    warn!(%reason, "telephony tts unavailable, provider-native speak only");
                }
                Err(e) => return Err(e),
            }
        }

        bridge.set_events(Arc::new(BridgeWiring {
            manager: manager.clone(),
            adapter: adapter.clone(),
            realtime_voice: config.realtime.voice.clone(),
            streaming_mode: config.streaming.mode,
        }));

        let listener = TcpListener::bind(&config.serve.listen).await?;
        let local_addr = listener.local_addr()?;

        let public_url =
            resolve_public_url(&config, local_addr, tunnel.as_deref()).await;
        info!(%public_url, "public url resolved");
        adapter.set_public_url(&public_url);

        let server = WebhookServer::new(
            config.clone(),
            manager.clone(),
            bridge.clone(),
            adapter.clone(),
        );
        server.set_public_url(&public_url);

        let cancel = CancellationToken::new();
        tokio::spawn(server.clone().run(listener, cancel.clone()));

        // End-of-call hook: run the outcome pipeline, then forget the call.
        let pipeline = OutcomePipeline::new(config.outcome.clone(), host);
        let weak_manager: Weak<CallManager> = Arc::downgrade(&manager);
        manager.set_on_call_ended_hook(Box::new(move |record| {
            let pipeline = pipeline.clone();
            let weak_manager = weak_manager.clone();
            tokio::spawn(async move {
                let call_id = record.call_id.clone();
                pipeline.run(&record).await;
                // The record is dropped only after the pipeline finished;
                // history was persisted at the terminal transition.
                if let Some(manager) = weak_manager.upgrade() {
                    manager.remove_call(&call_id);
                }
            });
        }));

        Ok(VoiceRuntime {
            config,
            manager,
            bridge,
            adapter,
            public_url,
            cancel,
            tunnel,
        })
    }

    pub fn manager(&self) -> Arc<CallManager> {
        self.manager.clone()
    }

    pub fn adapter(&self) -> Arc<dyn ProviderAdapter> {
        self.adapter.clone()
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Drain in-flight calls, tear down the tunnel, close the server.
    pub async fn stop(&self) {
        info!("voice runtime stopping");
        let live: Vec<String> = self
            .manager
            .get_call_history(usize::MAX)
            .into_iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| r.call_id)
            .collect();
        for call_id in live {
            let _ = self.manager.end_call(&call_id).await;
        }
        // Give outcome pipelines a bounded drain window.
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.bridge.close_all();
        if let Some(tunnel) = &self.tunnel {
            tunnel.close().await;
        }
        self.cancel.cancel();
    }
}

fn build_adapter(config: &Config) -> Arc<dyn ProviderAdapter> {
    let stream_path = config.streaming.stream_path.clone();
    let streaming = config.streaming.enabled;
    let skip = config.skip_signature_verification;
    let control_timeout = Duration::from_millis(config.limits.control_timeout_ms);
    match config.provider {
        ProviderKind::Twilio => Arc::new(TwilioProvider::new(
            config.twilio.clone(),
            stream_path,
            streaming,
            skip,
            control_timeout,
        )),
        ProviderKind::Telnyx => Arc::new(TelnyxProvider::new(
            config.telnyx.clone(),
            stream_path,
            streaming,
            skip,
            control_timeout,
        )),
        ProviderKind::Plivo => Arc::new(PlivoProvider::new(
            config.plivo.clone(),
            stream_path,
            streaming,
            skip,
            control_timeout,
        )),
        ProviderKind::Voximplant => Arc::new(VoximplantProvider::new(
            config.voximplant.clone(),
            stream_path,
            streaming,
            skip,
            control_timeout,
        )),
        ProviderKind::Mock => Arc::new(MockProvider::new()),
    }
}

/// Priority order: explicit `public_url` → tunnel → LAN exposure → local.
async fn resolve_public_url(
    config: &Config,
    local_addr: SocketAddr,
    tunnel: Option<&dyn TunnelProvider>,
) -> String {
    if let Some(url) = &config.public_url {
        return url.trim_end_matches('/').to_string();
    }
    if let Some(tunnel) = tunnel {
        match tunnel.open(local_addr).await {
            Ok(url) => return url.trim_end_matches('/').to_string(),
            Err(e) => warn!(error = %e, "tunnel failed to open, falling back"),
        }
    }
    if config.expose_lan {
        if let Some(ip) = lan_ip() {
            return format!("http://{}:{}", ip, local_addr.port());
        }
    }
    format!("http://127.0.0.1:{}", local_addr.port())
}

/// Best-effort LAN address discovery: the OS picks the outbound interface
/// for a datagram socket; no packet is actually sent.
fn lan_ip() -> Option<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() {
        None
    } else {
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;

    #[tokio::test]
    async fn runtime_starts_and_stops_with_mock_provider() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_provider(ProviderKind::Mock);
        config.serve.listen = "127.0.0.1:0".to_string();
        config.history_path = dir.path().join("calls.jsonl");
        let host = Arc::new(RecordingHost::new());

        let runtime = VoiceRuntime::start(config, host, None).await.unwrap();
        assert!(runtime.public_url().starts_with("http://127.0.0.1:"));
        runtime.stop().await;
    }

    #[tokio::test]
    async fn explicit_public_url_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_provider(ProviderKind::Mock);
        config.serve.listen = "127.0.0.1:0".to_string();
        config.public_url = Some("https://bot.example.com/".to_string());
        config.history_path = dir.path().join("calls.jsonl");
        let host = Arc::new(RecordingHost::new());

        let runtime = VoiceRuntime::start(config, host, None).await.unwrap();
        assert_eq!(runtime.public_url(), "https://bot.example.com");
        runtime.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_refuses_to_start() {
        let mut config = Config::for_provider(ProviderKind::Twilio);
        config.twilio = Default::default();
        config.twilio.account_sid = None;
        let host = Arc::new(RecordingHost::new());
        let err = VoiceRuntime::start(config, host, None).await.unwrap_err();
        assert!(matches!(err, Error::CredentialMissing(_)));
    }
}
