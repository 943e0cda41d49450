//! Deterministic in-process provider. No network; dial results are
//! numbered sequentially and every control command is recorded so tests
//! and the CLI demo path can observe them.

use super::{
    constant_time_eq, mint_stream_token, stream_url, CallRef, EndReason, EventKind,
    InitiateCallInput, InitiatedCall, MediaTransport, NormalizedEvent, ParsedWebhook,
    ProviderAdapter, WebhookContext, WebhookVerdict,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A control command the mock observed.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCommand {
    Hangup { call_id: String },
    PlayTts { call_id: String, text: String },
    StartListening { call_id: String },
    StopListening { call_id: String },
}

#[derive(Default)]
pub struct MockProvider {
    counter: AtomicU64,
    pub commands: Mutex<Vec<MockCommand>>,
    public_url: std::sync::RwLock<String>,
    stream_tokens: DashMap<String, String>,
    /// When set, `initiate_call` fails with this provider error status.
    pub fail_initiate: Mutex<Option<u16>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<MockCommand> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderAdapter for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn media_transport(&self) -> MediaTransport {
        MediaTransport::FramedJson
    }

    fn verify_webhook(&self, _ctx: &WebhookContext) -> WebhookVerdict {
        WebhookVerdict::ok()
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<ParsedWebhook> {
        // The mock accepts its own normalized vocabulary directly.
        let value: serde_json::Value = serde_json::from_slice(&ctx.raw_body)
            .map_err(|e| Error::BadPayload(format!("mock webhook: {}", e)))?;
        let event = value["event"]
            .as_str()
            .ok_or_else(|| Error::BadPayload("missing event".into()))?;
        let provider_call_id = value["providerCallId"]
            .as_str()
            .ok_or_else(|| Error::BadPayload("missing providerCallId".into()))?;

        let kind = match event {
            "ringing" => EventKind::Ringing,
            "answered" => EventKind::Answered,
            "speech" => EventKind::Speech {
                transcript: value["transcript"].as_str().unwrap_or_default().to_string(),
                is_final: value["isFinal"].as_bool().unwrap_or(true),
                confidence: None,
            },
            "ended" => EventKind::Ended {
                reason: EndReason::from_provider(value["reason"].as_str().unwrap_or("completed")),
            },
            other => return Err(Error::BadPayload(format!("unknown mock event '{}'", other))),
        };
        Ok(ParsedWebhook::events(vec![
            NormalizedEvent::new(kind).with_provider_call_id(provider_call_id),
        ]))
    }

    async fn initiate_call(&self, input: &InitiateCallInput) -> Result<InitiatedCall> {
        if let Some(status) = *self.fail_initiate.lock().unwrap() {
            return Err(Error::ProviderError {
                status,
                body: "mock dial failure".into(),
            });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = input;
        Ok(InitiatedCall {
            provider_call_id: format!("MOCK-{}", n),
            status: "initiating".into(),
        })
    }

    async fn hangup_call(&self, call: &CallRef) -> Result<()> {
        self.commands.lock().unwrap().push(MockCommand::Hangup {
            call_id: call.call_id.clone(),
        });
        Ok(())
    }

    async fn play_tts(&self, call: &CallRef, text: &str) -> Result<()> {
        self.commands.lock().unwrap().push(MockCommand::PlayTts {
            call_id: call.call_id.clone(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn start_listening(&self, call: &CallRef) -> Result<()> {
        self.commands
            .lock()
            .unwrap()
            .push(MockCommand::StartListening {
                call_id: call.call_id.clone(),
            });
        Ok(())
    }

    async fn stop_listening(&self, call: &CallRef) -> Result<()> {
        self.commands
            .lock()
            .unwrap()
            .push(MockCommand::StopListening {
                call_id: call.call_id.clone(),
            });
        Ok(())
    }

    fn set_public_url(&self, url: &str) {
        *self.public_url.write().unwrap() = url.trim_end_matches('/').to_string();
    }

    fn register_call_stream(&self, call_id: &str) -> Option<String> {
        let token = mint_stream_token();
        let origin = self.public_url.read().unwrap().clone();
        let url = stream_url(&origin, "/voice/stream", &token);
        self.stream_tokens.insert(call_id.to_string(), token);
        Some(url)
    }

    fn is_valid_stream_token(&self, call_id: &str, token: &str) -> bool {
        match self.stream_tokens.get(call_id) {
            Some(expected) => constant_time_eq(token, expected.value()),
            None => constant_time_eq(token, ""),
        }
    }

    fn resolve_call_id_by_token(&self, token: &str) -> Option<String> {
        self.stream_tokens
            .iter()
            .find(|entry| constant_time_eq(token, entry.value()))
            .map(|entry| entry.key().clone())
    }
}
