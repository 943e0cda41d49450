//! Carrier provider adapters.
//!
//! Each adapter translates one carrier's idioms (webhook vocabulary,
//! signature scheme, REST control plane) into the normalized event model
//! the call manager consumes. Adapters own their per-call bookkeeping maps;
//! there is no process-global registry.

use crate::error::Result;
use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod mock;
mod plivo;
mod telnyx;
mod twilio;
mod voximplant;

pub use mock::MockProvider;
pub use plivo::PlivoProvider;
pub use telnyx::TelnyxProvider;
pub use twilio::TwilioProvider;
pub use voximplant::VoximplantProvider;

/// Direction of a call relative to this bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Why a call reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Busy,
    NoAnswer,
    Voicemail,
    Timeout,
    HangupUser,
    HangupBot,
    Failed,
    Completed,
    RealtimeDisconnected,
}

impl EndReason {
    /// Map a raw provider status string onto a canonical reason.
    /// Lowercased substring match, first hit wins.
    pub fn from_provider(raw: &str) -> Self {
        let lower = raw.to_lowercase();
        if lower.contains("busy") {
            Self::Busy
        } else if lower.contains("no answer") || lower.contains("no-answer") {
            Self::NoAnswer
        } else if lower.contains("voicemail") {
            Self::Voicemail
        } else if lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("user") {
            Self::HangupUser
        } else if lower.contains("bot") {
            Self::HangupBot
        } else if lower.contains("error") || lower.contains("fail") {
            Self::Failed
        } else {
            Self::Completed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
            Self::Voicemail => "voicemail",
            Self::Timeout => "timeout",
            Self::HangupUser => "hangup-user",
            Self::HangupBot => "hangup-bot",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::RealtimeDisconnected => "realtime-disconnected",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload variants of a normalized event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    Initiated,
    Ringing,
    Answered,
    Active,
    Speaking,
    Speech {
        transcript: String,
        is_final: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },
    Dtmf {
        digits: String,
    },
    Ended {
        reason: EndReason,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retryable: Option<bool>,
    },
}

/// Provider-agnostic event consumed by the call manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_call_id: Option<String>,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<CallDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl NormalizedEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: None,
            provider_call_id: None,
            timestamp: now_millis(),
            direction: None,
            from: None,
            to: None,
            kind,
        }
    }

    pub fn with_provider_call_id(mut self, id: impl Into<String>) -> Self {
        self.provider_call_id = Some(id.into());
        self
    }

    pub fn with_call_id(mut self, id: impl Into<String>) -> Self {
        self.call_id = Some(id.into());
        self
    }
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Raw inbound webhook request, as captured at the HTTP edge.
#[derive(Debug, Clone)]
pub struct WebhookContext {
    pub method: String,
    /// Full request URL as the carrier signed it.
    pub url: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub raw_body: Vec<u8>,
}

impl WebhookContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.raw_body)
    }

    /// Parse an `application/x-www-form-urlencoded` body.
    pub fn form_params(&self) -> HashMap<String, String> {
        let mut params = HashMap::new();
        for pair in self.body_str().split('&') {
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            if key.is_empty() {
                continue;
            }
            let key = urlencoding::decode(&key.replace('+', " ")).map(|c| c.into_owned());
            let value = urlencoding::decode(&value.replace('+', " ")).map(|c| c.into_owned());
            if let (Ok(key), Ok(value)) = (key, value) {
                params.insert(key, value);
            }
        }
        params
    }
}

/// Outcome of webhook signature verification.
#[derive(Debug, Clone)]
pub struct WebhookVerdict {
    pub ok: bool,
    pub reason: Option<String>,
}

impl WebhookVerdict {
    pub fn ok() -> Self {
        Self { ok: true, reason: None }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

/// Parsed webhook: normalized events plus the HTTP response the carrier
/// expects (some flows demand inline XML/JSON instructions).
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub events: Vec<NormalizedEvent>,
    pub status_code: u16,
    /// `(content_type, body)` when the response carries instructions.
    pub body: Option<(String, String)>,
}

impl ParsedWebhook {
    pub fn events(events: Vec<NormalizedEvent>) -> Self {
        Self {
            events,
            status_code: 200,
            body: None,
        }
    }

    pub fn empty() -> Self {
        Self::events(Vec::new())
    }
}

/// Input to an outbound dial.
#[derive(Debug, Clone)]
pub struct InitiateCallInput {
    pub call_id: String,
    pub to: String,
    /// Text spoken by provider-native TTS when streaming is off.
    pub greeting: Option<String>,
}

/// Result of a provider dial request.
#[derive(Debug, Clone)]
pub struct InitiatedCall {
    pub provider_call_id: String,
    pub status: String,
}

/// Identity of an in-progress call for control commands.
#[derive(Debug, Clone)]
pub struct CallRef {
    pub call_id: String,
    pub provider_call_id: Option<String>,
}

/// How the carrier delivers media over the stream WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaTransport {
    /// JSON envelopes with base64 payloads (Twilio-style).
    FramedJson,
    /// Raw binary μ-law frames; identity via query-string token.
    RawBinary,
}

/// One carrier's adapter. All bookkeeping maps live inside the adapter.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn media_transport(&self) -> MediaTransport {
        MediaTransport::FramedJson
    }

    /// Verify the webhook signature/shared secret. Requests that fail
    /// verification never reach `parse_webhook_event`.
    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerdict;

    /// Normalize the webhook into events and pick the HTTP response.
    fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<ParsedWebhook>;

    async fn initiate_call(&self, input: &InitiateCallInput) -> Result<InitiatedCall>;

    async fn hangup_call(&self, call: &CallRef) -> Result<()>;

    /// Provider-native speak (used in notify mode or as TTS fallback).
    async fn play_tts(&self, call: &CallRef, text: &str) -> Result<()>;

    async fn start_listening(&self, _call: &CallRef) -> Result<()> {
        Ok(())
    }

    async fn stop_listening(&self, _call: &CallRef) -> Result<()> {
        Ok(())
    }

    /// Wire the resolved public origin in (e.g. `https://bot.example.com`).
    fn set_public_url(&self, url: &str);

    /// Mint a stream token for the call and return the media WS URL the
    /// provider should dial. `None` when the adapter does not stream.
    fn register_call_stream(&self, _call_id: &str) -> Option<String> {
        None
    }

    /// Validate a stream token for the call. Constant-time.
    fn is_valid_stream_token(&self, _call_id: &str, _token: &str) -> bool {
        false
    }

    /// Reverse-resolve a stream token to its call id.
    fn resolve_call_id_by_token(&self, _token: &str) -> Option<String> {
        None
    }
}

/// Constant-time string equality for stream tokens.
///
/// Equal-length mismatches and unequal-length tokens both return false;
/// unequal lengths still run the comparison against a dummy buffer so the
/// timing profile does not reveal length matches.
pub fn constant_time_eq(supplied: &str, expected: &str) -> bool {
    let supplied = supplied.as_bytes();
    let expected = expected.as_bytes();
    let length_match = supplied.len() == expected.len();
    let dummy = vec![0u8; supplied.len()];
    let compare_to: &[u8] = if length_match { expected } else { &dummy };
    let mut diff = 0u8;
    for (a, b) in supplied.iter().zip(compare_to.iter()) {
        diff |= a ^ b;
    }
    length_match && diff == 0
}

/// Mint a 128-bit base64url stream token.
pub fn mint_stream_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compose the media WS URL for a call: `wss://<origin><path>?token=<token>`.
pub fn stream_url(public_origin: &str, stream_path: &str, token: &str) -> String {
    let origin = public_origin
        .trim_end_matches('/')
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{}{}?token={}", origin, stream_path, token)
}

/// Webhook payload field helpers. Carrier payloads are type-checked at the
/// edge; anything that is not a non-empty trimmed string, positive finite
/// number, or well-formed boolean is rejected.
pub mod fields {
    use serde_json::Value;

    pub fn non_empty_string(value: &Value) -> Option<String> {
        value
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    pub fn positive_finite_number(value: &Value) -> Option<f64> {
        value
            .as_f64()
            .filter(|n| n.is_finite() && *n > 0.0)
    }

    pub fn well_formed_bool(value: &Value) -> Option<bool> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}
