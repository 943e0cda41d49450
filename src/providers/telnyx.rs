//! Telnyx Call Control adapter.
//!
//! Webhooks arrive as JSON envelopes (`data.event_type` + `data.payload`),
//! authenticated with an HMAC-SHA256 over `timestamp|body` against the
//! configured public key. Outbound dials and in-call commands go through
//! the v2 REST API with a bearer key.

use super::{
    constant_time_eq, fields, mint_stream_token, stream_url, CallDirection, CallRef, EndReason,
    EventKind, InitiateCallInput, InitiatedCall, MediaTransport, NormalizedEvent, ParsedWebhook,
    ProviderAdapter, WebhookContext, WebhookVerdict,
};
use crate::config::TelnyxConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

pub struct TelnyxProvider {
    config: TelnyxConfig,
    http: reqwest::Client,
    public_url: RwLock<String>,
    stream_path: String,
    streaming: bool,
    skip_verification: bool,
    stream_tokens: DashMap<String, String>,
    control_timeout: Duration,
}

impl TelnyxProvider {
    pub fn new(
        config: TelnyxConfig,
        stream_path: String,
        streaming: bool,
        skip_verification: bool,
        control_timeout: Duration,
    ) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            public_url: RwLock::new(String::new()),
            stream_path,
            streaming,
            skip_verification,
            stream_tokens: DashMap::new(),
            control_timeout,
        }
    }

    fn expected_signature(&self, timestamp: &str, body: &[u8]) -> Option<String> {
        let key = self.config.public_key.as_deref()?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).ok()?;
        mac.update(timestamp.as_bytes());
        mac.update(b"|");
        mac.update(body);
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    async fn command(&self, call_control_id: &str, action: &str, payload: serde_json::Value) -> Result<()> {
        let url = format!(
            "{}/v2/calls/{}/actions/{}",
            self.config.base_url.trim_end_matches('/'),
            call_control_id,
            action
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .timeout(self.control_timeout)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::ProviderError {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for TelnyxProvider {
    fn name(&self) -> &'static str {
        "telnyx"
    }

    fn media_transport(&self) -> MediaTransport {
        MediaTransport::FramedJson
    }

    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerdict {
        if self.skip_verification {
            return WebhookVerdict::ok();
        }
        let Some(signature) = ctx.header("telnyx-signature") else {
            return WebhookVerdict::rejected("missing telnyx-signature");
        };
        let Some(timestamp) = ctx.header("telnyx-timestamp") else {
            return WebhookVerdict::rejected("missing telnyx-timestamp");
        };
        match self.expected_signature(timestamp, &ctx.raw_body) {
            Some(expected) if constant_time_eq(signature, &expected) => WebhookVerdict::ok(),
            Some(_) => WebhookVerdict::rejected("signature mismatch"),
            None => WebhookVerdict::rejected("public key not configured"),
        }
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<ParsedWebhook> {
        let value: serde_json::Value = serde_json::from_slice(&ctx.raw_body)
            .map_err(|e| Error::BadPayload(format!("telnyx webhook: {}", e)))?;
        let data = &value["data"];
        let event_type = fields::non_empty_string(&data["event_type"])
            .ok_or_else(|| Error::BadPayload("missing data.event_type".into()))?;
        let payload = &data["payload"];
        let call_control_id = fields::non_empty_string(&payload["call_control_id"])
            .ok_or_else(|| Error::BadPayload("missing payload.call_control_id".into()))?;

        let direction = fields::non_empty_string(&payload["direction"]).map(|d| {
            if d.starts_with("out") {
                CallDirection::Outbound
            } else {
                CallDirection::Inbound
            }
        });

        let kind = match event_type.as_str() {
            "call.initiated" => Some(EventKind::Initiated),
            "call.ringing" => Some(EventKind::Ringing),
            "call.answered" | "call.bridged" => Some(EventKind::Answered),
            "call.dtmf.received" => fields::non_empty_string(&payload["digit"])
                .map(|digits| EventKind::Dtmf { digits }),
            "call.machine.detection.ended" => {
                match fields::non_empty_string(&payload["result"]).as_deref() {
                    Some("machine") => Some(EventKind::Ended {
                        reason: EndReason::Voicemail,
                    }),
                    _ => None,
                }
            }
            "call.hangup" => {
                let cause = fields::non_empty_string(&payload["hangup_cause"])
                    .unwrap_or_else(|| "completed".into());
                Some(EventKind::Ended {
                    reason: EndReason::from_provider(&cause),
                })
            }
            "call.transcription" => fields::non_empty_string(&payload["transcription_data"]["transcript"])
                .map(|transcript| EventKind::Speech {
                    transcript,
                    is_final: fields::well_formed_bool(&payload["transcription_data"]["is_final"])
                        .unwrap_or(true),
                    confidence: fields::positive_finite_number(
                        &payload["transcription_data"]["confidence"],
                    ),
                }),
            other => {
                debug!(event_type = other, "ignoring telnyx event");
                None
            }
        };

        let mut events = Vec::new();
        if let Some(kind) = kind {
            let mut event = NormalizedEvent::new(kind).with_provider_call_id(&call_control_id);
            event.direction = direction;
            event.from = fields::non_empty_string(&payload["from"]);
            event.to = fields::non_empty_string(&payload["to"]);
            events.push(event);
        }
        Ok(ParsedWebhook::events(events))
    }

    async fn initiate_call(&self, input: &InitiateCallInput) -> Result<InitiatedCall> {
        let connection_id = self
            .config
            .connection_id
            .clone()
            .ok_or_else(|| Error::CredentialMissing("telnyx.connection_id".into()))?;
        let from = self
            .config
            .from_number
            .clone()
            .ok_or_else(|| Error::CredentialMissing("telnyx.from_number".into()))?;

        let mut body = serde_json::json!({
            "connection_id": connection_id,
            "to": input.to,
            "from": from,
            "answering_machine_detection": "basic",
        });
        if self.streaming {
            if let Some(url) = self.register_call_stream(&input.call_id) {
                body["stream_url"] = serde_json::Value::String(url);
                body["stream_track"] = serde_json::Value::String("inbound_track".into());
            }
        }

        let url = format!("{}/v2/calls", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .bearer_auth(self.config.api_key.as_deref().unwrap_or_default())
            .timeout(self.control_timeout)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::ProviderError {
                status: status.as_u16(),
                body: text,
            });
        }
        let value: serde_json::Value = serde_json::from_str(&text)?;
        let call_control_id = fields::non_empty_string(&value["data"]["call_control_id"])
            .ok_or_else(|| Error::BadPayload("telnyx dial response missing call_control_id".into()))?;
        Ok(InitiatedCall {
            provider_call_id: call_control_id,
            status: "initiated".into(),
        })
    }

    async fn hangup_call(&self, call: &CallRef) -> Result<()> {
        let id = call.provider_call_id.as_deref().ok_or(Error::NoControlUrl)?;
        self.command(id, "hangup", serde_json::json!({})).await
    }

    async fn play_tts(&self, call: &CallRef, text: &str) -> Result<()> {
        let id = call.provider_call_id.as_deref().ok_or(Error::NoControlUrl)?;
        self.command(
            id,
            "speak",
            serde_json::json!({
                "payload": text,
                "voice": "female",
                "language": "ru-RU",
            }),
        )
        .await
    }

    async fn start_listening(&self, call: &CallRef) -> Result<()> {
        let id = call.provider_call_id.as_deref().ok_or(Error::NoControlUrl)?;
        self.command(
            id,
            "transcription_start",
            serde_json::json!({ "transcription_engine": "B", "language": "ru" }),
        )
        .await
    }

    async fn stop_listening(&self, call: &CallRef) -> Result<()> {
        let id = call.provider_call_id.as_deref().ok_or(Error::NoControlUrl)?;
        self.command(id, "transcription_stop", serde_json::json!({}))
            .await
    }

    fn set_public_url(&self, url: &str) {
        *self.public_url.write().unwrap() = url.trim_end_matches('/').to_string();
    }

    fn register_call_stream(&self, call_id: &str) -> Option<String> {
        let token = mint_stream_token();
        let origin = self.public_url.read().unwrap().clone();
        let url = stream_url(&origin, &self.stream_path, &token);
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider() -> TelnyxProvider {
        let config = TelnyxConfig {
            api_key: Some("KEY".into()),
            public_key: Some("pubkey".into()),
            connection_id: Some("conn-1".into()),
            from_number: Some("+15550009999".into()),
            base_url: "https://api.telnyx.com".into(),
        };
        TelnyxProvider::new(
            config,
            "/voice/stream".into(),
            false,
            false,
            Duration::from_secs(5),
        )
    }

    fn ctx(body: &str, sign: bool, provider: &TelnyxProvider) -> WebhookContext {
        let mut headers = HashMap::new();
        if sign {
            headers.insert("telnyx-timestamp".to_string(), "1700000000".to_string());
            let sig = provider.expected_signature("1700000000", body.as_bytes()).unwrap();
            headers.insert("telnyx-signature".to_string(), sig);
        }
        WebhookContext {
            method: "POST".into(),
            url: "https://bot.example.com/voice/webhook".into(),
            headers,
            raw_body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn hangup_cause_maps_to_end_reason() {
        let provider = provider();
        let body = serde_json::json!({
            "data": {
                "event_type": "call.hangup",
                "payload": {
                    "call_control_id": "cc-1",
                    "hangup_cause": "user_busy",
                    "direction": "outgoing"
                }
            }
        })
        .to_string();
        let parsed = provider
            .parse_webhook_event(&ctx(&body, false, &provider))
            .unwrap();
        assert!(matches!(
            parsed.events[0].kind,
            EventKind::Ended {
                reason: EndReason::Busy
            }
        ));
    }

    #[test]
    fn signature_must_match() {
        let provider = provider();
        let body = r#"{"data":{"event_type":"call.answered","payload":{"call_control_id":"cc-1"}}}"#;
        assert!(provider.verify_webhook(&ctx(body, true, &provider)).ok);
        let mut bad = ctx(body, true, &provider);
        bad.headers
            .insert("telnyx-signature".to_string(), "deadbeef".to_string());
        assert!(!provider.verify_webhook(&bad).ok);
    }

    #[test]
    fn transcription_event_carries_confidence() {
        let provider = provider();
        let body = serde_json::json!({
            "data": {
                "event_type": "call.transcription",
                "payload": {
                    "call_control_id": "cc-1",
                    "transcription_data": {
                        "transcript": "добрый день",
                        "is_final": true,
                        "confidence": 0.92
                    }
                }
            }
        })
        .to_string();
        let parsed = provider
            .parse_webhook_event(&ctx(&body, false, &provider))
            .unwrap();
        match &parsed.events[0].kind {
            EventKind::Speech {
                transcript,
                is_final,
                confidence,
            } => {
                assert_eq!(transcript, "добрый день");
                assert!(is_final);
                assert_eq!(*confidence, Some(0.92));
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
