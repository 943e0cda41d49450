//! Plivo adapter.
//!
//! Uses the V2 signature scheme: base64(HMAC-SHA256(url + nonce)) with the
//! auth token, carried in `X-Plivo-Signature-V2` / `-V2-Nonce`. Webhook
//! bodies are form-encoded in the Twilio manner but with Plivo's field
//! names (`CallUUID`, `CallStatus`, `HangupCause`).

use super::{
    constant_time_eq, mint_stream_token, stream_url, CallDirection, CallRef, EndReason, EventKind,
    InitiateCallInput, InitiatedCall, MediaTransport, NormalizedEvent, ParsedWebhook,
    ProviderAdapter, WebhookContext, WebhookVerdict,
};
use crate::config::PlivoConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::RwLock;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

pub struct PlivoProvider {
    config: PlivoConfig,
    http: reqwest::Client,
    public_url: RwLock<String>,
    stream_path: String,
    streaming: bool,
    skip_verification: bool,
    stream_tokens: DashMap<String, String>,
    control_timeout: Duration,
}

impl PlivoProvider {
    pub fn new(
        config: PlivoConfig,
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

    fn expected_signature(&self, url: &str, nonce: &str) -> Option<String> {
        let token = self.config.auth_token.as_deref()?;
        let mut mac = HmacSha256::new_from_slice(token.as_bytes()).ok()?;
        mac.update(url.as_bytes());
        mac.update(nonce.as_bytes());
        Some(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn api_url(&self, suffix: &str) -> String {
        format!(
            "{}/v1/Account/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.auth_id.as_deref().unwrap_or_default(),
            suffix
        )
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value> {
        let mut req = self
            .http
            .request(method, url)
            .basic_auth(
                self.config.auth_id.as_deref().unwrap_or_default(),
                self.config.auth_token.as_deref(),
            )
            .timeout(self.control_timeout);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::ProviderError {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text).map_err(Error::from)
    }
}

#[async_trait]
impl ProviderAdapter for PlivoProvider {
    fn name(&self) -> &'static str {
        "plivo"
    }

    fn media_transport(&self) -> MediaTransport {
        MediaTransport::FramedJson
    }

    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerdict {
        if self.skip_verification {
            return WebhookVerdict::ok();
        }
        let Some(signature) = ctx.header("x-plivo-signature-v2") else {
            return WebhookVerdict::rejected("missing X-Plivo-Signature-V2");
        };
        let Some(nonce) = ctx.header("x-plivo-signature-v2-nonce") else {
            return WebhookVerdict::rejected("missing X-Plivo-Signature-V2-Nonce");
        };
        match self.expected_signature(&ctx.url, nonce) {
            Some(expected) if constant_time_eq(signature, &expected) => WebhookVerdict::ok(),
            Some(_) => WebhookVerdict::rejected("signature mismatch"),
            None => WebhookVerdict::rejected("auth token not configured"),
        }
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<ParsedWebhook> {
        let params = ctx.form_params();
        let call_uuid = params
            .get("CallUUID")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadPayload("missing CallUUID".into()))?
            .to_string();

        let direction = params.get("Direction").map(|d| {
            if d.eq_ignore_ascii_case("outbound") {
                CallDirection::Outbound
            } else {
                CallDirection::Inbound
            }
        });

        let mut events = Vec::new();
        let mut body = None;

        if let Some(digits) = params.get("Digits").filter(|d| !d.is_empty()) {
            events.push(
                NormalizedEvent::new(EventKind::Dtmf {
                    digits: digits.clone(),
                })
                .with_provider_call_id(&call_uuid),
            );
        }

        let status = params
            .get("CallStatus")
            .or_else(|| params.get("Event"))
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default();

        let kind = match status.as_str() {
            "queued" | "initiated" => Some(EventKind::Initiated),
            "ringing" | "ring" => Some(EventKind::Ringing),
            "in-progress" | "answer" | "answered" => Some(EventKind::Answered),
            "completed" | "hangup" => {
                let cause = params
                    .get("HangupCause")
                    .map(String::as_str)
                    .unwrap_or("completed");
                Some(EventKind::Ended {
                    reason: EndReason::from_provider(cause),
                })
            }
            "busy" => Some(EventKind::Ended {
                reason: EndReason::Busy,
            }),
            "no-answer" => Some(EventKind::Ended {
                reason: EndReason::NoAnswer,
            }),
            "failed" => Some(EventKind::Ended {
                reason: EndReason::Failed,
            }),
            "" => None,
            other => Some(EventKind::Ended {
                reason: EndReason::from_provider(other),
            }),
        };

        if let Some(kind) = kind {
            let inbound_start =
                matches!(kind, EventKind::Ringing) && direction == Some(CallDirection::Inbound);
            let mut event = NormalizedEvent::new(kind).with_provider_call_id(&call_uuid);
            event.direction = direction;
            event.from = params.get("From").map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            event.to = params.get("To").map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

            if inbound_start && self.streaming {
                let call_id = uuid::Uuid::new_v4().to_string();
                let ws = self.register_call_stream(&call_id).unwrap_or_default();
                event = event.with_call_id(&call_id);
                body = Some((
                    "text/xml".to_string(),
                    format!(
                        "<Response><Stream keepCallAlive=\"true\" bidirectional=\"true\" contentType=\"audio/x-mulaw;rate=8000\" extraHeaders=\"callId={}\">{}</Stream></Response>",
                        call_id, ws
                    ),
                ));
            }
            events.push(event);
        }

        Ok(ParsedWebhook {
            events,
            status_code: 200,
            body,
        })
    }

    async fn initiate_call(&self, input: &InitiateCallInput) -> Result<InitiatedCall> {
        let from = self
            .config
            .from_number
            .clone()
            .ok_or_else(|| Error::CredentialMissing("plivo.from_number".into()))?;
        let origin = self.public_url.read().unwrap().clone();
        let answer_url = format!("{}/voice/webhook", origin.trim_end_matches('/'));

        if self.streaming {
            self.register_call_stream(&input.call_id);
        }

        let value = self
            .request(
                reqwest::Method::POST,
                &self.api_url("Call/"),
                Some(serde_json::json!({
                    "to": input.to,
                    "from": from,
                    "answer_url": answer_url,
                    "answer_method": "POST",
                    "machine_detection": "true",
                })),
            )
            .await?;

        let request_uuid = value["request_uuid"]
            .as_str()
            .ok_or_else(|| Error::BadPayload("plivo response missing request_uuid".into()))?
            .to_string();
        Ok(InitiatedCall {
            provider_call_id: request_uuid,
            status: "initiated".into(),
        })
    }

    async fn hangup_call(&self, call: &CallRef) -> Result<()> {
        let uuid = call.provider_call_id.as_deref().ok_or(Error::NoControlUrl)?;
        self.request(
            reqwest::Method::DELETE,
            &self.api_url(&format!("Call/{}/", uuid)),
            None,
        )
        .await?;
        Ok(())
    }

    async fn play_tts(&self, call: &CallRef, text: &str) -> Result<()> {
        let uuid = call.provider_call_id.as_deref().ok_or(Error::NoControlUrl)?;
        self.request(
            reqwest::Method::POST,
            &self.api_url(&format!("Call/{}/Speak/", uuid)),
            Some(serde_json::json!({ "text": text, "language": "ru-RU" })),
        )
        .await?;
        Ok(())
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

    fn provider() -> PlivoProvider {
        let config = PlivoConfig {
            auth_id: Some("MA0123".into()),
            auth_token: Some("token".into()),
            from_number: Some("+15550009999".into()),
            base_url: "https://api.plivo.com".into(),
        };
        PlivoProvider::new(
            config,
            "/voice/stream".into(),
            false,
            false,
            Duration::from_secs(5),
        )
    }

    #[test]
    fn v2_signature_verifies() {
        let provider = provider();
        let url = "https://bot.example.com/voice/webhook";
        let nonce = "12345";
        let sig = provider.expected_signature(url, nonce).unwrap();

        let mut headers = HashMap::new();
        headers.insert("x-plivo-signature-v2".to_string(), sig);
        headers.insert("x-plivo-signature-v2-nonce".to_string(), nonce.to_string());
        let ctx = WebhookContext {
            method: "POST".into(),
            url: url.into(),
            headers,
            raw_body: b"CallUUID=abc&CallStatus=ringing".to_vec(),
        };
        assert!(provider.verify_webhook(&ctx).ok);
    }

    #[test]
    fn hangup_cause_user_maps_to_hangup_user() {
        let provider = provider();
        let ctx = WebhookContext {
            method: "POST".into(),
            url: "https://bot.example.com/voice/webhook".into(),
            headers: HashMap::new(),
            raw_body: b"CallUUID=abc&CallStatus=completed&HangupCause=NORMAL_CLEARING_user".to_vec(),
        };
        let parsed = provider.parse_webhook_event(&ctx).unwrap();
        assert!(matches!(
            parsed.events[0].kind,
            EventKind::Ended {
                reason: EndReason::HangupUser
            }
        ));
    }
}
