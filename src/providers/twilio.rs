//! Twilio adapter.
//!
//! Webhooks are HMAC-SHA1 signed over the full URL plus the sorted form
//! parameters (`X-Twilio-Signature`). Outbound calls are created through
//! the REST API with inline TwiML; when streaming is enabled the TwiML
//! opens a `<Connect><Stream>` whose `<Parameter>` carries the call id so
//! identity survives the WebSocket query-strip.

use super::{
    constant_time_eq, mint_stream_token, stream_url, CallDirection, CallRef, EndReason, EventKind,
    InitiateCallInput, InitiatedCall, MediaTransport, NormalizedEvent, ParsedWebhook,
    ProviderAdapter, WebhookContext, WebhookVerdict,
};
use crate::config::TwilioConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha1 = Hmac<Sha1>;

pub struct TwilioProvider {
    config: TwilioConfig,
    http: reqwest::Client,
    public_url: RwLock<String>,
    stream_path: String,
    streaming: bool,
    skip_verification: bool,
    /// callId -> stream token
    stream_tokens: DashMap<String, String>,
    control_timeout: Duration,
}

impl TwilioProvider {
    pub fn new(
        config: TwilioConfig,
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

    fn account_sid(&self) -> &str {
        self.config.account_sid.as_deref().unwrap_or_default()
    }

    fn auth_token(&self) -> &str {
        self.config.auth_token.as_deref().unwrap_or_default()
    }

    /// Twilio signature: base64(HMAC-SHA1(url + sorted(key+value)...)).
    fn expected_signature(&self, url: &str, params: &std::collections::BTreeMap<String, String>) -> Option<String> {
        let mut payload = url.to_string();
        for (key, value) in params {
            payload.push_str(key);
            payload.push_str(value);
        }
        let mut mac = HmacSha1::new_from_slice(self.auth_token().as_bytes()).ok()?;
        mac.update(payload.as_bytes());
        Some(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn connect_stream_twiml(&self, call_id: &str) -> String {
        let token = self
            .stream_tokens
            .get(call_id)
            .map(|t| t.clone())
            .unwrap_or_default();
        let origin = self.public_url.read().unwrap().clone();
        let url = stream_url(&origin, &self.stream_path, &token);
        format!(
            "<Response><Connect><Stream url=\"{}\"><Parameter name=\"callId\" value=\"{}\"/></Stream></Connect></Response>",
            xml_escape(&url),
            xml_escape(call_id)
        )
    }

    async fn rest(&self, endpoint: &str, form: &[(&str, &str)]) -> Result<serde_json::Value> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.account_sid(),
            endpoint
        );
        let resp = self
            .http
            .post(&url)
            .basic_auth(self.account_sid(), Some(self.auth_token()))
            .timeout(self.control_timeout)
            .form(form)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(Error::ProviderError {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(Error::from)
    }
}

#[async_trait]
impl ProviderAdapter for TwilioProvider {
    fn name(&self) -> &'static str {
        "twilio"
    }

    fn media_transport(&self) -> MediaTransport {
        MediaTransport::FramedJson
    }

    fn verify_webhook(&self, ctx: &WebhookContext) -> WebhookVerdict {
        if self.skip_verification {
            return WebhookVerdict::ok();
        }
        let Some(signature) = ctx.header("x-twilio-signature") else {
            return WebhookVerdict::rejected("missing X-Twilio-Signature");
        };
        let params: std::collections::BTreeMap<String, String> =
            ctx.form_params().into_iter().collect();
        match self.expected_signature(&ctx.url, &params) {
            Some(expected) if constant_time_eq(signature, &expected) => WebhookVerdict::ok(),
            Some(_) => WebhookVerdict::rejected("signature mismatch"),
            None => WebhookVerdict::rejected("signature computation failed"),
        }
    }

    fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<ParsedWebhook> {
        let params = ctx.form_params();
        let call_sid = params
            .get("CallSid")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadPayload("missing CallSid".into()))?
            .to_string();

        let status = params
            .get("CallStatus")
            .map(|s| s.trim().to_lowercase())
            .unwrap_or_default();
        let direction = params.get("Direction").map(|d| {
            if d.starts_with("outbound") {
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
                .with_provider_call_id(&call_sid),
            );
        }

        let kind = match status.as_str() {
            "queued" | "initiated" => Some(EventKind::Initiated),
            "ringing" => Some(EventKind::Ringing),
            "in-progress" | "answered" => Some(EventKind::Answered),
            "completed" => Some(EventKind::Ended {
                reason: EndReason::Completed,
            }),
            "busy" => Some(EventKind::Ended {
                reason: EndReason::Busy,
            }),
            "no-answer" => Some(EventKind::Ended {
                reason: EndReason::NoAnswer,
            }),
            "canceled" => Some(EventKind::Ended {
                reason: EndReason::HangupBot,
            }),
            "failed" => Some(EventKind::Ended {
                reason: EndReason::Failed,
            }),
            "" => None,
            other => Some(EventKind::Ended {
                reason: EndReason::from_provider(other),
            }),
        };

        // Answering-machine detection overrides a plain answer.
        let kind = match (kind, params.get("AnsweredBy").map(String::as_str)) {
            (Some(EventKind::Answered), Some(by)) if by.starts_with("machine") => {
                Some(EventKind::Ended {
                    reason: EndReason::Voicemail,
                })
            }
            (kind, _) => kind,
        };

        if let Some(kind) = kind {
            let inbound_start =
                matches!(kind, EventKind::Ringing) && direction == Some(CallDirection::Inbound);
            let mut event = NormalizedEvent::new(kind).with_provider_call_id(&call_sid);
            event.direction = direction;
            event.from = params.get("From").map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            event.to = params.get("To").map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

            if inbound_start {
                // Mint the local id here so the answer TwiML can carry it.
                let call_id = uuid::Uuid::new_v4().to_string();
                self.register_call_stream(&call_id);
                event = event.with_call_id(&call_id);
                if self.streaming {
                    body = Some((
                        "text/xml".to_string(),
                        self.connect_stream_twiml(&call_id),
                    ));
                }
            }
            events.push(event);
        }

        debug!(%call_sid, %status, events = events.len(), "twilio webhook parsed");
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
            .ok_or_else(|| Error::CredentialMissing("twilio.from_number".into()))?;

        let twiml = if self.streaming {
            self.register_call_stream(&input.call_id);
            self.connect_stream_twiml(&input.call_id)
        } else {
            let say = input.greeting.as_deref().unwrap_or("");
            format!(
                "<Response><Say>{}</Say><Pause length=\"120\"/></Response>",
                xml_escape(say)
            )
        };

        let origin = self.public_url.read().unwrap().clone();
        let status_callback = format!("{}/voice/webhook", origin.trim_end_matches('/'));

        let value = self
            .rest(
                "Calls.json",
                &[
                    ("To", input.to.as_str()),
                    ("From", from.as_str()),
                    ("Twiml", twiml.as_str()),
                    ("StatusCallback", status_callback.as_str()),
                    (
                        "StatusCallbackEvent",
                        "initiated ringing answered completed",
                    ),
                    ("MachineDetection", "Enable"),
                ],
            )
            .await?;

        let sid = value["sid"]
            .as_str()
            .ok_or_else(|| Error::BadPayload("twilio response missing sid".into()))?
            .to_string();
        let status = value["status"].as_str().unwrap_or("queued").to_string();
        Ok(InitiatedCall {
            provider_call_id: sid,
            status,
        })
    }

    async fn hangup_call(&self, call: &CallRef) -> Result<()> {
        let sid = call
            .provider_call_id
            .as_deref()
            .ok_or(Error::NoControlUrl)?;
        self.rest(
            &format!("Calls/{}.json", sid),
            &[("Status", "completed")],
        )
        .await?;
        Ok(())
    }

    async fn play_tts(&self, call: &CallRef, text: &str) -> Result<()> {
        let sid = call
            .provider_call_id
            .as_deref()
            .ok_or(Error::NoControlUrl)?;
        let twiml = format!(
            "<Response><Say>{}</Say><Pause length=\"120\"/></Response>",
            xml_escape(text)
        );
        if let Err(e) = self
            .rest(&format!("Calls/{}.json", sid), &[("Twiml", twiml.as_str())])
            .await
        {
            warn!(call_id = %call.call_id, error = %e, "twilio play_tts failed");
            return Err(e);
        }
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

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
