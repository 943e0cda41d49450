//! ElevenLabs TTS backend. Requests `ulaw_8000` output directly, so the
//! response bytes go onto the wire untouched.

use super::TelephonyTts;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_VOICE: &str = "21m00Tcm4TlvDq8ikWAM";
const DEFAULT_MODEL: &str = "eleven_multilingual_v2";
const SYNTH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ElevenLabsTts {
    api_key: String,
    voice_id: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(
        api_key: String,
        voice: Option<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            api_key,
            voice_id: voice.unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TelephonyTts for ElevenLabsTts {
    fn provider_name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v1/text-to-speech/{}?output_format=ulaw_8000",
            self.base_url.trim_end_matches('/'),
            self.voice_id
        );

        let resp = self
            .http
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .timeout(SYNTH_TIMEOUT)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ProviderError { status, body });
        }

        let audio = resp.bytes().await?.to_vec();
        debug!(bytes = audio.len(), "elevenlabs synthesis complete");
        Ok(audio)
    }
}
