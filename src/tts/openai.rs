//! OpenAI TTS backend. The speech endpoint returns 24 kHz PCM; it is
//! companded to μ-law/8 kHz here before hitting the media path.

use super::TelephonyTts;
use crate::audio;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_VOICE: &str = "alloy";
const DEFAULT_MODEL: &str = "tts-1";
const PCM_SAMPLE_RATE: u32 = 24_000;
const SYNTH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAiTts {
    api_key: String,
    voice: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiTts {
    pub fn new(
        api_key: String,
        voice: Option<String>,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Self {
        Self {
            api_key,
            voice: voice.unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TelephonyTts for OpenAiTts {
    fn provider_name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(SYNTH_TIMEOUT)
            .json(&serde_json::json!({
                "model": self.model,
                "voice": self.voice,
                "input": text,
                "response_format": "pcm",
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::ProviderError { status, body });
        }

        let pcm = resp.bytes().await?;
        let mulaw = audio::pcm16le_to_mulaw_8k(&pcm, PCM_SAMPLE_RATE);
        debug!(
            pcm_bytes = pcm.len(),
            mulaw_bytes = mulaw.len(),
            "openai synthesis companded for telephony"
        );
        Ok(mulaw)
    }
}
