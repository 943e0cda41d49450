//! Telephony text-to-speech.
//!
//! One contract: text in, μ-law/8 kHz/mono bytes out. Backends that emit
//! companded audio natively (ElevenLabs) pass through; PCM backends
//! (OpenAI) are companded here. The `edge` provider is refused outright:
//! telephony needs PCM-grade output it cannot deliver.

use crate::config::TtsConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;

mod elevenlabs;
mod openai;

pub use elevenlabs::ElevenLabsTts;
pub use openai::OpenAiTts;

/// A TTS backend producing telephony-ready μ-law audio.
#[async_trait]
pub trait TelephonyTts: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Synthesize `text` into μ-law / 8 kHz / mono bytes.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

impl std::fmt::Debug for dyn TelephonyTts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("dyn TelephonyTts")
            .field(&self.provider_name())
            .finish()
    }
}

/// Build the configured backend. Fails with `TtsUnavailable` when the
/// provider is refused or its credentials are missing; callers degrade to
/// provider-native speak commands.
pub fn build_adapter(config: &TtsConfig) -> Result<Box<dyn TelephonyTts>> {
    match config.provider.as_str() {
        "edge" => Err(Error::TtsUnavailable(
            "edge tts cannot produce telephony-grade audio".into(),
        )),
        "elevenlabs" => {
            let api_key = require_key(config, "elevenlabs")?;
            Ok(Box::new(ElevenLabsTts::new(
                api_key,
                config.voice.clone(),
                config.model.clone(),
                config.base_url.clone(),
            )))
        }
        "openai" => {
            let api_key = require_key(config, "openai")?;
            Ok(Box::new(OpenAiTts::new(
                api_key,
                config.voice.clone(),
                config.model.clone(),
                config.base_url.clone(),
            )))
        }
        other => Err(Error::TtsUnavailable(format!(
            "unknown tts provider '{}'",
            other
        ))),
    }
}

fn require_key(config: &TtsConfig, provider: &str) -> Result<String> {
    config
        .api_key
        .clone()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| Error::TtsUnavailable(format!("{} api key not configured", provider)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_provider_is_refused() {
        let config = TtsConfig {
            provider: "edge".into(),
            api_key: Some("key".into()),
            ..Default::default()
        };
        let err = build_adapter(&config).unwrap_err();
        assert!(matches!(err, Error::TtsUnavailable(_)));
    }

    #[test]
    fn missing_key_is_unavailable_not_fatal() {
        let config = TtsConfig {
            provider: "openai".into(),
            api_key: None,
            ..Default::default()
        };
        assert!(matches!(
            build_adapter(&config),
            Err(Error::TtsUnavailable(_))
        ));
    }

    #[test]
    fn known_backends_construct() {
        for provider in ["openai", "elevenlabs"] {
            let config = TtsConfig {
                provider: provider.into(),
                api_key: Some("key".into()),
                ..Default::default()
            };
            let adapter = build_adapter(&config).unwrap();
            assert_eq!(adapter.provider_name(), provider);
        }
    }
}
