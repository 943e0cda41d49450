//! Configuration for the voice-call bridge.
//!
//! Loaded from a TOML file (`-c` / `CLAWLINE_CONFIG`), with provider
//! credentials optionally supplied through named environment variables.
//! Explicit config values always win over the environment.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which carrier the bridge talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Twilio,
    Telnyx,
    Plivo,
    Voximplant,
    Mock,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Twilio => "twilio",
            Self::Telnyx => "telnyx",
            Self::Plivo => "plivo",
            Self::Voximplant => "voximplant",
            Self::Mock => "mock",
        }
    }
}

/// HTTP listener for provider callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Listen address, e.g. `0.0.0.0:3334`.
    #[serde(default = "ServeConfig::default_listen")]
    pub listen: String,
    /// Webhook path provider callbacks POST to.
    #[serde(default = "ServeConfig::default_path")]
    pub path: String,
    /// Bearer token protecting auxiliary hook endpoints.
    #[serde(default)]
    pub hook_token: Option<String>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            path: Self::default_path(),
            hook_token: None,
        }
    }
}

impl ServeConfig {
    fn default_listen() -> String {
        "0.0.0.0:3334".to_string()
    }

    fn default_path() -> String {
        "/voice/webhook".to_string()
    }
}

/// Media-streaming mode for live calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StreamingMode {
    /// Carrier audio is transcribed; the bot speaks via synthesized TTS.
    #[default]
    Transcription,
    /// The realtime model owns both directions of the conversation.
    RealtimeConversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub mode: StreamingMode,
    /// WebSocket path carriers connect their media stream to.
    #[serde(default = "StreamingConfig::default_stream_path")]
    pub stream_path: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: StreamingMode::default(),
            stream_path: Self::default_stream_path(),
        }
    }
}

impl StreamingConfig {
    fn default_stream_path() -> String {
        "/voice/stream".to_string()
    }
}

/// Core TTS settings; per-call overrides deep-merge on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Backend id: "openai", "elevenlabs". "edge" is refused for telephony.
    #[serde(default = "TtsConfig::default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: Self::default_provider(),
            api_key: None,
            voice: None,
            model: None,
            base_url: None,
        }
    }
}

impl TtsConfig {
    fn default_provider() -> String {
        "openai".to_string()
    }

    /// Deep-merge plugin-level overrides on top of these core settings.
    pub fn merged(&self, overrides: &TtsOverrides) -> TtsConfig {
        TtsConfig {
            provider: overrides.provider.clone().unwrap_or_else(|| self.provider.clone()),
            api_key: overrides.api_key.clone().or_else(|| self.api_key.clone()),
            voice: overrides.voice.clone().or_else(|| self.voice.clone()),
            model: overrides.model.clone().or_else(|| self.model.clone()),
            base_url: overrides.base_url.clone().or_else(|| self.base_url.clone()),
        }
    }
}

/// Optional per-plugin TTS overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsOverrides {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Realtime speech model session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "RealtimeConfig::default_endpoint")]
    pub endpoint: String,
    #[serde(default = "RealtimeConfig::default_model")]
    pub model: String,
    #[serde(default = "RealtimeConfig::default_voice")]
    pub voice: String,
    /// System prompt template for conversation mode.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: Self::default_endpoint(),
            model: Self::default_model(),
            voice: Self::default_voice(),
            instructions: None,
        }
    }
}

impl RealtimeConfig {
    fn default_endpoint() -> String {
        "wss://api.openai.com/v1/realtime".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-realtime-preview".to_string()
    }

    fn default_voice() -> String {
        "alloy".to_string()
    }
}

/// Post-call summary pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "OutcomeConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "OutcomeConfig::default_model")]
    pub model: String,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: Self::default_base_url(),
            model: Self::default_model(),
        }
    }
}

impl OutcomeConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }
}

/// Per-call limits and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "LimitsConfig::default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "LimitsConfig::default_ring_timeout_ms")]
    pub ring_timeout_ms: u64,
    #[serde(default = "LimitsConfig::default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    #[serde(default = "LimitsConfig::default_max_duration_seconds")]
    pub max_duration_seconds: u64,
    #[serde(default = "LimitsConfig::default_transcript_timeout_ms")]
    pub transcript_timeout_ms: u64,
    #[serde(default = "LimitsConfig::default_control_timeout_ms")]
    pub control_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: Self::default_max_concurrent_calls(),
            ring_timeout_ms: Self::default_ring_timeout_ms(),
            silence_timeout_ms: Self::default_silence_timeout_ms(),
            max_duration_seconds: Self::default_max_duration_seconds(),
            transcript_timeout_ms: Self::default_transcript_timeout_ms(),
            control_timeout_ms: Self::default_control_timeout_ms(),
        }
    }
}

impl LimitsConfig {
    fn default_max_concurrent_calls() -> usize {
        2
    }

    fn default_ring_timeout_ms() -> u64 {
        45_000
    }

    fn default_silence_timeout_ms() -> u64 {
        30_000
    }

    fn default_max_duration_seconds() -> u64 {
        600
    }

    fn default_transcript_timeout_ms() -> u64 {
        60_000
    }

    fn default_control_timeout_ms() -> u64 {
        10_000
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default = "default_twilio_base_url")]
    pub base_url: String,
}

fn default_twilio_base_url() -> String {
    "https://api.twilio.com".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelnyxConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default = "default_telnyx_base_url")]
    pub base_url: String,
}

fn default_telnyx_base_url() -> String {
    "https://api.telnyx.com".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlivoConfig {
    #[serde(default)]
    pub auth_id: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
    #[serde(default = "default_plivo_base_url")]
    pub base_url: String,
}

fn default_plivo_base_url() -> String {
    "https://api.plivo.com".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoximplantConfig {
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub rule_id: Option<String>,
    #[serde(default)]
    pub from_number: Option<String>,
    /// Static management JWT. Sentinels AUTO / __AUTO__ / __SERVICE_ACCOUNT__
    /// are ignored and force service-account mode.
    #[serde(default)]
    pub management_jwt: Option<String>,
    /// Service-account credentials for minting RS256 management JWTs.
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    /// Shared secret expected in `x-openclaw-voximplant-secret`.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Regenerate the cached JWT this many seconds before expiry.
    #[serde(default = "VoximplantConfig::default_refresh_skew_sec")]
    pub refresh_skew_sec: u64,
    #[serde(default = "VoximplantConfig::default_base_url")]
    pub base_url: String,
}

impl VoximplantConfig {
    fn default_refresh_skew_sec() -> u64 {
        60
    }

    fn default_base_url() -> String {
        "https://api.voximplant.com".to_string()
    }
}

/// Path-prefixed HTTP/WS proxy to an upstream service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub base_path: String,
    pub upstream_host: String,
    pub upstream_port: u16,
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub provider: ProviderKind,
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub tts_overrides: TtsOverrides,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub outcome: OutcomeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub telnyx: TelnyxConfig,
    #[serde(default)]
    pub plivo: PlivoConfig,
    #[serde(default)]
    pub voximplant: VoximplantConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Explicit public URL; overrides tunnel and LAN resolution.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Expose the LAN address as the public URL when no tunnel is configured.
    #[serde(default)]
    pub expose_lan: bool,
    /// Append-only JSONL call history.
    #[serde(default = "Config::default_history_path")]
    pub history_path: PathBuf,
    /// How many records `status`/`tail` return by default.
    #[serde(default = "Config::default_history_limit")]
    pub history_limit: usize,
    /// DANGEROUS: accept webhooks without verifying signatures.
    #[serde(default)]
    pub skip_signature_verification: bool,
}

impl Config {
    fn default_history_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clawline")
            .join("calls.jsonl")
    }

    fn default_history_limit() -> usize {
        20
    }

    /// Load from a TOML file and fill credential gaps from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigInvalid(format!("{}: {}", path.display(), e)))?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        config.apply_env_fallbacks();
        Ok(config)
    }

    /// Construct with defaults for the given provider (used by tests and
    /// the mock-provider CLI path).
    pub fn for_provider(provider: ProviderKind) -> Self {
        let mut config = Config {
            provider,
            serve: ServeConfig::default(),
            streaming: StreamingConfig::default(),
            tts: TtsConfig::default(),
            tts_overrides: TtsOverrides::default(),
            realtime: RealtimeConfig::default(),
            outcome: OutcomeConfig::default(),
            limits: LimitsConfig::default(),
            twilio: TwilioConfig::default(),
            telnyx: TelnyxConfig::default(),
            plivo: PlivoConfig::default(),
            voximplant: VoximplantConfig::default(),
            proxy: None,
            public_url: None,
            expose_lan: false,
            history_path: Self::default_history_path(),
            history_limit: Self::default_history_limit(),
            skip_signature_verification: false,
        };
        config.apply_env_fallbacks();
        config
    }

    /// Environment variables fill only fields the config left empty.
    pub fn apply_env_fallbacks(&mut self) {
        fn fill(slot: &mut Option<String>, var: &str) {
            if slot.is_none() {
                if let Ok(value) = std::env::var(var) {
                    if !value.trim().is_empty() {
                        *slot = Some(value);
                    }
                }
            }
        }

        fill(&mut self.twilio.account_sid, "TWILIO_ACCOUNT_SID");
        fill(&mut self.twilio.auth_token, "TWILIO_AUTH_TOKEN");
        fill(&mut self.twilio.from_number, "TWILIO_FROM_NUMBER");
        fill(&mut self.telnyx.api_key, "TELNYX_API_KEY");
        fill(&mut self.telnyx.public_key, "TELNYX_PUBLIC_KEY");
        fill(&mut self.telnyx.connection_id, "TELNYX_CONNECTION_ID");
        fill(&mut self.telnyx.from_number, "TELNYX_FROM_NUMBER");
        fill(&mut self.plivo.auth_id, "PLIVO_AUTH_ID");
        fill(&mut self.plivo.auth_token, "PLIVO_AUTH_TOKEN");
        fill(&mut self.plivo.from_number, "PLIVO_FROM_NUMBER");
        fill(&mut self.voximplant.account_id, "VOXIMPLANT_ACCOUNT_ID");
        fill(&mut self.voximplant.rule_id, "VOXIMPLANT_RULE_ID");
        fill(&mut self.voximplant.from_number, "VOXIMPLANT_FROM_NUMBER");
        fill(&mut self.voximplant.management_jwt, "VOXIMPLANT_MANAGEMENT_JWT");
        fill(&mut self.voximplant.key_id, "VOXIMPLANT_KEY_ID");
        fill(&mut self.voximplant.private_key, "VOXIMPLANT_PRIVATE_KEY");
        fill(&mut self.voximplant.webhook_secret, "VOXIMPLANT_WEBHOOK_SECRET");
        fill(&mut self.tts.api_key, "OPENAI_API_KEY");
        fill(&mut self.realtime.api_key, "OPENAI_API_KEY");
        fill(&mut self.outcome.api_key, "OPENAI_API_KEY");
        if self.tts.provider == "elevenlabs" {
            fill(&mut self.tts.api_key, "ELEVENLABS_API_KEY");
        }
    }

    /// Refuse to start on missing provider credentials.
    pub fn validate(&self) -> Result<()> {
        match self.provider {
            ProviderKind::Twilio => {
                require(&self.twilio.account_sid, "twilio.account_sid")?;
                require(&self.twilio.auth_token, "twilio.auth_token")?;
                require(&self.twilio.from_number, "twilio.from_number")?;
            }
            ProviderKind::Telnyx => {
                require(&self.telnyx.api_key, "telnyx.api_key")?;
                require(&self.telnyx.connection_id, "telnyx.connection_id")?;
                require(&self.telnyx.from_number, "telnyx.from_number")?;
                if !self.skip_signature_verification {
                    require(&self.telnyx.public_key, "telnyx.public_key")?;
                }
            }
            ProviderKind::Plivo => {
                require(&self.plivo.auth_id, "plivo.auth_id")?;
                require(&self.plivo.auth_token, "plivo.auth_token")?;
                require(&self.plivo.from_number, "plivo.from_number")?;
            }
            ProviderKind::Voximplant => {
                require(&self.voximplant.account_id, "voximplant.account_id")?;
                require(&self.voximplant.rule_id, "voximplant.rule_id")?;
                if !self.voximplant.has_static_jwt() && !self.voximplant.has_service_account() {
                    return Err(Error::CredentialMissing(
                        "voximplant.management_jwt or voximplant service-account credentials"
                            .into(),
                    ));
                }
                if !self.skip_signature_verification {
                    require(&self.voximplant.webhook_secret, "voximplant.webhook_secret")?;
                }
            }
            ProviderKind::Mock => {}
        }

        if !self.serve.path.starts_with('/') {
            return Err(Error::ConfigInvalid("serve.path must start with '/'".into()));
        }
        if !self.streaming.stream_path.starts_with('/') {
            return Err(Error::ConfigInvalid(
                "streaming.stream_path must start with '/'".into(),
            ));
        }
        if self.limits.max_concurrent_calls == 0 {
            return Err(Error::ConfigInvalid(
                "limits.max_concurrent_calls must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl VoximplantConfig {
    /// Management JWT sentinels that force service-account mode.
    pub const JWT_SENTINELS: [&'static str; 3] = ["AUTO", "__AUTO__", "__SERVICE_ACCOUNT__"];

    pub fn has_static_jwt(&self) -> bool {
        self.management_jwt
            .as_deref()
            .map(|jwt| !jwt.trim().is_empty() && !Self::JWT_SENTINELS.contains(&jwt.trim()))
            .unwrap_or(false)
    }

    pub fn has_service_account(&self) -> bool {
        self.account_id.is_some() && self.key_id.is_some() && self.private_key.is_some()
    }
}

fn require(slot: &Option<String>, name: &str) -> Result<()> {
    match slot {
        Some(value) if !value.trim().is_empty() => Ok(()),
        _ => Err(Error::CredentialMissing(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_provider_needs_no_credentials() {
        let config = Config::for_provider(ProviderKind::Mock);
        config.validate().unwrap();
    }

    #[test]
    fn twilio_requires_credentials() {
        let mut config = Config::for_provider(ProviderKind::Twilio);
        config.twilio = TwilioConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::CredentialMissing(_)));
    }

    #[test]
    fn jwt_sentinels_force_service_account() {
        let mut vox = VoximplantConfig::default();
        vox.management_jwt = Some("__AUTO__".into());
        assert!(!vox.has_static_jwt());
        vox.management_jwt = Some("AUTO".into());
        assert!(!vox.has_static_jwt());
        vox.management_jwt = Some("eyJhbGciOi...".into());
        assert!(vox.has_static_jwt());
    }

    #[test]
    fn tts_overrides_deep_merge() {
        let core = TtsConfig {
            provider: "openai".into(),
            api_key: Some("core-key".into()),
            voice: Some("alloy".into()),
            model: None,
            base_url: None,
        };
        let overrides = TtsOverrides {
            provider: Some("elevenlabs".into()),
            voice: None,
            ..Default::default()
        };
        let merged = core.merged(&overrides);
        assert_eq!(merged.provider, "elevenlabs");
        assert_eq!(merged.api_key.as_deref(), Some("core-key"));
        assert_eq!(merged.voice.as_deref(), Some("alloy"));
    }

    #[test]
    fn parses_minimal_toml() {
        let config: Config = toml::from_str("provider = \"mock\"").unwrap();
        assert_eq!(config.provider, ProviderKind::Mock);
        assert_eq!(config.serve.path, "/voice/webhook");
        assert_eq!(config.streaming.stream_path, "/voice/stream");
        assert_eq!(config.limits.max_concurrent_calls, 2);
    }
}
