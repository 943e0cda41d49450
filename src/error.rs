//! Error taxonomy for the voice-call bridge.
//!
//! Provider adapters and the call manager surface failures as structured
//! results; webhook handlers convert them to HTTP status codes at the edge
//! and never leak provider-internal strings in 5xx bodies.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Config parsed but failed validation. Fatal at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A required provider credential is absent. Fatal at startup.
    #[error("missing credential: {0}")]
    CredentialMissing(String),

    /// Webhook signature or shared-secret verification failed.
    #[error("unauthorized webhook: {0}")]
    UnauthorizedWebhook(String),

    /// Caller exceeded the auth-failure window.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Request body exceeded the server limit.
    #[error("payload too large")]
    PayloadTooLarge,

    /// The client was too slow delivering the request.
    #[error("request timeout")]
    RequestTimeout,

    /// Malformed or type-invalid webhook payload.
    #[error("bad payload: {0}")]
    BadPayload(String),

    /// No control URL is known for the call; in-call commands cannot run.
    #[error("no control url for call")]
    NoControlUrl,

    /// A carrier REST call failed; status and body are preserved.
    #[error("provider error {status}: {body}")]
    ProviderError { status: u16, body: String },

    /// State-machine edge not present in the transition table.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Outbound call refused: concurrency cap reached.
    #[error("too many concurrent calls (limit {limit})")]
    TooManyCalls { limit: usize },

    /// No final user transcript arrived within the turn window.
    #[error("transcript timeout")]
    TranscriptTimeout,

    /// No speech for longer than the silence window.
    #[error("silence timeout")]
    SilenceTimeout,

    /// Peer never answered within the ring window.
    #[error("ring timeout")]
    RingTimeout,

    /// Absolute call duration cap reached.
    #[error("max call duration reached")]
    MaxDuration,

    /// TTS backend cannot run (missing credentials, refused provider).
    /// Callers fall back to provider-native speak commands.
    #[error("tts unavailable: {0}")]
    TtsUnavailable(String),

    /// The realtime model socket dropped. Terminal in conversation mode.
    #[error("realtime session disconnected: {0}")]
    RealtimeDisconnected(String),

    /// The post-call summary LLM failed; a template summary is used instead.
    #[error("summary failed: {0}")]
    SummaryFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status for errors that reach the webhook edge.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::UnauthorizedWebhook(_) => 401,
            Error::RateLimited { .. } => 429,
            Error::PayloadTooLarge => 413,
            Error::RequestTimeout => 408,
            Error::BadPayload(_) => 400,
            _ => 500,
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }
}
