pub mod args;
pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod manager;
pub mod outcome;
pub mod providers;
pub mod realtime;
pub mod retry;
pub mod runtime;
pub mod server;
pub mod tts;

// Re-export the types most callers need at crate root for convenience
pub use error::{Error, Result};
pub use manager::{CallManager, CallRecord, CallState};
pub use providers::{EndReason, EventKind, NormalizedEvent};
pub use runtime::VoiceRuntime;
