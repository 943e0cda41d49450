//! Call manager: authoritative per-call state.
//!
//! Owns the call records, the state machine, transcripts, timeouts, the
//! concurrency cap, and the append-only history log. Webhook events, media
//! events, and control commands for the same call are linearized under the
//! manager's lock; state transitions are synchronous within it (no await
//! between the guard check and the state write).
//!
//! Provider and bridge failures surface to callers as structured outcomes
//! (`success: false` + error string); the manager never panics or throws
//! into the tool layer.

use crate::bridge::MediaBridge;
use crate::config::{LimitsConfig, StreamingConfig, StreamingMode};
use crate::error::Error;
use crate::providers::{
    now_millis, CallDirection, CallRef, EndReason, EventKind, InitiateCallInput, NormalizedEvent,
    ProviderAdapter,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle phase of a call. Only `Initiating` is a start state; every
/// other state is reachable only through the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Initiating,
    Ringing,
    Answered,
    Active,
    Speaking,
    Listening,
    Ending,
    HangupBot,
    HangupUser,
    Timeout,
    Busy,
    NoAnswer,
    Voicemail,
    Failed,
    Completed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::HangupBot
                | Self::HangupUser
                | Self::Timeout
                | Self::Busy
                | Self::NoAnswer
                | Self::Voicemail
                | Self::Failed
                | Self::Completed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiating => "initiating",
            Self::Ringing => "ringing",
            Self::Answered => "answered",
            Self::Active => "active",
            Self::Speaking => "speaking",
            Self::Listening => "listening",
            Self::Ending => "ending",
            Self::HangupBot => "hangup-bot",
            Self::HangupUser => "hangup-user",
            Self::Timeout => "timeout",
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
            Self::Voicemail => "voicemail",
            Self::Failed => "failed",
            Self::Completed => "completed",
        }
    }

    /// The transition table. Unlisted edges are invalid.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        if self.is_terminal() {
            return false;
        }
        // Any non-terminal state may fall to these terminals directly.
        if matches!(next, Busy | NoAnswer | Voicemail | Timeout | Failed | Completed) {
            return true;
        }
        matches!(
            (self, next),
            (Initiating, Ringing)
                | (Ringing, Answered)
                | (Answered, Active)
                | (Active, Speaking)
                | (Active, Listening)
                | (Speaking, Listening)
                | (Listening, Speaking)
                | (Active, Ending)
                | (Speaking, Ending)
                | (Listening, Ending)
                | (Ending, HangupBot)
                | (Ending, HangupUser)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Bot,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: u64,
}

/// Notify calls deliver one message; conversation calls run a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    #[default]
    Notify,
    Conversation,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    /// Natural-language task for the call.
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub mode: CallMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_to: Option<String>,
    /// Originating chat-session key; required for outcome delivery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_call_id: Option<String>,
    pub from: String,
    pub to: String,
    pub direction: CallDirection,
    pub state: CallState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub transcript: Vec<TranscriptEntry>,
    pub metadata: CallMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,
    /// Milliseconds timestamp of the last speech activity.
    #[serde(skip)]
    pub last_activity_at: u64,
}

impl CallRecord {
    fn new(call_id: String, from: String, to: String, direction: CallDirection) -> Self {
        let now = now_millis();
        Self {
            call_id,
            provider_call_id: None,
            from,
            to,
            direction,
            state: CallState::Initiating,
            end_reason: None,
            started_at: now,
            ended_at: None,
            transcript: Vec::new(),
            metadata: CallMetadata::default(),
            stream_sid: None,
            control_url: None,
            last_activity_at: now,
        }
    }
}

/// Outcome structs: the manager reports failures, it does not throw them.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn err(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<Vec<TranscriptEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Options for an outbound call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub prompt: String,
    pub objective: Option<String>,
    pub context: Option<String>,
    pub language: Option<String>,
    pub mode: CallMode,
    pub message_to: Option<String>,
}

pub type OnCallEnded = Box<dyn Fn(CallRecord) + Send + Sync>;

struct ManagerState {
    calls: HashMap<String, CallRecord>,
    by_provider_id: HashMap<String, String>,
    /// (callId, terminal state) pairs whose end event already fired.
    ended_emitted: HashSet<(String, CallState)>,
}

pub struct CallManager {
    provider: Arc<dyn ProviderAdapter>,
    bridge: RwLock<Option<Arc<MediaBridge>>>,
    limits: LimitsConfig,
    streaming: StreamingConfig,
    state: Mutex<ManagerState>,
    hook: Mutex<Option<OnCallEnded>>,
    history_path: PathBuf,
    transcript_notify: tokio::sync::Notify,
}

impl CallManager {
    pub fn new(
        provider: Arc<dyn ProviderAdapter>,
        limits: LimitsConfig,
        streaming: StreamingConfig,
        history_path: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            bridge: RwLock::new(None),
            limits,
            streaming,
            state: Mutex::new(ManagerState {
                calls: HashMap::new(),
                by_provider_id: HashMap::new(),
                ended_emitted: HashSet::new(),
            }),
            hook: Mutex::new(None),
            history_path,
            transcript_notify: tokio::sync::Notify::new(),
        })
    }

    pub fn set_bridge(&self, bridge: Arc<MediaBridge>) {
        *self.bridge.write().unwrap() = Some(bridge);
    }

    fn bridge(&self) -> Option<Arc<MediaBridge>> {
        self.bridge.read().unwrap().clone()
    }

    pub fn provider(&self) -> Arc<dyn ProviderAdapter> {
        self.provider.clone()
    }

    /// Register the end-of-call hook, fired exactly once per call with the
    /// final immutable record.
    pub fn set_on_call_ended_hook(&self, hook: OnCallEnded) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    fn live_calls(state: &ManagerState) -> usize {
        state
            .calls
            .values()
            .filter(|record| !record.state.is_terminal())
            .count()
    }

    // ── Public verbs ────────────────────────────────────────────────────

    pub async fn initiate_call(
        self: &Arc<Self>,
        to: &str,
        session_key: Option<&str>,
        opts: CallOptions,
    ) -> InitiateOutcome {
        if !looks_like_e164(to) {
            return InitiateOutcome {
                success: false,
                call_id: None,
                error: Some(format!("'{}' is not an E.164 number", to)),
            };
        }

        let call_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().unwrap();
            if Self::live_calls(&state) >= self.limits.max_concurrent_calls {
                let err = Error::TooManyCalls {
                    limit: self.limits.max_concurrent_calls,
                };
                return InitiateOutcome {
                    success: false,
                    call_id: None,
                    error: Some(err.to_string()),
                };
            }
            let mut record = CallRecord::new(
                call_id.clone(),
                String::new(),
                to.to_string(),
                CallDirection::Outbound,
            );
            record.metadata = CallMetadata {
                prompt: opts.prompt.clone(),
                objective: opts.objective.clone(),
                context: opts.context.clone(),
                language: opts.language.clone(),
                mode: opts.mode,
                message_to: opts.message_to.clone(),
                session_key: session_key.map(String::from),
            };
            state.calls.insert(call_id.clone(), record);
        }

        let input = InitiateCallInput {
            call_id: call_id.clone(),
            to: to.to_string(),
            greeting: Some(opts.prompt.clone()),
        };
        match self.provider.initiate_call(&input).await {
            Ok(initiated) => {
                let mut state = self.state.lock().unwrap();
                state
                    .by_provider_id
                    .insert(initiated.provider_call_id.clone(), call_id.clone());
                if let Some(record) = state.calls.get_mut(&call_id) {
                    record.provider_call_id = Some(initiated.provider_call_id.clone());
                }
                drop(state);
                info!(call_id, provider_call_id = %initiated.provider_call_id, to, "call initiated");
                self.spawn_ring_timer(call_id.clone());
                InitiateOutcome {
                    success: true,
                    call_id: Some(call_id),
                    error: None,
                }
            }
            Err(e) => {
                // The dial never happened; withdraw the record.
                let mut state = self.state.lock().unwrap();
                state.calls.remove(&call_id);
                warn!(call_id, error = %e, "provider dial failed");
                InitiateOutcome {
                    success: false,
                    call_id: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Speak a message into an in-progress call and return the transcript.
    /// Always synthesizes a bot-spoken message and appends a `bot` entry;
    /// never forges a user entry.
    pub async fn continue_call(self: &Arc<Self>, call_id: &str, message: &str) -> ContinueOutcome {
        let speak = self.speak(call_id, message).await;
        if !speak.success {
            return ContinueOutcome {
                success: false,
                transcript: None,
                error: speak.error,
            };
        }
        let transcript = self
            .get_call(call_id)
            .map(|record| record.transcript.clone());
        ContinueOutcome {
            success: true,
            transcript,
            error: None,
        }
    }

    /// Speak text to the peer. In conversation mode with streaming, goes
    /// through the bridge's TTS queue; otherwise the provider's native
    /// speak. The `bot` transcript entry is appended at emission time.
    pub async fn speak(self: &Arc<Self>, call_id: &str, text: &str) -> ActionOutcome {
        let (call_ref, mode, stream_sid) = {
            let mut state = self.state.lock().unwrap();
            let Some(record) = state.calls.get_mut(call_id) else {
                return ActionOutcome::err(format!("unknown call {}", call_id));
            };
            if record.state.is_terminal() {
                return ActionOutcome::err(format!("call {} already ended", call_id));
            }
            // Emission time, not completion time.
            record.transcript.push(TranscriptEntry {
                speaker: Speaker::Bot,
                text: text.to_string(),
                timestamp: now_millis(),
            });
            let _ = Self::transition_locked(record, CallState::Speaking);
            (
                CallRef {
                    call_id: record.call_id.clone(),
                    provider_call_id: record.provider_call_id.clone(),
                },
                record.metadata.mode,
                record.stream_sid.clone(),
            )
        };
        self.transcript_notify.notify_waiters();

        let streamed = self.streaming.enabled && mode == CallMode::Conversation;
        if streamed {
            if let Some(bridge) = self.bridge() {
                let sid = stream_sid.or_else(|| bridge.stream_for_call(call_id));
                if let Some(sid) = sid {
                    let rx = bridge.enqueue_speak(&sid, text.to_string());
                    // Playback is serialized on the stream's queue; failures
                    // there degrade to provider-native speak.
                    match rx.await {
                        Ok(Ok(_)) => return ActionOutcome::ok(),
                        Ok(Err(Error::TtsUnavailable(reason))) => {
                            warn!(call_id, %reason, "tts unavailable, falling back to provider speak");
                        }
                        Ok(Err(e)) => return ActionOutcome::err(e),
                        Err(_) => return ActionOutcome::err("playback dropped"),
                    }
                }
            }
        }

        match self.provider.play_tts(&call_ref, text).await {
            Ok(()) => ActionOutcome::ok(),
            Err(e) => ActionOutcome::err(e),
        }
    }

    pub async fn end_call(self: &Arc<Self>, call_id: &str) -> ActionOutcome {
        let call_ref = {
            let state = self.state.lock().unwrap();
            let Some(record) = state.calls.get(call_id) else {
                return ActionOutcome::err(format!("unknown call {}", call_id));
            };
            if record.state.is_terminal() {
                return ActionOutcome::ok();
            }
            CallRef {
                call_id: record.call_id.clone(),
                provider_call_id: record.provider_call_id.clone(),
            }
        };
        if let Err(e) = self.provider.hangup_call(&call_ref).await {
            // The carrier may already have torn the call down.
            debug!(call_id, error = %e, "provider hangup failed");
        }
        self.terminalize(call_id, EndReason::HangupBot);
        ActionOutcome::ok()
    }

    pub fn get_call(&self, call_id: &str) -> Option<CallRecord> {
        self.state.lock().unwrap().calls.get(call_id).cloned()
    }

    pub fn get_call_by_provider_call_id(&self, provider_call_id: &str) -> Option<CallRecord> {
        let state = self.state.lock().unwrap();
        let call_id = state.by_provider_id.get(provider_call_id)?;
        state.calls.get(call_id).cloned()
    }

    pub fn resolve_provider_call_id(&self, provider_call_id: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .by_provider_id
            .get(provider_call_id)
            .cloned()
    }

    /// Records sorted by endedAt (startedAt for live calls) descending,
    /// merging in-memory records with the persisted history.
    pub fn get_call_history(&self, limit: usize) -> Vec<CallRecord> {
        let mut records: Vec<CallRecord> = {
            let state = self.state.lock().unwrap();
            state.calls.values().cloned().collect()
        };
        let in_memory: HashSet<String> = records.iter().map(|r| r.call_id.clone()).collect();
        for record in read_history(&self.history_path) {
            if !in_memory.contains(&record.call_id) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| std::cmp::Reverse(r.ended_at.unwrap_or(r.started_at)));
        records.truncate(limit);
        records
    }

    /// Forget a call. Called after the outcome pipeline has run; history
    /// has already been persisted at terminal transition.
    pub fn remove_call(&self, call_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.calls.remove(call_id) {
            if let Some(provider_id) = &record.provider_call_id {
                state.by_provider_id.remove(provider_id);
            }
        }
    }

    // ── Event reduction ─────────────────────────────────────────────────

    /// Apply one normalized event. Events for the same call are linearized
    /// by the manager lock; transitions are synchronous inside it.
    pub fn apply_event(self: &Arc<Self>, event: &NormalizedEvent) {
        let call_id = {
            let mut state = self.state.lock().unwrap();
            let call_id = event
                .call_id
                .clone()
                .filter(|id| state.calls.contains_key(id))
                .or_else(|| {
                    event
                        .provider_call_id
                        .as_ref()
                        .and_then(|pid| state.by_provider_id.get(pid).cloned())
                });

            let call_id = match call_id {
                Some(id) => id,
                None => {
                    // First sighting of an inbound call creates its record.
                    let inbound = event.direction == Some(CallDirection::Inbound)
                        && matches!(event.kind, EventKind::Initiated | EventKind::Ringing);
                    if !inbound {
                        debug!(?event.provider_call_id, "event for unknown call dropped");
                        return;
                    }
                    let id = event
                        .call_id
                        .clone()
                        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let mut record = CallRecord::new(
                        id.clone(),
                        event.from.clone().unwrap_or_default(),
                        event.to.clone().unwrap_or_default(),
                        CallDirection::Inbound,
                    );
                    record.provider_call_id = event.provider_call_id.clone();
                    if let Some(pid) = &event.provider_call_id {
                        state.by_provider_id.insert(pid.clone(), id.clone());
                    }
                    state.calls.insert(id.clone(), record);
                    info!(call_id = %id, "inbound call record created");
                    id
                }
            };

            // Late provider-id assignment keeps both indexes aligned.
            if let (Some(pid), Some(record)) =
                (event.provider_call_id.clone(), state.calls.get_mut(&call_id))
            {
                if record.provider_call_id.is_none() {
                    record.provider_call_id = Some(pid.clone());
                    state.by_provider_id.insert(pid, call_id.clone());
                }
            }
            call_id
        };

        match &event.kind {
            EventKind::Initiated => {}
            EventKind::Ringing => {
                self.transition(&call_id, CallState::Ringing);
            }
            EventKind::Answered => {
                if self.transition(&call_id, CallState::Answered) {
                    self.transition(&call_id, CallState::Active);
                    self.spawn_duration_timer(call_id.clone());
                    self.spawn_silence_timer(call_id.clone());
                    if !self.streaming.enabled {
                        // No media stream: ask the carrier to transcribe.
                        let manager = self.clone();
                        let call_id = call_id.clone();
                        tokio::spawn(async move {
                            let call_ref = {
                                let state = manager.state.lock().unwrap();
                                state.calls.get(&call_id).map(|r| CallRef {
                                    call_id: r.call_id.clone(),
                                    provider_call_id: r.provider_call_id.clone(),
                                })
                            };
                            if let Some(call_ref) = call_ref {
                                if let Err(e) = manager.provider.start_listening(&call_ref).await {
                                    debug!(call_id = %call_ref.call_id, error = %e, "start_listening failed");
                                }
                            }
                        });
                    }
                }
            }
            EventKind::Active => {
                self.transition(&call_id, CallState::Active);
            }
            EventKind::Speaking => {
                self.transition(&call_id, CallState::Speaking);
            }
            EventKind::Speech {
                transcript,
                is_final,
                ..
            } => {
                if *is_final {
                    self.append_transcript(&call_id, Speaker::User, transcript);
                    self.transition(&call_id, CallState::Listening);
                }
            }
            EventKind::Dtmf { digits } => {
                self.append_transcript(&call_id, Speaker::User, &format!("[dtmf] {}", digits));
            }
            EventKind::Ended { reason } => {
                self.terminalize(&call_id, *reason);
            }
            EventKind::Error { error, retryable } => {
                warn!(call_id, %error, ?retryable, "provider error event");
                if *retryable == Some(false) {
                    self.terminalize(&call_id, EndReason::Failed);
                }
            }
        }
    }

    /// Bridge wiring: note the stream sid and move the call active.
    pub fn on_stream_started(self: &Arc<Self>, call_id: &str, stream_sid: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(record) = state.calls.get_mut(call_id) {
                record.stream_sid = Some(stream_sid.to_string());
            }
        }
        // A live media stream implies the call was answered.
        self.transition(call_id, CallState::Answered);
        if self.transition(call_id, CallState::Active) {
            self.spawn_duration_timer(call_id.to_string());
            self.spawn_silence_timer(call_id.to_string());
        }
    }

    pub fn append_transcript(&self, call_id: &str, speaker: Speaker, text: &str) {
        {
            let mut state = self.state.lock().unwrap();
            let Some(record) = state.calls.get_mut(call_id) else {
                return;
            };
            if record.state.is_terminal() {
                // Terminal records are immutable.
                return;
            }
            record.transcript.push(TranscriptEntry {
                speaker,
                text: text.to_string(),
                timestamp: now_millis(),
            });
            record.last_activity_at = now_millis();
        }
        self.transcript_notify.notify_waiters();
    }

    /// Wait for the next final user transcript entry after `after`.
    /// Surfaces `TranscriptTimeout` when the turn window expires.
    pub async fn wait_for_transcript(
        &self,
        call_id: &str,
        after: u64,
    ) -> crate::error::Result<TranscriptEntry> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.limits.transcript_timeout_ms);
        loop {
            {
                let state = self.state.lock().unwrap();
                let Some(record) = state.calls.get(call_id) else {
                    return Err(Error::other(format!("unknown call {}", call_id)));
                };
                if let Some(entry) = record
                    .transcript
                    .iter()
                    .rev()
                    .find(|e| e.speaker == Speaker::User && e.timestamp > after)
                {
                    return Ok(entry.clone());
                }
                if record.state.is_terminal() {
                    return Err(Error::other("call ended"));
                }
            }
            let notified = self.transcript_notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::TranscriptTimeout);
                }
            }
        }
    }

    // ── Transitions ─────────────────────────────────────────────────────

    fn transition_locked(record: &mut CallRecord, next: CallState) -> bool {
        if record.state == next {
            return true;
        }
        if !record.state.can_transition_to(next) {
            let err = Error::InvalidTransition {
                from: record.state.as_str().into(),
                to: next.as_str().into(),
            };
            debug!(call_id = %record.call_id, %err, "transition rejected");
            return false;
        }
        debug!(call_id = %record.call_id, from = %record.state, to = %next, "state transition");
        record.state = next;
        true
    }

    fn transition(self: &Arc<Self>, call_id: &str, next: CallState) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.calls.get_mut(call_id) {
            Some(record) => Self::transition_locked(record, next),
            None => false,
        }
    }

    /// Drive a call to its terminal state for `reason`, walking the
    /// `ending` hop for hangups so every observed state stays inside the
    /// transition table. Idempotent under redelivered terminal events.
    pub fn terminalize(self: &Arc<Self>, call_id: &str, reason: EndReason) {
        let record = {
            let mut state = self.state.lock().unwrap();
            let Some(record) = state.calls.get_mut(call_id) else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }

            let terminal = match reason {
                EndReason::Busy => CallState::Busy,
                EndReason::NoAnswer => CallState::NoAnswer,
                EndReason::Voicemail => CallState::Voicemail,
                EndReason::Timeout => CallState::Timeout,
                EndReason::HangupUser => CallState::HangupUser,
                EndReason::HangupBot => CallState::HangupBot,
                EndReason::Failed | EndReason::RealtimeDisconnected => CallState::Failed,
                EndReason::Completed => CallState::Completed,
            };

            if matches!(terminal, CallState::HangupUser | CallState::HangupBot) {
                // Hangups route through `ending`; walk intermediate edges.
                if matches!(record.state, CallState::Initiating | CallState::Ringing) {
                    Self::transition_locked(record, CallState::Ringing);
                    Self::transition_locked(record, CallState::Answered);
                }
                if record.state == CallState::Answered {
                    Self::transition_locked(record, CallState::Active);
                }
                Self::transition_locked(record, CallState::Ending);
                if !Self::transition_locked(record, terminal) {
                    return;
                }
            } else if !Self::transition_locked(record, terminal) {
                return;
            }

            record.end_reason = Some(reason);
            record.ended_at = Some(now_millis());

            let dedup_key = (call_id.to_string(), terminal);
            if !state.ended_emitted.insert(dedup_key) {
                return;
            }
            state.calls.get(call_id).cloned()
        };

        let Some(record) = record else { return };
        info!(
            call_id,
            state = %record.state,
            reason = %reason,
            "call ended"
        );

        append_history(&self.history_path, &record);
        self.transcript_notify.notify_waiters();

        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(record);
        }
    }

    // ── Timers ──────────────────────────────────────────────────────────

    fn spawn_ring_timer(self: &Arc<Self>, call_id: String) {
        let manager = self.clone();
        let timeout = Duration::from_millis(self.limits.ring_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_ringing = manager
                .get_call(&call_id)
                .map(|r| matches!(r.state, CallState::Initiating | CallState::Ringing))
                .unwrap_or(false);
            if still_ringing {
                info!(%call_id, "ring timeout, marking no-answer");
                manager.terminalize(&call_id, EndReason::NoAnswer);
            }
        });
    }

    fn spawn_duration_timer(self: &Arc<Self>, call_id: String) {
        let manager = self.clone();
        let timeout = Duration::from_secs(self.limits.max_duration_seconds);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let live = manager
                .get_call(&call_id)
                .map(|r| !r.state.is_terminal())
                .unwrap_or(false);
            if live {
                info!(%call_id, "max duration reached");
                manager.terminalize(&call_id, EndReason::Timeout);
            }
        });
    }

    fn spawn_silence_timer(self: &Arc<Self>, call_id: String) {
        let manager = self.clone();
        let window = Duration::from_millis(self.limits.silence_timeout_ms);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                let Some(record) = manager.get_call(&call_id) else { return };
                if record.state.is_terminal() {
                    return;
                }
                let idle = now_millis().saturating_sub(record.last_activity_at);
                if idle >= window.as_millis() as u64 {
                    info!(%call_id, idle_ms = idle, "silence timeout");
                    manager.terminalize(&call_id, EndReason::Timeout);
                    return;
                }
                // Activity arrived; sleep out the remainder of the window.
            }
        });
    }

    /// Peer started speaking (VAD). Updates activity and drops the call
    /// into `listening` while any bot playback is barged in.
    pub fn note_speech_start(self: &Arc<Self>, call_id: &str) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(record) = state.calls.get_mut(call_id) {
                record.last_activity_at = now_millis();
            }
        }
        self.transition(call_id, CallState::Listening);
    }

    /// Realtime session lost. Terminal in conversation mode; transcription
    /// mode already reconnects inside the session.
    pub fn on_realtime_lost(self: &Arc<Self>, call_id: &str, reason: &str) {
        let conversation = self
            .get_call(call_id)
            .map(|r| r.metadata.mode == CallMode::Conversation)
            .unwrap_or(false);
        if conversation {
            warn!(call_id, reason, "realtime session lost in conversation mode");
            self.terminalize(call_id, EndReason::RealtimeDisconnected);
        }
    }

    pub fn streaming_mode(&self) -> StreamingMode {
        self.streaming.mode
    }
}

fn looks_like_e164(number: &str) -> bool {
    let digits = number.strip_prefix('+').unwrap_or(number);
    !digits.is_empty() && digits.len() <= 15 && digits.chars().all(|c| c.is_ascii_digit())
}

// ── History log ─────────────────────────────────────────────────────────

fn append_history(path: &PathBuf, record: &CallRecord) {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let line = match serde_json::to_string(record) {
        Ok(line) => line,
        Err(e) => {
            warn!(error = %e, "history record not serializable");
            return;
        }
    };
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut file) => {
            if let Err(e) = writeln!(file, "{}", line) {
                warn!(error = %e, path = %path.display(), "history append failed");
            }
        }
        Err(e) => warn!(error = %e, path = %path.display(), "history file not writable"),
    }
}

/// Read persisted history, skipping truncated or malformed trailing lines.
pub fn read_history(path: &PathBuf) -> Vec<CallRecord> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|line| serde_json::from_str::<CallRecord>(line).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    fn test_manager() -> (Arc<CallManager>, Arc<MockProvider>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        let manager = CallManager::new(
            provider.clone(),
            LimitsConfig::default(),
            StreamingConfig::default(),
            dir.path().join("calls.jsonl"),
        );
        (manager, provider, dir)
    }

    fn event(kind: EventKind, provider_call_id: &str) -> NormalizedEvent {
        NormalizedEvent::new(kind).with_provider_call_id(provider_call_id)
    }

    #[tokio::test]
    async fn happy_outbound_path() {
        let (manager, _provider, _dir) = test_manager();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        manager.set_on_call_ended_hook(Box::new(move |record| {
            fired_clone.lock().unwrap().push(record);
        }));

        let outcome = manager
            .initiate_call(
                "+15550001111",
                Some("agent:main:telegram:dm:42"),
                CallOptions {
                    prompt: "Забронировать столик на имя Елена, завтра 20:00, 4 гостя".into(),
                    ..Default::default()
                },
            )
            .await;
        assert!(outcome.success, "{:?}", outcome.error);
        let call_id = outcome.call_id.unwrap();
        let record = manager.get_call(&call_id).unwrap();
        assert_eq!(record.state, CallState::Initiating);
        assert_eq!(record.provider_call_id.as_deref(), Some("MOCK-1"));

        manager.apply_event(&event(EventKind::Ringing, "MOCK-1"));
        assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::Ringing);

        manager.apply_event(&event(EventKind::Answered, "MOCK-1"));
        assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::Active);

        manager.apply_event(&event(
            EventKind::Ended {
                reason: EndReason::HangupUser,
            },
            "MOCK-1",
        ));

        let record = manager.get_call(&call_id).unwrap();
        assert_eq!(record.state, CallState::HangupUser);
        assert_eq!(record.end_reason, Some(EndReason::HangupUser));
        assert!(record.ended_at.is_some());
        assert_eq!(fired.lock().unwrap().len(), 1);

        let history = manager.get_call_history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].call_id, call_id);
    }

    #[tokio::test]
    async fn redelivered_terminal_event_fires_hook_once() {
        let (manager, _provider, _dir) = test_manager();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        manager.set_on_call_ended_hook(Box::new(move |_| {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let outcome = manager
            .initiate_call("+15550001111", None, CallOptions::default())
            .await;
        let call_id = outcome.call_id.unwrap();
        manager.apply_event(&event(EventKind::Answered, "MOCK-1"));

        let ended = event(
            EventKind::Ended {
                reason: EndReason::HangupUser,
            },
            "MOCK-1",
        );
        manager.apply_event(&ended);
        manager.apply_event(&ended);
        manager.apply_event(&ended);

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::HangupUser);
    }

    #[tokio::test]
    async fn invalid_transitions_are_rejected() {
        let (manager, _provider, _dir) = test_manager();
        let outcome = manager
            .initiate_call("+15550001111", None, CallOptions::default())
            .await;
        let call_id = outcome.call_id.unwrap();

        // answered before ringing is not an edge
        manager.apply_event(&event(EventKind::Answered, "MOCK-1"));
        assert_eq!(
            manager.get_call(&call_id).unwrap().state,
            CallState::Initiating
        );

        manager.apply_event(&event(EventKind::Ringing, "MOCK-1"));
        manager.apply_event(&event(EventKind::Answered, "MOCK-1"));
        assert_eq!(manager.get_call(&call_id).unwrap().state, CallState::Active);

        // No transitions out of a terminal state.
        manager.apply_event(&event(
            EventKind::Ended {
                reason: EndReason::Completed,
            },
            "MOCK-1",
        ));
        manager.apply_event(&event(EventKind::Ringing, "MOCK-1"));
        assert_eq!(
            manager.get_call(&call_id).unwrap().state,
            CallState::Completed
        );
    }

    #[tokio::test]
    async fn concurrency_cap_refuses_extra_calls() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        let limits = LimitsConfig {
            max_concurrent_calls: 1,
            ..Default::default()
        };
        let manager = CallManager::new(
            provider,
            limits,
            StreamingConfig::default(),
            dir.path().join("calls.jsonl"),
        );

        let first = manager
            .initiate_call("+15550001111", None, CallOptions::default())
            .await;
        assert!(first.success);
        let second = manager
            .initiate_call("+15550002222", None, CallOptions::default())
            .await;
        assert!(!second.success);
        assert!(second.error.unwrap().contains("too many"));

        // Finishing the first call frees a slot.
        manager.terminalize(&first.call_id.unwrap(), EndReason::Completed);
        let third = manager
            .initiate_call("+15550003333", None, CallOptions::default())
            .await;
        assert!(third.success);
    }

    #[tokio::test]
    async fn speech_events_build_transcript_in_order() {
        let (manager, _provider, _dir) = test_manager();
        let outcome = manager
            .initiate_call("+15550001111", None, CallOptions::default())
            .await;
        let call_id = outcome.call_id.unwrap();
        manager.apply_event(&event(EventKind::Ringing, "MOCK-1"));
        manager.apply_event(&event(EventKind::Answered, "MOCK-1"));

        manager.apply_event(&event(
            EventKind::Speech {
                transcript: "Алло".into(),
                is_final: true,
                confidence: None,
            },
            "MOCK-1",
        ));
        // Partials never land in the transcript.
        manager.apply_event(&event(
            EventKind::Speech {
                transcript: "Да, слу".into(),
                is_final: false,
                confidence: None,
            },
            "MOCK-1",
        ));
        manager.apply_event(&event(
            EventKind::Speech {
                transcript: "Да, слушаю".into(),
                is_final: true,
                confidence: Some(0.9),
            },
            "MOCK-1",
        ));

        let record = manager.get_call(&call_id).unwrap();
        let texts: Vec<&str> = record.transcript.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["Алло", "Да, слушаю"]);
        assert!(record
            .transcript
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn speak_appends_bot_entry_and_continue_returns_transcript() {
        let (manager, provider, _dir) = test_manager();
        let outcome = manager
            .initiate_call("+15550001111", None, CallOptions::default())
            .await;
        let call_id = outcome.call_id.unwrap();
        manager.apply_event(&event(EventKind::Ringing, "MOCK-1"));
        manager.apply_event(&event(EventKind::Answered, "MOCK-1"));

        let result = manager.continue_call(&call_id, "Здравствуйте!").await;
        assert!(result.success);
        let transcript = result.transcript.unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].speaker, Speaker::Bot);
        // The message went out through provider-native speak.
        assert!(!provider.commands().is_empty());
    }

    #[tokio::test]
    async fn inbound_event_creates_record_with_reverse_index() {
        let (manager, _provider, _dir) = test_manager();
        let mut inbound = event(EventKind::Ringing, "CA-IN-1");
        inbound.direction = Some(CallDirection::Inbound);
        inbound.from = Some("+15550007777".into());
        inbound.to = Some("+15550009999".into());
        manager.apply_event(&inbound);

        let record = manager.get_call_by_provider_call_id("CA-IN-1").unwrap();
        assert_eq!(record.direction, CallDirection::Inbound);
        assert_eq!(record.state, CallState::Ringing);
        assert_eq!(record.from, "+15550007777");
        // Both indexes resolve to the same record.
        let by_id = manager.get_call(&record.call_id).unwrap();
        assert_eq!(by_id.call_id, record.call_id);
    }

    #[tokio::test]
    async fn terminal_record_transcript_is_immutable() {
        let (manager, _provider, _dir) = test_manager();
        let outcome = manager
            .initiate_call("+15550001111", None, CallOptions::default())
            .await;
        let call_id = outcome.call_id.unwrap();
        manager.terminalize(&call_id, EndReason::Completed);
        manager.append_transcript(&call_id, Speaker::User, "после конца");
        assert!(manager.get_call(&call_id).unwrap().transcript.is_empty());
    }

    #[tokio::test]
    async fn bad_number_is_refused() {
        let (manager, _provider, _dir) = test_manager();
        let outcome = manager
            .initiate_call("call-me-maybe", None, CallOptions::default())
            .await;
        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn transcript_wait_resolves_or_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new());
        let limits = LimitsConfig {
            transcript_timeout_ms: 100,
            ..Default::default()
        };
        let manager = CallManager::new(
            provider,
            limits,
            StreamingConfig::default(),
            dir.path().join("calls.jsonl"),
        );
        let outcome = manager
            .initiate_call("+15550001111", None, CallOptions::default())
            .await;
        let call_id = outcome.call_id.unwrap();
        manager.apply_event(&event(EventKind::Ringing, "MOCK-1"));
        manager.apply_event(&event(EventKind::Answered, "MOCK-1"));

        // A reply arriving inside the window resolves the wait.
        let waiter = {
            let manager = manager.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move { manager.wait_for_transcript(&call_id, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.append_transcript(&call_id, Speaker::User, "Слушаю вас");
        let entry = waiter.await.unwrap().unwrap();
        assert_eq!(entry.text, "Слушаю вас");

        // Silence past the window surfaces TranscriptTimeout.
        let after = entry.timestamp;
        let err = manager.wait_for_transcript(&call_id, after).await.unwrap_err();
        assert!(matches!(err, Error::TranscriptTimeout));
    }

    #[test]
    fn truncated_history_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");
        let record = CallRecord::new(
            "c1".into(),
            "+1".into(),
            "+2".into(),
            CallDirection::Outbound,
        );
        let full = serde_json::to_string(&record).unwrap();
        std::fs::write(&path, format!("{}\n{}", full, &full[..full.len() / 2])).unwrap();
        let records = read_history(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].call_id, "c1");
    }

    #[test]
    fn transition_table_spot_checks() {
        use CallState::*;
        assert!(Initiating.can_transition_to(Ringing));
        assert!(!Initiating.can_transition_to(Answered));
        assert!(Active.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Speaking));
        assert!(!Speaking.can_transition_to(Answered));
        assert!(Ending.can_transition_to(HangupUser));
        assert!(!Answered.can_transition_to(HangupUser));
        // Any non-terminal may fail.
        assert!(Ringing.can_transition_to(Busy));
        assert!(Listening.can_transition_to(Timeout));
        assert!(!Completed.can_transition_to(Failed));
    }
}
