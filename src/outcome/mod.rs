//! Post-hangup outcome pipeline.
//!
//! Runs once per terminal call. A secondary JSON-mode LLM turns the
//! transcript into a concierge summary plus a structured booking record;
//! confirmed bookings get a Google Calendar link appended. The result is
//! delivered to the originating chat when a channel id resolves, or
//! enqueued as a system event for the next agent turn otherwise.

pub mod calendar;

pub use calendar::{build_calendar_url, BookingDetails};

use crate::config::OutcomeConfig;
use crate::error::{Error, Result};
use crate::host::HostRuntime;
use crate::manager::{CallRecord, Speaker};
use chrono::{Datelike, FixedOffset, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The transcript sent to the summary model is clamped to this many
/// trailing entries.
const TRANSCRIPT_CLAMP: usize = 120;
const SUMMARY_TIMEOUT: Duration = Duration::from_secs(15);
const TASK_CAP_CHARS: usize = 300;

static SESSION_CHAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"telegram:(dm|group|direct):(-?\d+)").unwrap());
static MESSAGE_TO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^telegram:(?:[a-z]+:)?(-?\d+)$").unwrap());
static DIAL_PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*позвонить\s+(?:по\s+номеру\s+)?\+?[\d\s\-()]{5,}\s+и\s+").unwrap()
});
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

const WEEKDAYS_RU: [&str; 7] = [
    "понедельник",
    "вторник",
    "среда",
    "четверг",
    "пятница",
    "суббота",
    "воскресенье",
];

/// Resolve the delivery chat id from the session key, falling back to an
/// explicit `messageTo` (`telegram:<id>` or `telegram:<type>:<id>`).
pub fn resolve_chat_id(session_key: Option<&str>, message_to: Option<&str>) -> Option<String> {
    if let Some(key) = session_key {
        if let Some(caps) = SESSION_CHAT_RE.captures(key) {
            return Some(caps[2].to_string());
        }
    }
    if let Some(to) = message_to {
        if let Some(caps) = MESSAGE_TO_RE.captures(to.trim()) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Strip a leading "позвонить (по номеру)? <phone> и " phrase, collapse
/// whitespace, cap at 300 characters, uppercase the first letter.
/// Idempotent.
pub fn sanitize_task(task: &str) -> String {
    let stripped = DIAL_PREFIX_RE.replace(task, "");
    let collapsed = WHITESPACE_RE.replace_all(stripped.trim(), " ");
    let capped: String = collapsed.chars().take(TASK_CAP_CHARS).collect();
    let mut chars = capped.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => capped,
    }
}

/// Reference "today" rendered for the concierge prompt, fixed to
/// Europe/Moscow (UTC+3, no DST since 2014).
pub fn moscow_reference_date() -> String {
    let moscow = FixedOffset::east_opt(3 * 3600).expect("static offset");
    let now = Utc::now().with_timezone(&moscow);
    let weekday = WEEKDAYS_RU[now.weekday().num_days_from_monday() as usize];
    format!("{} ({})", now.format("%Y-%m-%d"), weekday)
}

const CONCIERGE_SYSTEM_PROMPT: &str = "Ты — ассистент-консьерж. Тебе дают расшифровку телефонного разговора \
(бот звонил по поручению пользователя). Составь короткое резюме разговора по-русски: что удалось, что нет, \
ключевые детали (имена, даты, время, адреса). Если в разговоре подтверждена бронь — заполни поле booking. \
Отвечай строго одним JSON-объектом вида {\"summary\": string, \"booking\": {\"confirmed\": bool, \
\"restaurant\"?: string, \"date\"?: \"YYYY-MM-DD\", \"time\"?: \"HH:MM\", \"durationMinutes\"?: number, \
\"guestName\"?: string, \"guestCount\"?: number, \"address\"?: string, \"notes\"?: string} | null}. \
Если брони нет или она не подтверждена, booking = null. Даты всегда в формате YYYY-MM-DD.";

pub struct OutcomePipeline {
    config: OutcomeConfig,
    host: Arc<dyn HostRuntime>,
    http: reqwest::Client,
}

impl OutcomePipeline {
    pub fn new(config: OutcomeConfig, host: Arc<dyn HostRuntime>) -> Arc<Self> {
        Arc::new(Self {
            config,
            host,
            http: reqwest::Client::new(),
        })
    }

    /// Run the pipeline for one terminal call record.
    pub async fn run(&self, record: &CallRecord) {
        let chat_id = resolve_chat_id(
            record.metadata.session_key.as_deref(),
            record.metadata.message_to.as_deref(),
        );

        let (summary, booking) = match self.summarize(record).await {
            Ok(result) => result,
            Err(e) => {
                warn!(call_id = %record.call_id, error = %e, "summary failed, using template");
                (template_summary(record), None)
            }
        };

        let mut text = summary;
        if let Some(booking) = &booking {
            if let Some(url) = build_calendar_url(booking) {
                text.push_str(&format!("\n\n[📅 Добавить в календарь]({})", url));
            }
        }

        match chat_id {
            Some(chat_id) => {
                info!(call_id = %record.call_id, chat_id, "delivering call summary to chat");
                if let Err(e) = self.host.send_message(&chat_id, &text).await {
                    // Logged, never retried.
                    warn!(call_id = %record.call_id, error = %e, "summary delivery failed");
                }
            }
            None => {
                let Some(session_key) = record.metadata.session_key.as_deref() else {
                    warn!(call_id = %record.call_id, "no session key, outcome dropped");
                    return;
                };
                let context_key = format!("voice-call:{}:ended", record.call_id);
                let payload = serde_json::json!({
                    "callId": record.call_id,
                    "state": record.state,
                    "endReason": record.end_reason,
                    "to": record.to,
                    "summary": text,
                    "booking": booking,
                });
                let event_text = format!(
                    "Звонок на {} завершён.\n{}\n\n{}",
                    record.to, text, payload
                );
                if let Err(e) = self
                    .host
                    .enqueue_system_event(&event_text, session_key, &context_key)
                    .await
                {
                    warn!(call_id = %record.call_id, error = %e, "system event enqueue failed");
                }
            }
        }
    }

    /// One request to the JSON-mode summary model, 15 s bound.
    async fn summarize(&self, record: &CallRecord) -> Result<(String, Option<BookingDetails>)> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(Error::SummaryFailed("no summary api key".into()))?;

        let transcript_tail: Vec<String> = record
            .transcript
            .iter()
            .rev()
            .take(TRANSCRIPT_CLAMP)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|entry| {
                let speaker = match entry.speaker {
                    Speaker::Bot => "бот",
                    Speaker::User => "собеседник",
                    Speaker::Assistant => "бот",
                };
                format!("{}: {}", speaker, entry.text)
            })
            .collect();

        let user_prompt = format!(
            "Сегодня: {}.\nЗадача звонка: {}\nНомер: {}\nИтог: {}\n\nРасшифровка:\n{}",
            moscow_reference_date(),
            record.metadata.prompt,
            record.to,
            record
                .end_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".into()),
            transcript_tail.join("\n"),
        );

        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .timeout(SUMMARY_TIMEOUT)
            .json(&serde_json::json!({
                "model": self.config.model,
                "messages": [
                    {"role": "system", "content": CONCIERGE_SYSTEM_PROMPT},
                    {"role": "user", "content": user_prompt},
                ],
                "response_format": {"type": "json_object"},
                "temperature": 0.2,
            }))
            .send()
            .await
            .map_err(|e| Error::SummaryFailed(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(Error::SummaryFailed(format!(
                "summary model returned {}",
                resp.status()
            )));
        }
        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| Error::SummaryFailed(e.to_string()))?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| Error::SummaryFailed("empty completion".into()))?;

        Ok(parse_summary_response(content))
    }
}

/// Defensive parse of the model's JSON. Parse failures degrade to using
/// the raw text as the summary with no booking.
pub fn parse_summary_response(raw: &str) -> (String, Option<BookingDetails>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return (raw.trim().to_string(), None);
    };
    let summary = value["summary"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .unwrap_or_else(|| raw.trim().to_string());
    let booking = BookingDetails::from_value(&value["booking"]);
    (summary, booking)
}

/// Deterministic fallback when the summary model is unavailable.
pub fn template_summary(record: &CallRecord) -> String {
    let reason = record
        .end_reason
        .map(|r| r.to_string())
        .unwrap_or_else(|| record.state.to_string());
    let user_turns = record
        .transcript
        .iter()
        .filter(|e| e.speaker == Speaker::User)
        .count();
    format!(
        "Звонок на {} завершён ({}). Реплик собеседника: {}. Задача: {}",
        record.to,
        reason,
        user_turns,
        sanitize_task(&record.metadata.prompt)
    )
}
