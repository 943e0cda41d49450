//! Google Calendar "TEMPLATE" URL builder.
//!
//! Event times are local wall-clock components in Europe/Moscow, carried
//! verbatim into the `dates` parameter with `ctz=Europe/Moscow`. End time
//! is computed with integer minute arithmetic on (hour, minute, day),
//! carrying day/month/year overflow; the host time zone is never
//! consulted. Cyrillic parameter values are percent-encoded; the final URL
//! contains no raw non-ASCII.

use serde::{Deserialize, Serialize};

pub const DEFAULT_DURATION_MINUTES: u32 = 90;

/// Structured booking extracted from the call transcript. Only
/// `confirmed == true` records with a valid date and time are eligible
/// for calendar-URL emission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookingDetails {
    pub confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restaurant: Option<String>,
    /// `YYYY-MM-DD`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// `HH:MM`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl BookingDetails {
    /// Defensive extraction: every field is type-checked at runtime and
    /// silently dropped when its JSON type is not the declared one.
    /// `confirmed != true` yields `None`.
    pub fn from_value(value: &serde_json::Value) -> Option<BookingDetails> {
        let obj = value.as_object()?;
        if obj.get("confirmed").and_then(|v| v.as_bool()) != Some(true) {
            return None;
        }
        let string = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        let count = |key: &str| {
            obj.get(key)
                .and_then(|v| v.as_u64())
                .and_then(|n| u32::try_from(n).ok())
                .filter(|n| *n > 0)
        };
        Some(BookingDetails {
            confirmed: true,
            restaurant: string("restaurant"),
            date: string("date"),
            time: string("time"),
            duration_minutes: count("durationMinutes"),
            guest_name: string("guestName"),
            guest_count: count("guestCount"),
            address: string("address"),
            notes: string("notes"),
        })
    }
}

fn parse_date(raw: &str) -> Option<(u32, u32, u32)> {
    let mut parts = raw.split('-');
    let year: u32 = parse_fixed(parts.next()?, 4)?;
    let month: u32 = parse_fixed(parts.next()?, 2)?;
    let day: u32 = parse_fixed(parts.next()?, 2)?;
    if parts.next().is_some() || !(1..=12).contains(&month) {
        return None;
    }
    if day < 1 || day > days_in_month(year, month) {
        return None;
    }
    Some((year, month, day))
}

fn parse_time(raw: &str) -> Option<(u32, u32)> {
    let mut parts = raw.split(':');
    let hour: u32 = parse_fixed(parts.next()?, 2)?;
    let minute: u32 = parse_fixed(parts.next()?, 2)?;
    if parts.next().is_some() || hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

fn parse_fixed(raw: &str, width: usize) -> Option<u32> {
    if raw.len() != width || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

fn is_leap_year(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn days_in_month(year: u32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if is_leap_year(year) => 29,
        2 => 28,
        _ => 0,
    }
}

/// Add minutes to local wall-clock components, carrying overflow through
/// day, month, and year. Pure integer arithmetic.
fn add_minutes(
    (mut year, mut month, mut day): (u32, u32, u32),
    (hour, minute): (u32, u32),
    add: u32,
) -> (u32, u32, u32, u32, u32) {
    let total = hour * 60 + minute + add;
    let mut carry_days = total / (24 * 60);
    let remainder = total % (24 * 60);
    let end_hour = remainder / 60;
    let end_minute = remainder % 60;
    while carry_days > 0 {
        let month_days = days_in_month(year, month);
        if day + carry_days <= month_days {
            day += carry_days;
            carry_days = 0;
        } else {
            carry_days -= month_days - day + 1;
            day = 1;
            month += 1;
            if month > 12 {
                month = 1;
                year += 1;
            }
        }
    }
    (year, month, day, end_hour, end_minute)
}

/// Title: `"Бронь: "` plus the comma-joined nonempty of restaurant,
/// `"на имя <guest>"`, `"<count> чел."`; or the generic fallback.
fn event_title(booking: &BookingDetails) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(restaurant) = &booking.restaurant {
        parts.push(restaurant.clone());
    }
    if let Some(name) = &booking.guest_name {
        parts.push(format!("на имя {}", name));
    }
    if let Some(count) = booking.guest_count {
        parts.push(format!("{} чел.", count));
    }
    if parts.is_empty() {
        "Бронирование столика".to_string()
    } else {
        format!("Бронь: {}", parts.join(", "))
    }
}

/// Build the calendar URL, or `None` when the booking is unconfirmed or
/// its date/time are missing or malformed.
pub fn build_calendar_url(booking: &BookingDetails) -> Option<String> {
    if !booking.confirmed {
        return None;
    }
    let date = parse_date(booking.date.as_deref()?)?;
    let time = parse_time(booking.time.as_deref()?)?;
    let duration = booking
        .duration_minutes
        .unwrap_or(DEFAULT_DURATION_MINUTES);

    let (sy, sm, sd) = date;
    let (sh, smin) = time;
    let (ey, em, ed, eh, emin) = add_minutes(date, time, duration);

    let dates = format!(
        "{:04}{:02}{:02}T{:02}{:02}00/{:04}{:02}{:02}T{:02}{:02}00",
        sy, sm, sd, sh, smin, ey, em, ed, eh, emin
    );
    let location = booking
        .address
        .clone()
        .or_else(|| booking.restaurant.clone())
        .unwrap_or_default();

    let mut url = String::from("https://calendar.google.com/calendar/render?action=TEMPLATE");
    url.push_str("&text=");
    url.push_str(&urlencoding::encode(&event_title(booking)));
    url.push_str("&dates=");
    url.push_str(&dates);
    url.push_str("&ctz=Europe%2FMoscow");
    if !location.is_empty() {
        url.push_str("&location=");
        url.push_str(&urlencoding::encode(&location));
    }
    if let Some(notes) = &booking.notes {
        url.push_str("&details=");
        url.push_str(&urlencoding::encode(notes));
    }
    Some(url)
}
