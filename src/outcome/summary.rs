use std::time::Duration;

use chrono::{Datelike, FixedOffset, Utc};

use crate::call::{CallRecord, Speaker};
use crate::config::SummaryConfig;
use crate::error::BridgeError;

use super::calendar::BookingDetails;

const SUMMARY_TIMEOUT: Duration = Duration::from_secs(15);
/// The model only ever sees the tail of very long calls.
const TRANSCRIPT_CLAMP: usize = 120;

const SYSTEM_PROMPT: &str = "Ты — консьерж, который отчитывается о результате \
телефонного звонка. По расшифровке разговора составь короткое резюме на \
русском языке (2-4 предложения): что удалось узнать или о чём договорились. \
Если в разговоре подтвердили бронирование, заполни поле booking, иначе \
booking = null. Даты приводи в формате YYYY-MM-DD, время в формате HH:MM. \
Отвечай строго одним JSON-объектом вида \
{\"summary\": string, \"booking\": {\"confirmed\": bool, \"restaurant\": string, \
\"date\": string, \"time\": string, \"durationMinutes\": number, \
\"guestName\": string, \"guestCount\": number, \"address\": string, \
\"notes\": string} | null} без пояснений и разметки.";

#[derive(Debug, Clone)]
pub struct CallSummary {
    pub summary: String,
    pub booking: Option<BookingDetails>,
}

/// One-shot JSON-mode LLM client for post-call summaries.
pub struct SummaryClient {
    client: reqwest::Client,
    config: SummaryConfig,
}

impl SummaryClient {
    pub fn new(config: SummaryConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub async fn summarize(&self, record: &CallRecord) -> Result<CallSummary, BridgeError> {
        if self.config.api_key.is_empty() {
            return Err(BridgeError::SummaryFailed("no LLM API key configured".into()));
        }

        let system = format!(
            "{SYSTEM_PROMPT}\n\nСправка: {}.",
            moscow_reference(Utc::now().timestamp())
        );
        let user = transcript_text(record);

        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
            "response_format": { "type": "json_object" },
            "temperature": 0.2,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(SUMMARY_TIMEOUT)
            .send()
            .await
            .map_err(|e| BridgeError::SummaryFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            return Err(BridgeError::SummaryFailed(format!("LLM returned {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::SummaryFailed(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| BridgeError::SummaryFailed("LLM response missing content".into()))?;

        Ok(parse_summary_json(content))
    }
}

/// Transcript rendered for the model, clamped to the last entries.
pub fn transcript_text(record: &CallRecord) -> String {
    let start = record.transcript.len().saturating_sub(TRANSCRIPT_CLAMP);
    let mut out = format!(
        "Звонок {} -> {}. Расшифровка:\n",
        record.from, record.to
    );
    for entry in &record.transcript[start..] {
        let speaker = match entry.speaker {
            Speaker::Bot | Speaker::Assistant => "Ассистент",
            Speaker::User => "Собеседник",
        };
        out.push_str(&format!("{speaker}: {}\n", entry.text));
    }
    out
}

/// Defensive parse: unparseable responses become a plain-text summary, and
/// booking fields with wrong runtime types are dropped.
pub fn parse_summary_json(text: &str) -> CallSummary {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            return CallSummary {
                summary: text.trim().to_string(),
                booking: None,
            }
        }
    };

    let summary = value["summary"]
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| text.trim().to_string());

    CallSummary {
        summary,
        booking: parse_booking(&value["booking"]),
    }
}

fn parse_booking(value: &serde_json::Value) -> Option<BookingDetails> {
    let obj = value.as_object()?;

    // Anything other than a literal true means no booking.
    if obj.get("confirmed").and_then(|v| v.as_bool()) != Some(true) {
        return None;
    }

    let string = |key: &str| -> Option<String> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let number = |key: &str| -> Option<u32> {
        obj.get(key)
            .and_then(|v| v.as_u64())
            .filter(|&n| n > 0 && n < 100_000)
            .map(|n| n as u32)
    };

    Some(BookingDetails {
        confirmed: true,
        restaurant: string("restaurant"),
        date: string("date"),
        time: string("time"),
        duration_minutes: number("durationMinutes"),
        guest_name: string("guestName"),
        guest_count: number("guestCount"),
        address: string("address"),
        notes: string("notes"),
    })
}

/// Deterministic fallback when the summary LLM is unreachable.
pub fn fallback_summary(record: &CallRecord) -> String {
    let reason = record.end_reason.as_deref().unwrap_or("completed");
    let turns = record.transcript.len();
    format!(
        "Звонок на {} завершён ({reason}). Реплик в разговоре: {turns}.",
        record.to
    )
}

const WEEKDAYS_RU: [&str; 7] = [
    "понедельник",
    "вторник",
    "среда",
    "четверг",
    "пятница",
    "суббота",
    "воскресенье",
];

/// Reference date string in Europe/Moscow (fixed UTC+3), e.g.
/// "сегодня вторник, 25.02.2025".
pub fn moscow_reference(unix_secs: i64) -> String {
    let moscow = FixedOffset::east_opt(3 * 3600).expect("valid offset");
    let dt = chrono::DateTime::from_timestamp(unix_secs, 0)
        .unwrap_or_default()
        .with_timezone(&moscow);
    let weekday = WEEKDAYS_RU[dt.weekday().num_days_from_monday() as usize];
    format!(
        "сегодня {weekday}, {:02}.{:02}.{:04}",
        dt.day(),
        dt.month(),
        dt.year()
    )
}
