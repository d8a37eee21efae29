pub mod calendar;
pub mod summary;

use std::sync::Arc;

use crate::call::CallRecord;
use crate::config::{HostRuntimeConfig, SummaryConfig};
use crate::error::BridgeError;

use calendar::calendar_url;
use summary::{fallback_summary, SummaryClient};

/// HTTP client for the host runtime: direct chat delivery and system-event
/// enqueueing for the next agent turn.
pub struct HostClient {
    client: reqwest::Client,
    config: HostRuntimeConfig,
}

impl HostClient {
    pub fn new(config: HostRuntimeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn configured(&self) -> bool {
        !self.config.base_url.is_empty()
    }

    /// Proactively deliver text to a chat. Failures are logged, never
    /// retried.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), BridgeError> {
        let url = format!("{}/send-message", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&serde_json::json!({ "chatId": chat_id, "text": text }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(BridgeError::ProviderError { status, body })
        }
    }

    /// Enqueue a system event for the originating session. The context key
    /// makes redelivery a no-op on the host side.
    pub async fn enqueue_system_event(
        &self,
        text: &str,
        session_key: &str,
        context_key: &str,
    ) -> Result<(), BridgeError> {
        let url = format!("{}/enqueue-event", self.config.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&serde_json::json!({
                "text": text,
                "sessionKey": session_key,
                "contextKey": context_key,
            }))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(BridgeError::ProviderError { status, body })
        }
    }
}

/// Post-hangup path: summarize the transcript, attach a calendar link for a
/// confirmed booking, then deliver to the originating chat or enqueue a
/// system event.
pub struct OutcomePipeline {
    summary: SummaryClient,
    host: Arc<HostClient>,
}

impl OutcomePipeline {
    pub fn new(summary_config: SummaryConfig, host: Arc<HostClient>) -> Self {
        Self {
            summary: SummaryClient::new(summary_config),
            host,
        }
    }

    /// Runs once per terminal call, as the manager's end-of-call hook.
    pub async fn run(&self, record: CallRecord) {
        let call_id = record.call_id.clone();
        tracing::info!(call_id = %call_id, "Running outcome pipeline");

        let chat_id = resolve_chat_id(
            record.metadata.session_key.as_deref(),
            record.metadata.message_to.as_deref(),
        );
        let session_key = record.metadata.session_key.clone();

        if chat_id.is_none() && session_key.is_none() {
            tracing::info!(call_id = %call_id, "No delivery channel for outcome, skipping");
            return;
        }

        let parsed = match self.summary.summarize(&record).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(call_id = %call_id, "Summary failed, using template: {e}");
                summary::CallSummary {
                    summary: fallback_summary(&record),
                    booking: None,
                }
            }
        };

        let mut text = parsed.summary.clone();
        if let Some(ref booking) = parsed.booking {
            if let Some(url) = calendar_url(booking) {
                text.push_str(&format!("\n\n[📅 Добавить в календарь]({url})"));
            }
        }

        if !self.host.configured() {
            tracing::warn!(call_id = %call_id, "Host runtime not configured, outcome not delivered");
            return;
        }

        if let Some(chat_id) = chat_id {
            if let Err(e) = self.host.send_message(&chat_id, &text).await {
                tracing::error!(call_id = %call_id, chat_id = %chat_id, "Outcome delivery failed: {e}");
            }
            return;
        }

        let session_key = session_key.expect("checked above");
        let context_key = format!("voice-call:{call_id}:ended");
        let payload = serde_json::json!({
            "callId": call_id,
            "state": record.state,
            "endReason": record.end_reason,
            "summary": parsed.summary,
            "booking": parsed.booking,
        });
        let event_text = format!("Звонок завершён. {text}\n\n{payload}");

        if let Err(e) = self
            .host
            .enqueue_system_event(&event_text, &session_key, &context_key)
            .await
        {
            tracing::error!(call_id = %call_id, "System event enqueue failed: {e}");
        }
    }
}

/// Resolve a delivery chat id: first the session key
/// (`telegram:(dm|group|direct):<numeric>` anywhere in the key), then the
/// explicit `message_to` (`telegram:<id>` or `telegram:<type>:<id>`).
pub fn resolve_chat_id(session_key: Option<&str>, message_to: Option<&str>) -> Option<String> {
    if let Some(key) = session_key {
        if let Some(id) = extract_telegram_id(key, false) {
            return Some(id);
        }
    }
    if let Some(to) = message_to {
        if let Some(id) = extract_telegram_id(to, true) {
            return Some(id);
        }
    }
    None
}

/// Pull the numeric chat id out of a `telegram:...` reference. With
/// `allow_bare`, `telegram:<id>` (no channel type) is also accepted.
fn extract_telegram_id(s: &str, allow_bare: bool) -> Option<String> {
    let idx = s.find("telegram:")?;
    let rest = &s[idx + "telegram:".len()..];

    let mut segments = rest.splitn(2, ':');
    let first = segments.next()?;

    if matches!(first, "dm" | "group" | "direct") {
        return numeric_id(segments.next()?);
    }
    if allow_bare {
        return numeric_id(first);
    }
    None
}

/// Leading `-?\d+` prefix of a segment, rejecting anything without digits.
fn numeric_id(segment: &str) -> Option<String> {
    let mut chars = segment.char_indices();
    let mut end = 0;
    let mut digits = 0;

    if let Some((_, c)) = chars.next() {
        if c == '-' {
            end = 1;
        } else if c.is_ascii_digit() {
            end = 1;
            digits = 1;
        } else {
            return None;
        }
    }
    for (i, c) in chars {
        if c.is_ascii_digit() {
            end = i + 1;
            digits += 1;
        } else {
            break;
        }
    }

    if digits == 0 {
        return None;
    }
    Some(segment[..end].to_string())
}

/// Normalize the user's dial-out task for use in prompts: strip the leading
/// "позвонить (по номеру)? <phone> и " phrase, collapse whitespace, cap at
/// 300 characters, uppercase the first letter. Idempotent.
pub fn sanitize_task(task: &str) -> String {
    let stripped = strip_call_preamble(task.trim());
    let collapsed = collapse_whitespace(&stripped);
    let capped: String = collapsed.chars().take(300).collect();
    uppercase_first(&capped)
}

fn strip_call_preamble(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;

    if !word_matches(&chars, i, "позвонить") {
        return s.to_string();
    }
    i += "позвонить".chars().count();
    i = skip_whitespace(&chars, i);

    if word_matches(&chars, i, "по") {
        let after_po = skip_whitespace(&chars, i + 2);
        if word_matches(&chars, after_po, "номеру") {
            i = skip_whitespace(&chars, after_po + "номеру".chars().count());
        }
    }

    // Phone-like run: digits with separators. At least one digit required,
    // otherwise this is not the dial preamble.
    let mut digits = 0;
    let mut j = i;
    while j < chars.len() && matches!(chars[j], '0'..='9' | '+' | '-' | '(' | ')' | ' ' | '.') {
        if chars[j].is_ascii_digit() {
            digits += 1;
        }
        j += 1;
    }
    if digits == 0 {
        return s.to_string();
    }

    // The connective "и" must follow the number for the preamble to strip.
    if j < chars.len() && (chars[j] == 'и' || chars[j] == 'И') {
        let after = j + 1;
        if after >= chars.len() || chars[after].is_whitespace() {
            let start = skip_whitespace(&chars, after);
            return chars[start..].iter().collect();
        }
    }

    s.to_string()
}

fn word_matches(chars: &[char], at: usize, word: &str) -> bool {
    let word_chars: Vec<char> = word.chars().collect();
    if at + word_chars.len() > chars.len() {
        return false;
    }
    for (k, wc) in word_chars.iter().enumerate() {
        if !chars[at + k].to_lowercase().eq(wc.to_lowercase()) {
            return false;
        }
    }
    // Word boundary: end of input or non-alphabetic follows.
    match chars.get(at + word_chars.len()) {
        None => true,
        Some(c) => !c.is_alphabetic(),
    }
}

fn skip_whitespace(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i].is_whitespace() {
        i += 1;
    }
    i
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn uppercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
