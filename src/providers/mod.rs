pub mod mock;
pub mod plivo;
pub mod telnyx;
pub mod twilio;
pub mod voximplant;

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::stream::token::{mint_stream_token, token_matches};

pub use mock::MockAdapter;
pub use plivo::PlivoAdapter;
pub use telnyx::TelnyxAdapter;
pub use twilio::TwilioAdapter;
pub use voximplant::VoximplantAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Canonical reason a call reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Busy,
    NoAnswer,
    Voicemail,
    Timeout,
    HangupUser,
    HangupBot,
    Failed,
    Completed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Busy => "busy",
            EndReason::NoAnswer => "no-answer",
            EndReason::Voicemail => "voicemail",
            EndReason::Timeout => "timeout",
            EndReason::HangupUser => "hangup-user",
            EndReason::HangupBot => "hangup-bot",
            EndReason::Failed => "failed",
            EndReason::Completed => "completed",
        }
    }
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a provider's free-form end reason onto the canonical set by
/// lowercased substring match.
pub fn parse_end_reason(raw: &str) -> EndReason {
    let lower = raw.to_lowercase();
    if lower.contains("busy") {
        EndReason::Busy
    } else if lower.contains("no answer") || lower.contains("no-answer") {
        EndReason::NoAnswer
    } else if lower.contains("voicemail") {
        EndReason::Voicemail
    } else if lower.contains("timeout") {
        EndReason::Timeout
    } else if lower.contains("hangup-user") || lower.contains("user") {
        EndReason::HangupUser
    } else if lower.contains("hangup-bot") || lower.contains("bot") {
        EndReason::HangupBot
    } else if lower.contains("error") || lower.contains("fail") {
        EndReason::Failed
    } else {
        EndReason::Completed
    }
}

/// The provider-agnostic event the call manager consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub id: String,
    #[serde(default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub provider_call_id: Option<String>,
    /// Millisecond timestamp.
    pub timestamp: i64,
    #[serde(default)]
    pub direction: Option<CallDirection>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum EventKind {
    #[serde(rename = "call.initiated")]
    Initiated,
    #[serde(rename = "call.ringing")]
    Ringing,
    #[serde(rename = "call.answered")]
    Answered,
    #[serde(rename = "call.active")]
    Active,
    #[serde(rename = "call.speaking")]
    Speaking,
    #[serde(rename = "call.speech")]
    Speech {
        transcript: String,
        is_final: bool,
        #[serde(default)]
        confidence: Option<f64>,
    },
    #[serde(rename = "call.dtmf")]
    Dtmf { digits: String },
    #[serde(rename = "call.ended")]
    Ended { reason: EndReason },
    #[serde(rename = "call.error")]
    Error {
        error: String,
        #[serde(default)]
        retryable: Option<bool>,
    },
}

/// Raw webhook request as seen at the HTTP edge. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct WebhookContext {
    pub method: String,
    /// Full public URL including query string, as the provider signed it.
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: bytes::Bytes,
}

impl WebhookContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Parse an application/x-www-form-urlencoded body.
    pub fn form_params(&self) -> HashMap<String, String> {
        form_urlencoded(&self.body_str())
    }

    pub fn json_body(&self) -> Result<serde_json::Value, BridgeError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| BridgeError::BadPayload(format!("invalid JSON body: {e}")))
    }
}

/// Minimal percent-decoding for form bodies; `+` means space.
fn form_urlencoded(body: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for pair in body.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = match pair.split_once('=') {
            Some((k, v)) => (k, v),
            None => (pair, ""),
        };
        params.insert(percent_decode(key), percent_decode(value));
    }
    params
}

fn percent_decode(s: &str) -> String {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit() =>
            {
                let hi = (bytes[i + 1] as char).to_digit(16).unwrap_or(0) as u8;
                let lo = (bytes[i + 2] as char).to_digit(16).unwrap_or(0) as u8;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// What the webhook handler should answer with, when the flow demands
/// inline instructions.
#[derive(Debug, Clone)]
pub enum WebhookReply {
    Empty,
    Xml(String),
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct WebhookParse {
    pub events: Vec<NormalizedEvent>,
    pub reply: WebhookReply,
}

/// Input to an outbound dial.
#[derive(Debug, Clone)]
pub struct InitiateInput {
    pub call_id: String,
    pub to: String,
    pub from: String,
    /// Media-stream URL (with per-call token) when streaming is enabled.
    pub stream_url: Option<String>,
    /// Message for provider-native speak on answer (notify mode fallback).
    pub initial_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InitiateOutput {
    pub provider_call_id: String,
    pub status: String,
}

/// Identity of an established call, for in-call control commands.
#[derive(Debug, Clone)]
pub struct CallRef {
    pub call_id: String,
    pub provider_call_id: Option<String>,
}

/// Per-call stream bookkeeping shared by adapters: public origin, stream
/// path, and the callKey -> token secret map.
pub struct StreamRegistry {
    public_origin: RwLock<Option<String>>,
    stream_path: String,
    tokens: Mutex<HashMap<String, String>>,
}

impl StreamRegistry {
    pub fn new(stream_path: &str) -> Self {
        Self {
            public_origin: RwLock::new(None),
            stream_path: stream_path.to_string(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_public_url(&self, origin: &str) {
        *self.public_origin.write().expect("origin lock") =
            Some(origin.trim_end_matches('/').to_string());
    }

    /// Mint a fresh stream URL for a call and remember its token.
    pub fn register_call_stream(&self, call_key: &str) -> Option<String> {
        let origin = self.public_origin.read().expect("origin lock").clone()?;
        let token = mint_stream_token();
        self.tokens
            .lock()
            .expect("token lock")
            .insert(call_key.to_string(), token.clone());

        let ws_origin = origin
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        Some(format!("{}{}?token={}", ws_origin, self.stream_path, token))
    }

    /// Constant-time validation of a supplied token for a specific call.
    pub fn is_valid_stream_token(&self, call_key: &str, supplied: &str) -> bool {
        let tokens = self.tokens.lock().expect("token lock");
        match tokens.get(call_key) {
            Some(expected) => token_matches(supplied, expected),
            None => {
                // Keep timing uniform for unknown calls too.
                token_matches(supplied, "")
            }
        }
    }

    /// Reverse lookup: which call does this token belong to. Constant-time
    /// per entry.
    pub fn resolve_call_id_by_token(&self, supplied: &str) -> Option<String> {
        let tokens = self.tokens.lock().expect("token lock");
        let mut found = None;
        for (call_key, expected) in tokens.iter() {
            if token_matches(supplied, expected) && found.is_none() {
                found = Some(call_key.clone());
            }
        }
        found
    }

    pub fn forget_call(&self, call_key: &str) {
        self.tokens.lock().expect("token lock").remove(call_key);
    }

    /// Public HTTP origin, if resolved.
    pub fn origin(&self) -> Option<String> {
        self.public_origin.read().expect("origin lock").clone()
    }

    /// WS base for the media stream endpoint, without any token.
    pub fn ws_base(&self) -> Option<String> {
        let origin = self.origin()?;
        let ws_origin = origin
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        Some(format!("{}{}", ws_origin, self.stream_path))
    }
}

/// Query-string parameters of a URL.
pub fn query_params(url: &str) -> HashMap<String, String> {
    match url.split_once('?') {
        Some((_, query)) => form_urlencoded(query),
        None => HashMap::new(),
    }
}

/// One configured provider adapter.
pub enum Provider {
    Twilio(TwilioAdapter),
    Telnyx(TelnyxAdapter),
    Plivo(PlivoAdapter),
    Voximplant(VoximplantAdapter),
    Mock(MockAdapter),
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Twilio(_) => "twilio",
            Provider::Telnyx(_) => "telnyx",
            Provider::Plivo(_) => "plivo",
            Provider::Voximplant(_) => "voximplant",
            Provider::Mock(_) => "mock",
        }
    }

    pub fn verify_webhook(&self, ctx: &WebhookContext) -> Result<(), BridgeError> {
        match self {
            Provider::Twilio(a) => a.verify_webhook(ctx),
            Provider::Telnyx(a) => a.verify_webhook(ctx),
            Provider::Plivo(a) => a.verify_webhook(ctx),
            Provider::Voximplant(a) => a.verify_webhook(ctx),
            Provider::Mock(a) => a.verify_webhook(ctx),
        }
    }

    pub fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<WebhookParse, BridgeError> {
        match self {
            Provider::Twilio(a) => a.parse_webhook_event(ctx),
            Provider::Telnyx(a) => a.parse_webhook_event(ctx),
            Provider::Plivo(a) => a.parse_webhook_event(ctx),
            Provider::Voximplant(a) => a.parse_webhook_event(ctx),
            Provider::Mock(a) => a.parse_webhook_event(ctx),
        }
    }

    pub async fn initiate_call(&self, input: &InitiateInput) -> Result<InitiateOutput, BridgeError> {
        match self {
            Provider::Twilio(a) => a.initiate_call(input).await,
            Provider::Telnyx(a) => a.initiate_call(input).await,
            Provider::Plivo(a) => a.initiate_call(input).await,
            Provider::Voximplant(a) => a.initiate_call(input).await,
            Provider::Mock(a) => a.initiate_call(input).await,
        }
    }

    pub async fn hangup_call(&self, call: &CallRef) -> Result<(), BridgeError> {
        match self {
            Provider::Twilio(a) => a.hangup_call(call).await,
            Provider::Telnyx(a) => a.hangup_call(call).await,
            Provider::Plivo(a) => a.hangup_call(call).await,
            Provider::Voximplant(a) => a.hangup_call(call).await,
            Provider::Mock(a) => a.hangup_call(call).await,
        }
    }

    /// Provider-native speak, the degraded path when the TTS adapter or
    /// streaming is unavailable.
    pub async fn play_tts(&self, call: &CallRef, text: &str) -> Result<(), BridgeError> {
        match self {
            Provider::Twilio(a) => a.play_tts(call, text).await,
            Provider::Telnyx(a) => a.play_tts(call, text).await,
            Provider::Plivo(a) => a.play_tts(call, text).await,
            Provider::Voximplant(a) => a.play_tts(call, text).await,
            Provider::Mock(a) => a.play_tts(call, text).await,
        }
    }

    pub async fn start_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        match self {
            Provider::Telnyx(a) => a.start_listening(call).await,
            Provider::Voximplant(a) => a.start_listening(call).await,
            Provider::Mock(a) => a.start_listening(call).await,
            // Twilio and Plivo streams are always-on once connected.
            _ => Ok(()),
        }
    }

    pub async fn stop_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        match self {
            Provider::Telnyx(a) => a.stop_listening(call).await,
            Provider::Voximplant(a) => a.stop_listening(call).await,
            Provider::Mock(a) => a.stop_listening(call).await,
            _ => Ok(()),
        }
    }

    pub fn set_public_url(&self, origin: &str) {
        match self {
            Provider::Twilio(a) => a.streams().set_public_url(origin),
            Provider::Telnyx(a) => a.streams().set_public_url(origin),
            Provider::Plivo(a) => a.streams().set_public_url(origin),
            Provider::Voximplant(a) => a.streams().set_public_url(origin),
            Provider::Mock(a) => a.streams().set_public_url(origin),
        }
    }

    fn streams(&self) -> &StreamRegistry {
        match self {
            Provider::Twilio(a) => a.streams(),
            Provider::Telnyx(a) => a.streams(),
            Provider::Plivo(a) => a.streams(),
            Provider::Voximplant(a) => a.streams(),
            Provider::Mock(a) => a.streams(),
        }
    }

    pub fn register_call_stream(&self, call_key: &str) -> Option<String> {
        self.streams().register_call_stream(call_key)
    }

    pub fn is_valid_stream_token(&self, call_key: &str, token: &str) -> bool {
        self.streams().is_valid_stream_token(call_key, token)
    }

    pub fn resolve_call_id_by_token(&self, token: &str) -> Option<String> {
        self.streams().resolve_call_id_by_token(token)
    }

    pub fn forget_call(&self, call_key: &str) {
        self.streams().forget_call(call_key)
    }
}

/// Webhook payload fields are untrusted. These helpers reject anything that
/// is not a non-empty trimmed string or a positive finite number before the
/// value enters a call record.
pub fn clean_string(value: Option<&serde_json::Value>) -> Option<String> {
    let s = value?.as_str()?.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

pub fn clean_number(value: Option<&serde_json::Value>) -> Option<f64> {
    let n = value?.as_f64()?;
    if n.is_finite() && n > 0.0 {
        Some(n)
    } else {
        None
    }
}

pub fn clean_bool(value: Option<&serde_json::Value>) -> Option<bool> {
    value?.as_bool()
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Event ids only need uniqueness within a process lifetime.
pub fn next_event_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("evt-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_reason_substring_mapping() {
        assert_eq!(parse_end_reason("Busy"), EndReason::Busy);
        assert_eq!(parse_end_reason("no answer"), EndReason::NoAnswer);
        assert_eq!(parse_end_reason("NO-ANSWER"), EndReason::NoAnswer);
        assert_eq!(parse_end_reason("went to voicemail"), EndReason::Voicemail);
        assert_eq!(parse_end_reason("ring timeout"), EndReason::Timeout);
        assert_eq!(parse_end_reason("hangup-user"), EndReason::HangupUser);
        assert_eq!(parse_end_reason("user hung up"), EndReason::HangupUser);
        assert_eq!(parse_end_reason("hangup-bot"), EndReason::HangupBot);
        assert_eq!(parse_end_reason("carrier error 31002"), EndReason::Failed);
        assert_eq!(parse_end_reason("call failed"), EndReason::Failed);
        assert_eq!(parse_end_reason("normal clearing"), EndReason::Completed);
        assert_eq!(parse_end_reason(""), EndReason::Completed);
    }

    #[test]
    fn end_reason_roundtrips_through_canonical_string() {
        for reason in [
            EndReason::Busy,
            EndReason::NoAnswer,
            EndReason::Voicemail,
            EndReason::Timeout,
            EndReason::HangupUser,
            EndReason::HangupBot,
            EndReason::Failed,
            EndReason::Completed,
        ] {
            assert_eq!(parse_end_reason(reason.as_str()), reason);
        }
    }

    #[test]
    fn event_kind_serializes_with_type_tag() {
        let kind = EventKind::Speech {
            transcript: "hello".into(),
            is_final: true,
            confidence: Some(0.9),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "call.speech");
        assert_eq!(json["transcript"], "hello");

        let ended = EventKind::Ended {
            reason: EndReason::NoAnswer,
        };
        let json = serde_json::to_value(&ended).unwrap();
        assert_eq!(json["type"], "call.ended");
        assert_eq!(json["reason"], "no-answer");
    }

    #[test]
    fn form_params_decode() {
        let ctx = WebhookContext {
            method: "POST".into(),
            url: "https://example.com/voice/webhook".into(),
            headers: HashMap::new(),
            body: bytes::Bytes::from_static(b"CallSid=CA123&From=%2B15550001111&Status=in+progress"),
        };
        let params = ctx.form_params();
        assert_eq!(params["CallSid"], "CA123");
        assert_eq!(params["From"], "+15550001111");
        assert_eq!(params["Status"], "in progress");
    }

    #[test]
    fn clean_string_rejects_non_strings_and_blanks() {
        let obj = serde_json::json!({"a": "  ok  ", "b": "   ", "c": 5, "d": null});
        assert_eq!(clean_string(obj.get("a")).as_deref(), Some("ok"));
        assert_eq!(clean_string(obj.get("b")), None);
        assert_eq!(clean_string(obj.get("c")), None);
        assert_eq!(clean_string(obj.get("d")), None);
        assert_eq!(clean_string(None), None);
    }

    #[test]
    fn clean_number_rejects_nonpositive_and_nonfinite() {
        let obj = serde_json::json!({"a": 12.5, "b": -3, "c": 0, "d": "7"});
        assert_eq!(clean_number(obj.get("a")), Some(12.5));
        assert_eq!(clean_number(obj.get("b")), None);
        assert_eq!(clean_number(obj.get("c")), None);
        assert_eq!(clean_number(obj.get("d")), None);
    }

    #[test]
    fn stream_registry_mints_and_validates() {
        let reg = StreamRegistry::new("/voice/stream");
        // No public origin yet: cannot mint.
        assert!(reg.register_call_stream("call-1").is_none());

        reg.set_public_url("https://voice.example.com/");
        let url = reg.register_call_stream("call-1").expect("minted");
        assert!(url.starts_with("wss://voice.example.com/voice/stream?token="));

        let token = url.split("token=").nth(1).unwrap();
        assert!(reg.is_valid_stream_token("call-1", token));
        assert!(!reg.is_valid_stream_token("call-1", "wrong"));
        assert!(!reg.is_valid_stream_token("call-2", token));
        assert_eq!(reg.resolve_call_id_by_token(token).as_deref(), Some("call-1"));

        reg.forget_call("call-1");
        assert!(!reg.is_valid_stream_token("call-1", token));
    }
}
