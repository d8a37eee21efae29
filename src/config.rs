use serde::Deserialize;
use std::path::PathBuf;

use crate::error::BridgeError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub twilio: Option<TwilioConfig>,
    #[serde(default)]
    pub telnyx: Option<TelnyxConfig>,
    #[serde(default)]
    pub plivo: Option<PlivoConfig>,
    #[serde(default)]
    pub voximplant: Option<VoximplantConfig>,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub summary: SummaryConfig,
    #[serde(default)]
    pub host_runtime: HostRuntimeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Explicit public origin (e.g. "https://voice.example.com"). Highest
    /// priority when resolving the webhook/stream URL.
    #[serde(default)]
    pub public_url: Option<String>,
    /// Advertise the LAN address instead of localhost when no public URL or
    /// tunnel is configured.
    #[serde(default)]
    pub expose_lan: bool,
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,
    /// Bearer token required for /api/* endpoints. If empty, all requests
    /// are rejected.
    #[serde(default)]
    pub api_token: String,
}

fn default_webhook_path() -> String {
    "/voice/webhook".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    /// One of: twilio, telnyx, plivo, voximplant, mock.
    pub name: String,
    #[serde(default)]
    pub skip_signature_verification: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelnyxConfig {
    pub api_key: String,
    /// Webhook signing secret from the Telnyx portal.
    #[serde(default)]
    pub public_key: String,
    pub connection_id: String,
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PlivoConfig {
    pub auth_id: String,
    pub auth_token: String,
    pub phone_number: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct VoximplantConfig {
    pub account_id: String,
    #[serde(default)]
    pub api_key: String,
    pub rule_id: String,
    #[serde(default)]
    pub phone_number: String,
    /// Static management JWT. The sentinels AUTO / __AUTO__ /
    /// __SERVICE_ACCOUNT__ force service-account mode.
    #[serde(default)]
    pub management_jwt: Option<String>,
    /// Service-account credentials for RS256 JWT generation.
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    /// Shared secret expected in the x-openclaw-voximplant-secret header.
    #[serde(default)]
    pub webhook_secret: String,
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_sec: u64,
}

fn default_refresh_skew() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "realtime-transcription" or "realtime-conversation".
    #[serde(default = "default_streaming_mode")]
    pub mode: String,
    #[serde(default = "default_stream_path")]
    pub stream_path: String,
}

fn default_streaming_mode() -> String {
    "realtime-transcription".to_string()
}

fn default_stream_path() -> String {
    "/voice/stream".to_string()
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: default_streaming_mode(),
            stream_path: default_stream_path(),
        }
    }
}

impl StreamingConfig {
    pub fn is_conversation(&self) -> bool {
        self.mode == "realtime-conversation"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_realtime_url")]
    pub url: String,
    #[serde(default = "default_realtime_model")]
    pub model: String,
    #[serde(default = "default_realtime_voice")]
    pub voice: String,
}

fn default_realtime_url() -> String {
    "wss://api.openai.com/v1/realtime".to_string()
}

fn default_realtime_model() -> String {
    "gpt-4o-realtime-preview".to_string()
}

fn default_realtime_voice() -> String {
    "alloy".to_string()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            url: default_realtime_url(),
            model: default_realtime_model(),
            voice: default_realtime_voice(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TtsConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_tts_voice")]
    pub voice_id: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
}

fn default_tts_provider() -> String {
    "elevenlabs".to_string()
}

fn default_tts_voice() -> String {
    "JAgnJveGGUh4qy4kh6dF".to_string()
}

fn default_tts_model() -> String {
    "eleven_turbo_v2_5".to_string()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: default_tts_provider(),
            api_key: String::new(),
            voice_id: default_tts_voice(),
            model: default_tts_model(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SummaryConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_summary_url")]
    pub base_url: String,
    #[serde(default = "default_summary_model")]
    pub model: String,
}

fn default_summary_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_summary_model() -> String {
    "gpt-4o-mini".to_string()
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_summary_url(),
            model: default_summary_model(),
        }
    }
}

/// Where outcome delivery and system-event enqueueing go: the host runtime's
/// HTTP surface.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct HostRuntimeConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout_ms: u64,
    #[serde(default = "default_silence_timeout")]
    pub silence_timeout_ms: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration_seconds: u64,
    #[serde(default = "default_transcript_timeout")]
    pub transcript_timeout_ms: u64,
    #[serde(default = "default_control_timeout")]
    pub control_timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_ring_timeout() -> u64 {
    45_000
}

fn default_silence_timeout() -> u64 {
    60_000
}

fn default_max_duration() -> u64 {
    600
}

fn default_transcript_timeout() -> u64 {
    45_000
}

fn default_control_timeout() -> u64 {
    10_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent(),
            ring_timeout_ms: default_ring_timeout(),
            silence_timeout_ms: default_silence_timeout(),
            max_duration_seconds: default_max_duration(),
            transcript_timeout_ms: default_transcript_timeout(),
            control_timeout_ms: default_control_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_path")]
    pub path: String,
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_path() -> String {
    config_dir().join("calls.jsonl").to_string_lossy().into_owned()
}

fn default_history_limit() -> usize {
    50
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            path: default_history_path(),
            limit: default_history_limit(),
        }
    }
}

/// Path-prefixed HTTP/WS proxy to an upstream service.
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    pub base_path: String,
    pub upstream_host: String,
    pub upstream_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TunnelConfig {
    /// Public URL of an externally managed tunnel (ngrok, tailscale funnel).
    pub url: String,
}

impl Config {
    pub fn load() -> Result<Self, BridgeError> {
        let dir = config_dir();
        load_env_secrets(&dir);

        let path = config_path();
        tracing::info!(path = %path.display(), "Reading configuration");

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            BridgeError::ConfigInvalid(format!(
                "no readable config at {} ({e}); config.example.toml in the \
                 repository is a starting point",
                path.display()
            ))
        })?;

        let mut config: Config =
            toml::from_str(&contents).map_err(|e| BridgeError::ConfigInvalid(e.to_string()))?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Environment variables fill credentials the config left blank.
    /// Config values always take precedence.
    fn apply_env_overrides(&mut self) {
        fn fill(slot: &mut String, var: &str) {
            if slot.is_empty() {
                if let Ok(v) = std::env::var(var) {
                    *slot = v;
                }
            }
        }

        if let Some(ref mut t) = self.twilio {
            fill(&mut t.account_sid, "TWILIO_ACCOUNT_SID");
            fill(&mut t.auth_token, "TWILIO_AUTH_TOKEN");
        }
        if let Some(ref mut t) = self.telnyx {
            fill(&mut t.api_key, "TELNYX_API_KEY");
            fill(&mut t.public_key, "TELNYX_PUBLIC_KEY");
        }
        if let Some(ref mut p) = self.plivo {
            fill(&mut p.auth_id, "PLIVO_AUTH_ID");
            fill(&mut p.auth_token, "PLIVO_AUTH_TOKEN");
        }
        if let Some(ref mut v) = self.voximplant {
            fill(&mut v.account_id, "VOXIMPLANT_ACCOUNT_ID");
            fill(&mut v.api_key, "VOXIMPLANT_API_KEY");
            fill(&mut v.webhook_secret, "VOXIMPLANT_WEBHOOK_SECRET");
            if v.management_jwt.is_none() {
                if let Ok(jwt) = std::env::var("VOXIMPLANT_MANAGEMENT_JWT") {
                    v.management_jwt = Some(jwt);
                }
            }
        }
        fill(&mut self.realtime.api_key, "VOICE_REALTIME_API_KEY");
        fill(&mut self.tts.api_key, "VOICE_TTS_API_KEY");
        fill(&mut self.summary.api_key, "VOICE_LLM_API_KEY");
        fill(&mut self.server.api_token, "VOICE_BRIDGE_API_TOKEN");
        if self.server.public_url.is_none() {
            if let Ok(v) = std::env::var("SERVER_EXTERNAL_URL") {
                self.server.public_url = Some(v);
            }
        }
    }

    /// Refuse to start on missing provider credentials.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.provider.skip_signature_verification {
            tracing::warn!(
                "WEBHOOK SIGNATURE VERIFICATION IS DISABLED — anyone who can reach \
                 this server can forge call events"
            );
        }

        match self.provider.name.as_str() {
            "twilio" => {
                let t = self
                    .twilio
                    .as_ref()
                    .ok_or_else(|| missing("twilio section"))?;
                if t.account_sid.is_empty() {
                    return Err(missing("twilio.account_sid"));
                }
                if t.auth_token.is_empty() {
                    return Err(missing("twilio.auth_token"));
                }
                if t.phone_number.is_empty() {
                    return Err(missing("twilio.phone_number"));
                }
            }
            "telnyx" => {
                let t = self
                    .telnyx
                    .as_ref()
                    .ok_or_else(|| missing("telnyx section"))?;
                if t.api_key.is_empty() {
                    return Err(missing("telnyx.api_key"));
                }
                if t.public_key.is_empty() && !self.provider.skip_signature_verification {
                    return Err(missing("telnyx.public_key"));
                }
            }
            "plivo" => {
                let p = self.plivo.as_ref().ok_or_else(|| missing("plivo section"))?;
                if p.auth_id.is_empty() {
                    return Err(missing("plivo.auth_id"));
                }
                if p.auth_token.is_empty() {
                    return Err(missing("plivo.auth_token"));
                }
            }
            "voximplant" => {
                let v = self
                    .voximplant
                    .as_ref()
                    .ok_or_else(|| missing("voximplant section"))?;
                if v.account_id.is_empty() {
                    return Err(missing("voximplant.account_id"));
                }
                if v.rule_id.is_empty() {
                    return Err(missing("voximplant.rule_id"));
                }
                if !v.has_static_jwt() && (v.key_id.is_none() || v.private_key.is_none()) {
                    return Err(missing(
                        "voximplant.management_jwt or voximplant.key_id + private_key",
                    ));
                }
            }
            "mock" => {}
            other => {
                return Err(BridgeError::ConfigInvalid(format!(
                    "unknown provider {other:?} (expected twilio, telnyx, plivo, voximplant or mock)"
                )));
            }
        }

        if self.streaming.enabled
            && !matches!(
                self.streaming.mode.as_str(),
                "realtime-transcription" | "realtime-conversation"
            )
        {
            return Err(BridgeError::ConfigInvalid(format!(
                "unknown streaming.mode {:?}",
                self.streaming.mode
            )));
        }

        Ok(())
    }

    pub fn local_url(&self) -> String {
        format!("http://{}:{}", self.server.host, self.server.port)
    }
}

impl VoximplantConfig {
    /// A configured management JWT counts only when it is not one of the
    /// sentinels that force service-account mode.
    pub fn has_static_jwt(&self) -> bool {
        match self.management_jwt.as_deref() {
            Some("AUTO") | Some("__AUTO__") | Some("__SERVICE_ACCOUNT__") | None => false,
            Some(jwt) => !jwt.is_empty(),
        }
    }
}

fn missing(what: &str) -> BridgeError {
    BridgeError::CredentialMissing(what.to_string())
}

/// Carrier and API secrets may sit in a .env next to the config file.
/// A missing file is the common case and stays silent; a file that exists
/// but does not parse deserves a warning, since secrets in it are then
/// silently absent.
fn load_env_secrets(dir: &std::path::Path) {
    let env_file = dir.join(".env");
    match dotenvy::from_path(&env_file) {
        Ok(()) => tracing::debug!(path = %env_file.display(), "Secrets merged from .env"),
        Err(dotenvy::Error::Io(_)) => {}
        Err(e) => {
            tracing::warn!(path = %env_file.display(), "Malformed .env ignored: {e}")
        }
    }
}

/// Directory holding config.toml, .env and the default call log.
/// VOICE_BRIDGE_CONFIG names the config *file*; its directory wins here.
pub fn config_dir() -> PathBuf {
    match explicit_config_file() {
        Some(file) => match file.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        },
        None => {
            let home = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            home.join(".voice-bridge")
        }
    }
}

fn config_path() -> PathBuf {
    explicit_config_file().unwrap_or_else(|| config_dir().join("config.toml"))
}

fn explicit_config_file() -> Option<PathBuf> {
    std::env::var_os("VOICE_BRIDGE_CONFIG").map(PathBuf::from)
}
