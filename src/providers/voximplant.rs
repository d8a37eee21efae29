use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::Serialize;

use crate::config::VoximplantConfig;
use crate::error::BridgeError;
use crate::providers::{
    clean_bool, clean_string, next_event_id, now_ms, parse_end_reason, CallDirection, CallRef,
    EventKind, InitiateInput, InitiateOutput, NormalizedEvent, StreamRegistry, WebhookContext,
    WebhookParse, WebhookReply,
};
use crate::stream::token::token_matches;

const PLATFORM_API: &str = "https://api.voximplant.com/platform_api";
const WEBHOOK_SECRET_HEADER: &str = "x-openclaw-voximplant-secret";
const JWT_LIFETIME_SEC: i64 = 3600;

/// Voximplant adapter. Outbound calls start a platform scenario; in-call
/// control goes through one-shot media-session control URLs extracted from
/// webhook payloads; management-API auth is a static JWT or a service-account
/// generated RS256 JWT with rotation.
pub struct VoximplantAdapter {
    client: reqwest::Client,
    config: VoximplantConfig,
    skip_signature_verification: bool,
    streams: StreamRegistry,
    control_timeout: Duration,
    control_urls: Mutex<ControlUrls>,
    jwt_cache: Mutex<Option<CachedJwt>>,
}

#[derive(Default)]
struct ControlUrls {
    by_provider_id: HashMap<String, String>,
    by_call_id: HashMap<String, String>,
}

#[derive(Clone)]
struct CachedJwt {
    token: String,
    iat: i64,
    exp: i64,
}

#[derive(Serialize)]
struct ManagementClaims {
    iss: String,
    iat: i64,
    exp: i64,
}

impl VoximplantAdapter {
    pub fn new(
        config: VoximplantConfig,
        skip_signature_verification: bool,
        stream_path: &str,
        control_timeout_ms: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            skip_signature_verification,
            streams: StreamRegistry::new(stream_path),
            control_timeout: Duration::from_millis(control_timeout_ms),
            control_urls: Mutex::new(ControlUrls::default()),
            jwt_cache: Mutex::new(None),
        }
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn verify_webhook(&self, ctx: &WebhookContext) -> Result<(), BridgeError> {
        if self.skip_signature_verification {
            return Ok(());
        }

        let supplied = ctx.header(WEBHOOK_SECRET_HEADER).ok_or_else(|| {
            BridgeError::UnauthorizedWebhook(format!("missing {WEBHOOK_SECRET_HEADER}"))
        })?;

        if self.config.webhook_secret.is_empty() {
            return Err(BridgeError::UnauthorizedWebhook(
                "webhook secret not configured".into(),
            ));
        }

        if token_matches(supplied, &self.config.webhook_secret) {
            Ok(())
        } else {
            Err(BridgeError::UnauthorizedWebhook("secret mismatch".into()))
        }
    }

    pub fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<WebhookParse, BridgeError> {
        let body = ctx.json_body()?;

        let event = clean_string(body.get("event"))
            .ok_or_else(|| BridgeError::BadPayload("missing event".into()))?;

        let provider_call_id = body
            .get("call_session_history_id")
            .and_then(|v| {
                v.as_i64()
                    .map(|n| n.to_string())
                    .or_else(|| v.as_str().map(|s| s.trim().to_string()))
            })
            .filter(|s| !s.is_empty());
        let call_id = clean_string(body.get("call_id"))
            .or_else(|| clean_string(body.pointer("/custom_data/callId")));

        // One-shot control URLs show up on any event; remember the freshest.
        if let Some(control_url) = clean_string(body.get("control_url"))
            .or_else(|| clean_string(body.get("media_session_access_secure_url")))
        {
            let mut urls = self.control_urls.lock().expect("control url lock");
            if let Some(ref pid) = provider_call_id {
                urls.by_provider_id.insert(pid.clone(), control_url.clone());
            }
            if let Some(ref cid) = call_id {
                urls.by_call_id.insert(cid.clone(), control_url);
            }
        }

        let direction = clean_string(body.get("direction")).map(|d| {
            if d == "outbound" {
                CallDirection::Outbound
            } else {
                CallDirection::Inbound
            }
        });

        let base = |kind: EventKind| NormalizedEvent {
            id: next_event_id(),
            call_id: call_id.clone(),
            provider_call_id: provider_call_id.clone(),
            timestamp: now_ms(),
            direction,
            from: clean_string(body.get("from")),
            to: clean_string(body.get("to")),
            kind,
        };

        let mut events = Vec::new();
        match event.as_str() {
            "started" => events.push(base(EventKind::Initiated)),
            "ringing" => events.push(base(EventKind::Ringing)),
            "connected" => events.push(base(EventKind::Answered)),
            "active" => events.push(base(EventKind::Active)),
            "speech" => {
                if let Some(transcript) = clean_string(body.get("transcript")) {
                    events.push(base(EventKind::Speech {
                        transcript,
                        is_final: body["is_final"].as_bool().unwrap_or(false),
                        confidence: body["confidence"].as_f64(),
                    }));
                }
            }
            "dtmf" => {
                if let Some(digits) = clean_string(body.get("digits")) {
                    events.push(base(EventKind::Dtmf { digits }));
                }
            }
            "disconnected" | "ended" => {
                let reason = clean_string(body.get("reason")).unwrap_or_default();
                events.push(base(EventKind::Ended {
                    reason: parse_end_reason(&reason),
                }));
            }
            "failed" | "error" => {
                events.push(base(EventKind::Error {
                    error: clean_string(body.get("reason"))
                        .unwrap_or_else(|| "scenario failure".to_string()),
                    retryable: clean_bool(body.get("retryable")),
                }));
            }
            other => {
                tracing::debug!(event = %other, "Unmapped Voximplant event");
            }
        }

        Ok(WebhookParse {
            events,
            reply: WebhookReply::Json(serde_json::json!({ "result": 1 })),
        })
    }

    pub async fn initiate_call(&self, input: &InitiateInput) -> Result<InitiateOutput, BridgeError> {
        let custom_data = serde_json::json!({
            "callId": input.call_id,
            "to": input.to,
            "from": self.config.phone_number,
            "streamUrl": input.stream_url,
            "initialMessage": input.initial_message,
        });

        let params = [
            ("account_id", self.config.account_id.clone()),
            ("rule_id", self.config.rule_id.clone()),
            ("script_custom_data", custom_data.to_string()),
        ];

        let body = self.platform_api("StartScenarios", &params).await?;

        if body["result"].as_i64() != Some(1) {
            return Err(BridgeError::ProviderError {
                status: 200,
                body: body.to_string(),
            });
        }

        let provider_call_id = body
            .get("call_session_history_id")
            .and_then(|v| v.as_i64().map(|n| n.to_string()).or_else(|| v.as_str().map(String::from)))
            .unwrap_or_else(|| format!("vox-{}", input.call_id));

        if let Some(control_url) = clean_string(body.get("media_session_access_secure_url")) {
            let mut urls = self.control_urls.lock().expect("control url lock");
            urls.by_provider_id
                .insert(provider_call_id.clone(), control_url.clone());
            urls.by_call_id.insert(input.call_id.clone(), control_url);
        }

        Ok(InitiateOutput {
            provider_call_id,
            status: "initiated".to_string(),
        })
    }

    /// The first available control URL, preferring the internal call id.
    fn control_url_for(&self, call: &CallRef) -> Result<String, BridgeError> {
        let urls = self.control_urls.lock().expect("control url lock");
        urls.by_call_id
            .get(&call.call_id)
            .or_else(|| {
                call.provider_call_id
                    .as_ref()
                    .and_then(|pid| urls.by_provider_id.get(pid))
            })
            .cloned()
            .ok_or_else(|| BridgeError::NoControlUrl(call.call_id.clone()))
    }

    async fn control_command(
        &self,
        call: &CallRef,
        command: serde_json::Value,
    ) -> Result<(), BridgeError> {
        let url = self.control_url_for(call)?;

        let resp = self
            .client
            .post(&url)
            .json(&command)
            .timeout(self.control_timeout)
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

    pub async fn hangup_call(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.control_command(call, serde_json::json!({ "command": "hangup" }))
            .await
    }

    pub async fn play_tts(&self, call: &CallRef, text: &str) -> Result<(), BridgeError> {
        self.control_command(
            call,
            serde_json::json!({ "command": "say", "text": text }),
        )
        .await
    }

    pub async fn start_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.control_command(call, serde_json::json!({ "command": "start_asr" }))
            .await
    }

    pub async fn stop_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.control_command(call, serde_json::json!({ "command": "stop_asr" }))
            .await
    }

    /// One management-API call with the 401-regenerate-retry-once contract.
    async fn platform_api(
        &self,
        method: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value, BridgeError> {
        let url = format!("{PLATFORM_API}/{method}/");

        let jwt = self.management_jwt(false)?;
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&jwt)
            .form(params)
            .timeout(self.control_timeout)
            .send()
            .await?;

        let resp = if resp.status().as_u16() == 401 {
            tracing::warn!("Voximplant management API returned 401, rotating JWT");
            let jwt = self.management_jwt(true)?;
            self.client
                .post(&url)
                .bearer_auth(&jwt)
                .form(params)
                .timeout(self.control_timeout)
                .send()
                .await?
        } else {
            resp
        };

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::ProviderError { status, body });
        }

        Ok(resp.json().await?)
    }

    /// Current management JWT: the configured static token, or a cached
    /// service-account RS256 token regenerated near expiry (or on demand
    /// after a 401).
    pub fn management_jwt(&self, force_refresh: bool) -> Result<String, BridgeError> {
        if self.config.has_static_jwt() {
            return Ok(self
                .config
                .management_jwt
                .clone()
                .expect("has_static_jwt checked"));
        }

        let now = chrono::Utc::now().timestamp();
        let mut cache = self.jwt_cache.lock().expect("jwt cache lock");

        if !force_refresh {
            if let Some(ref cached) = *cache {
                if !needs_refresh(cached.exp, now, self.config.refresh_skew_sec as i64) {
                    return Ok(cached.token.clone());
                }
            }
        }

        // RS256 over identical claims signs identical bytes, so a rotation
        // within the same second must not reuse the previous iat.
        let iat = fresh_iat(now, cache.as_ref().map(|c| c.iat));
        let generated = self.generate_service_jwt(iat)?;
        *cache = Some(generated.clone());
        Ok(generated.token)
    }

    fn generate_service_jwt(&self, iat: i64) -> Result<CachedJwt, BridgeError> {
        let key_id = self
            .config
            .key_id
            .as_deref()
            .ok_or_else(|| BridgeError::CredentialMissing("voximplant.key_id".into()))?;
        let private_key = self
            .config
            .private_key
            .as_deref()
            .ok_or_else(|| BridgeError::CredentialMissing("voximplant.private_key".into()))?;

        let claims = ManagementClaims {
            iss: self.config.account_id.clone(),
            iat,
            exp: iat + JWT_LIFETIME_SEC,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key_id.to_string());

        let key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .map_err(|e| BridgeError::ConfigInvalid(format!("invalid service-account key: {e}")))?;

        let token = jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| BridgeError::Internal(format!("JWT encoding failed: {e}")))?;

        tracing::debug!(exp = claims.exp, "Generated Voximplant management JWT");
        Ok(CachedJwt {
            token,
            iat: claims.iat,
            exp: claims.exp,
        })
    }
}

/// A cached JWT is stale once within `skew` seconds of its expiry.
fn needs_refresh(exp: i64, now: i64, skew: i64) -> bool {
    now >= exp - skew
}

/// iat for a replacement token: strictly after the previous token's iat,
/// even when the clock has not advanced (or stepped backwards).
fn fresh_iat(now: i64, previous_iat: Option<i64>) -> i64 {
    match previous_iat {
        Some(prev) if now <= prev => prev + 1,
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter_with(config: VoximplantConfig) -> VoximplantAdapter {
        VoximplantAdapter::new(config, false, "/voice/stream", 10_000)
    }

    fn secret_config() -> VoximplantConfig {
        VoximplantConfig {
            account_id: "100500".into(),
            rule_id: "42".into(),
            webhook_secret: "shared-secret".into(),
            ..Default::default()
        }
    }

    fn ctx(body: serde_json::Value, secret: Option<&str>) -> WebhookContext {
        let mut headers = HashMap::new();
        if let Some(s) = secret {
            headers.insert(WEBHOOK_SECRET_HEADER.to_string(), s.to_string());
        }
        WebhookContext {
            method: "POST".into(),
            url: "https://voice.example.com/voice/webhook".into(),
            headers,
            body: bytes::Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn shared_secret_header_verified() {
        let adapter = adapter_with(secret_config());
        let body = serde_json::json!({ "event": "ringing" });

        assert!(adapter.verify_webhook(&ctx(body.clone(), Some("shared-secret"))).is_ok());
        assert!(adapter.verify_webhook(&ctx(body.clone(), Some("wrong"))).is_err());
        assert!(adapter.verify_webhook(&ctx(body, None)).is_err());
    }

    #[test]
    fn empty_configured_secret_rejects_everything() {
        let adapter = adapter_with(VoximplantConfig::default());
        let body = serde_json::json!({ "event": "ringing" });
        assert!(adapter.verify_webhook(&ctx(body, Some(""))).is_err());
    }

    #[test]
    fn control_url_remembered_from_webhook() {
        let adapter = adapter_with(secret_config());
        let body = serde_json::json!({
            "event": "connected",
            "call_session_history_id": 987654,
            "call_id": "call-9",
            "control_url": "https://mediaserver.voximplant.com/session/abc",
        });
        adapter.parse_webhook_event(&ctx(body, None)).unwrap();

        let by_call = adapter
            .control_url_for(&CallRef {
                call_id: "call-9".into(),
                provider_call_id: None,
            })
            .unwrap();
        assert_eq!(by_call, "https://mediaserver.voximplant.com/session/abc");

        let by_provider = adapter
            .control_url_for(&CallRef {
                call_id: "call-unknown".into(),
                provider_call_id: Some("987654".into()),
            })
            .unwrap();
        assert_eq!(by_provider, "https://mediaserver.voximplant.com/session/abc");
    }

    #[test]
    fn missing_control_url_is_no_control_url() {
        let adapter = adapter_with(secret_config());
        let err = adapter
            .control_url_for(&CallRef {
                call_id: "call-nope".into(),
                provider_call_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::NoControlUrl(_)));
    }

    #[test]
    fn disconnect_event_maps_end_reason() {
        let adapter = adapter_with(secret_config());
        let body = serde_json::json!({
            "event": "disconnected",
            "call_session_history_id": 1,
            "reason": "user hangup",
        });
        let parse = adapter.parse_webhook_event(&ctx(body, None)).unwrap();
        assert_eq!(
            parse.events[0].kind,
            EventKind::Ended {
                reason: crate::providers::EndReason::HangupUser
            }
        );
        // Voximplant scenarios expect a JSON ack.
        assert!(matches!(parse.reply, WebhookReply::Json(_)));
    }

    #[test]
    fn speech_event_requires_nonempty_transcript() {
        let adapter = adapter_with(secret_config());
        let body = serde_json::json!({
            "event": "speech",
            "call_session_history_id": 1,
            "transcript": "   ",
            "is_final": true,
        });
        let parse = adapter.parse_webhook_event(&ctx(body, None)).unwrap();
        assert!(parse.events.is_empty());
    }

    #[test]
    fn static_jwt_returned_verbatim() {
        let adapter = adapter_with(VoximplantConfig {
            management_jwt: Some("eyJ.static.jwt".into()),
            ..secret_config()
        });
        assert_eq!(adapter.management_jwt(false).unwrap(), "eyJ.static.jwt");
        // Even a forced refresh keeps the static token.
        assert_eq!(adapter.management_jwt(true).unwrap(), "eyJ.static.jwt");
    }

    #[test]
    fn sentinel_jwt_requires_service_account() {
        let adapter = adapter_with(VoximplantConfig {
            management_jwt: Some("__SERVICE_ACCOUNT__".into()),
            ..secret_config()
        });
        // No key material configured: generating must fail loudly rather
        // than using the sentinel as a bearer token.
        assert!(matches!(
            adapter.management_jwt(false),
            Err(BridgeError::CredentialMissing(_))
        ));
    }

    #[test]
    fn refresh_window_math() {
        let exp = 10_000;
        assert!(!needs_refresh(exp, exp - 61, 60));
        assert!(needs_refresh(exp, exp - 60, 60));
        assert!(needs_refresh(exp, exp - 1, 60));
        assert!(needs_refresh(exp, exp + 5, 60));
    }

    #[test]
    fn forced_rotation_never_reuses_iat() {
        // Normal mint: the clock wins.
        assert_eq!(fresh_iat(1_000, None), 1_000);
        assert_eq!(fresh_iat(1_000, Some(900)), 1_000);

        // A 401 retry lands in the same second as the original mint; the
        // replacement must still sign different claims.
        assert_eq!(fresh_iat(1_000, Some(1_000)), 1_001);
        // Even a clock step backwards keeps iat strictly increasing.
        assert_eq!(fresh_iat(1_000, Some(1_200)), 1_201);
    }
}
