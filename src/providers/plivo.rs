use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::PlivoConfig;
use crate::error::BridgeError;
use crate::providers::{
    next_event_id, now_ms, parse_end_reason, query_params, CallDirection, CallRef, EventKind,
    InitiateInput, InitiateOutput, NormalizedEvent, StreamRegistry, WebhookContext, WebhookParse,
    WebhookReply,
};
use crate::stream::token::token_matches;

const API_BASE: &str = "https://api.plivo.com/v1";

/// Plivo adapter: form-encoded webhooks with V3 signatures (HMAC-SHA256 over
/// URL + nonce), XML answer documents, REST control plane.
pub struct PlivoAdapter {
    client: reqwest::Client,
    config: PlivoConfig,
    skip_signature_verification: bool,
    webhook_path: String,
    streams: StreamRegistry,
    control_timeout: Duration,
}

impl PlivoAdapter {
    pub fn new(
        config: PlivoConfig,
        skip_signature_verification: bool,
        webhook_path: &str,
        stream_path: &str,
        control_timeout_ms: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            skip_signature_verification,
            webhook_path: webhook_path.to_string(),
            streams: StreamRegistry::new(stream_path),
            control_timeout: Duration::from_millis(control_timeout_ms),
        }
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn verify_webhook(&self, ctx: &WebhookContext) -> Result<(), BridgeError> {
        if self.skip_signature_verification {
            return Ok(());
        }

        let signature = ctx.header("x-plivo-signature-v3").ok_or_else(|| {
            BridgeError::UnauthorizedWebhook("missing X-Plivo-Signature-V3".into())
        })?;
        let nonce = ctx.header("x-plivo-signature-v3-nonce").ok_or_else(|| {
            BridgeError::UnauthorizedWebhook("missing X-Plivo-Signature-V3-Nonce".into())
        })?;

        let expected = plivo_signature(&self.config.auth_token, &ctx.method, &ctx.url, nonce);
        // The header may carry several comma-separated signatures after a
        // token rotation; any match is accepted.
        let matched = signature
            .split(',')
            .any(|candidate| token_matches(candidate.trim(), &expected));
        if matched {
            Ok(())
        } else {
            Err(BridgeError::UnauthorizedWebhook(
                "signature mismatch".into(),
            ))
        }
    }

    pub fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<WebhookParse, BridgeError> {
        let params = ctx.form_params();
        let query = query_params(&ctx.url);

        let provider_call_id = params
            .get("CallUUID")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::BadPayload("missing CallUUID".into()))?
            .to_string();

        let call_id = query.get("callId").cloned();
        let direction = params.get("Direction").map(|d| {
            if d == "outbound" {
                CallDirection::Outbound
            } else {
                CallDirection::Inbound
            }
        });

        let base = |kind: EventKind| NormalizedEvent {
            id: next_event_id(),
            call_id: call_id.clone(),
            provider_call_id: Some(provider_call_id.clone()),
            timestamp: now_ms(),
            direction,
            from: params.get("From").cloned().filter(|s| !s.is_empty()),
            to: params.get("To").cloned().filter(|s| !s.is_empty()),
            kind,
        };

        let mut events = Vec::new();
        let status = params.get("CallStatus").map(String::as_str).unwrap_or("");
        match status {
            "queued" | "initiated" => events.push(base(EventKind::Initiated)),
            "ringing" => events.push(base(EventKind::Ringing)),
            "in-progress" | "answer" => events.push(base(EventKind::Answered)),
            "busy" | "no-answer" | "failed" | "timeout" | "completed" | "cancel" => {
                let reason = params
                    .get("HangupCause")
                    .map(|c| parse_end_reason(c))
                    .unwrap_or_else(|| parse_end_reason(status));
                events.push(base(EventKind::Ended { reason }));
            }
            "" => {}
            other => {
                tracing::debug!(status = %other, "Unmapped Plivo call status");
            }
        }

        let reply = if query.get("kind").map(String::as_str) == Some("answer") {
            WebhookReply::Xml(self.answer_xml(call_id.as_deref(), query.get("msg")))
        } else {
            WebhookReply::Empty
        };

        Ok(WebhookParse { events, reply })
    }

    fn answer_xml(&self, call_id: Option<&str>, initial_message: Option<&String>) -> String {
        if let Some(ws_base) = self.streams.ws_base() {
            let call_id = call_id.unwrap_or("");
            return format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Stream keepCallAlive="true" bidirectional="true" contentType="audio/x-mulaw;rate=8000" extraHeaders="callId={call_id}">{ws_base}</Stream>
</Response>"#
            );
        }

        match initial_message {
            Some(msg) => format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Speak>{}</Speak>
    <Wait length="30" />
</Response>"#,
                xml_escape(msg)
            ),
            None => r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Wait length="60" />
</Response>"#
                .to_string(),
        }
    }

    pub async fn initiate_call(&self, input: &InitiateInput) -> Result<InitiateOutput, BridgeError> {
        let origin = self
            .streams
            .origin()
            .ok_or_else(|| BridgeError::Internal("public URL not resolved".into()))?;

        let mut answer_url = format!(
            "{origin}{}?kind=answer&callId={}",
            self.webhook_path, input.call_id
        );
        if let Some(ref msg) = input.initial_message {
            answer_url.push_str(&format!("&msg={}", urlencoded(msg)));
        }
        let hangup_url = format!(
            "{origin}{}?kind=status&callId={}",
            self.webhook_path, input.call_id
        );

        let body = serde_json::json!({
            "to": input.to,
            "from": self.config.phone_number,
            "answer_url": answer_url,
            "answer_method": "POST",
            "hangup_url": hangup_url,
            "hangup_method": "POST",
            "ring_url": hangup_url,
            "ring_method": "POST",
        });

        let resp = self
            .client
            .post(format!("{API_BASE}/Account/{}/Call/", self.config.auth_id))
            .basic_auth(&self.config.auth_id, Some(&self.config.auth_token))
            .json(&body)
            .timeout(self.control_timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::ProviderError { status, body });
        }

        let body: serde_json::Value = resp.json().await?;
        let provider_call_id = body["request_uuid"]
            .as_str()
            .ok_or_else(|| BridgeError::BadPayload("Plivo response missing request_uuid".into()))?
            .to_string();

        Ok(InitiateOutput {
            provider_call_id,
            status: "initiated".to_string(),
        })
    }

    pub async fn hangup_call(&self, call: &CallRef) -> Result<(), BridgeError> {
        let uuid = call
            .provider_call_id
            .as_deref()
            .ok_or_else(|| BridgeError::NoControlUrl(call.call_id.clone()))?;

        let resp = self
            .client
            .delete(format!(
                "{API_BASE}/Account/{}/Call/{uuid}/",
                self.config.auth_id
            ))
            .basic_auth(&self.config.auth_id, Some(&self.config.auth_token))
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

    pub async fn play_tts(&self, call: &CallRef, text: &str) -> Result<(), BridgeError> {
        let uuid = call
            .provider_call_id
            .as_deref()
            .ok_or_else(|| BridgeError::NoControlUrl(call.call_id.clone()))?;

        let resp = self
            .client
            .post(format!(
                "{API_BASE}/Account/{}/Call/{uuid}/Speak/",
                self.config.auth_id
            ))
            .basic_auth(&self.config.auth_id, Some(&self.config.auth_token))
            .json(&serde_json::json!({ "text": text }))
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
}

/// HMAC-SHA256 over method, webhook URL and nonce, base64-encoded.
fn plivo_signature(auth_token: &str, method: &str, url: &str, nonce: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(auth_token.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(method.as_bytes());
    mac.update(url.as_bytes());
    mac.update(nonce.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn urlencoded(s: &str) -> String {
    s.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                String::from(b as char)
            }
            _ => format!("%{b:02X}"),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn adapter(skip: bool) -> PlivoAdapter {
        PlivoAdapter::new(
            PlivoConfig {
                auth_id: "MA123".into(),
                auth_token: "plivo-secret".into(),
                phone_number: "+15550009999".into(),
            },
            skip,
            "/voice/webhook",
            "/voice/stream",
            10_000,
        )
    }

    fn ctx(url: &str, body: &str, headers: &[(&str, &str)]) -> WebhookContext {
        WebhookContext {
            method: "POST".into(),
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            body: bytes::Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn v3_signature_verified() {
        let adapter = adapter(false);
        let url = "https://voice.example.com/voice/webhook?kind=status&callId=call-3";
        let sig = plivo_signature("plivo-secret", "POST", url, "nonce-1");

        let ok = ctx(
            url,
            "CallUUID=uuid-1&CallStatus=ringing",
            &[
                ("x-plivo-signature-v3", sig.as_str()),
                ("x-plivo-signature-v3-nonce", "nonce-1"),
            ],
        );
        assert!(adapter.verify_webhook(&ok).is_ok());

        let bad = ctx(
            url,
            "CallUUID=uuid-1&CallStatus=ringing",
            &[
                ("x-plivo-signature-v3", sig.as_str()),
                ("x-plivo-signature-v3-nonce", "nonce-2"),
            ],
        );
        assert!(adapter.verify_webhook(&bad).is_err());
    }

    #[test]
    fn status_maps_to_events() {
        let adapter = adapter(true);
        let url = "https://voice.example.com/voice/webhook?kind=status&callId=call-3";
        let parse = adapter
            .parse_webhook_event(&ctx(
                url,
                "CallUUID=uuid-1&CallStatus=ringing&From=%2B15550001111&Direction=outbound",
                &[],
            ))
            .unwrap();

        let event = &parse.events[0];
        assert_eq!(event.kind, EventKind::Ringing);
        assert_eq!(event.call_id.as_deref(), Some("call-3"));
        assert_eq!(event.direction, Some(CallDirection::Outbound));
    }

    #[test]
    fn hangup_cause_wins_over_status() {
        let adapter = adapter(true);
        let url = "https://voice.example.com/voice/webhook?kind=status&callId=call-3";
        let parse = adapter
            .parse_webhook_event(&ctx(
                url,
                "CallUUID=uuid-1&CallStatus=completed&HangupCause=USER_BUSY",
                &[],
            ))
            .unwrap();
        assert_eq!(
            parse.events[0].kind,
            EventKind::Ended {
                reason: crate::providers::EndReason::Busy
            }
        );
    }

    #[test]
    fn answer_reply_contains_stream_element() {
        let adapter = adapter(true);
        adapter.streams().set_public_url("https://voice.example.com");

        let url = "https://voice.example.com/voice/webhook?kind=answer&callId=call-3";
        let parse = adapter
            .parse_webhook_event(&ctx(url, "CallUUID=uuid-1&CallStatus=in-progress", &[]))
            .unwrap();

        let WebhookReply::Xml(xml) = parse.reply else {
            panic!("expected XML reply");
        };
        assert!(xml.contains("wss://voice.example.com/voice/stream"));
        assert!(xml.contains(r#"extraHeaders="callId=call-3""#));
        assert!(xml.contains(r#"bidirectional="true""#));
    }

    #[test]
    fn missing_call_uuid_is_bad_payload() {
        let adapter = adapter(true);
        let err = adapter
            .parse_webhook_event(&ctx(
                "https://voice.example.com/voice/webhook",
                "CallStatus=ringing",
                &[],
            ))
            .unwrap_err();
        assert!(matches!(err, BridgeError::BadPayload(_)));
    }
}
