use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::TelnyxConfig;
use crate::error::BridgeError;
use crate::providers::{
    clean_string, next_event_id, now_ms, parse_end_reason, CallDirection, CallRef, EventKind,
    InitiateInput, InitiateOutput, NormalizedEvent, StreamRegistry, WebhookContext, WebhookParse,
    WebhookReply,
};
use crate::stream::token::token_matches;

const API_BASE: &str = "https://api.telnyx.com/v2";

/// Telnyx Call Control adapter. Webhooks are JSON signed with HMAC-SHA256
/// over `timestamp|body`; the internal call id rides in `client_state`.
pub struct TelnyxAdapter {
    client: reqwest::Client,
    config: TelnyxConfig,
    skip_signature_verification: bool,
    streams: StreamRegistry,
    control_timeout: Duration,
}

impl TelnyxAdapter {
    pub fn new(
        config: TelnyxConfig,
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
        }
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    pub fn verify_webhook(&self, ctx: &WebhookContext) -> Result<(), BridgeError> {
        if self.skip_signature_verification {
            return Ok(());
        }

        let signature = ctx
            .header("telnyx-signature")
            .ok_or_else(|| BridgeError::UnauthorizedWebhook("missing telnyx-signature".into()))?;
        let timestamp = ctx
            .header("telnyx-timestamp")
            .ok_or_else(|| BridgeError::UnauthorizedWebhook("missing telnyx-timestamp".into()))?;

        let expected = telnyx_signature(&self.config.public_key, timestamp, &ctx.body);
        if token_matches(signature, &expected) {
            Ok(())
        } else {
            Err(BridgeError::UnauthorizedWebhook(
                "signature mismatch".into(),
            ))
        }
    }

    pub fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<WebhookParse, BridgeError> {
        let body = ctx.json_body()?;
        let data = &body["data"];

        let event_type = clean_string(data.get("event_type"))
            .ok_or_else(|| BridgeError::BadPayload("missing event_type".into()))?;
        let payload = &data["payload"];

        let provider_call_id = clean_string(payload.get("call_control_id"));
        let call_id = clean_string(payload.get("client_state")).and_then(|b64| {
            base64::engine::general_purpose::STANDARD
                .decode(b64)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        });
        let direction = clean_string(payload.get("direction")).map(|d| {
            if d == "outgoing" {
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
            from: clean_string(payload.get("from")),
            to: clean_string(payload.get("to")),
            kind,
        };

        let mut events = Vec::new();
        match event_type.as_str() {
            "call.initiated" => events.push(base(EventKind::Initiated)),
            "call.ringing" => events.push(base(EventKind::Ringing)),
            "call.answered" => events.push(base(EventKind::Answered)),
            "call.bridged" | "streaming.started" => events.push(base(EventKind::Active)),
            "call.speak.started" => events.push(base(EventKind::Speaking)),
            "call.transcription" => {
                let td = &payload["transcription_data"];
                if let Some(transcript) = clean_string(td.get("transcript")) {
                    events.push(base(EventKind::Speech {
                        transcript,
                        is_final: td["is_final"].as_bool().unwrap_or(false),
                        confidence: td["confidence"].as_f64(),
                    }));
                }
            }
            "call.dtmf.received" => {
                if let Some(digits) = clean_string(payload.get("digit")) {
                    events.push(base(EventKind::Dtmf { digits }));
                }
            }
            "call.hangup" => {
                let cause = clean_string(payload.get("hangup_cause")).unwrap_or_default();
                let source = clean_string(payload.get("hangup_source")).unwrap_or_default();
                let reason = if cause == "normal_clearing" && source == "callee" {
                    crate::providers::EndReason::HangupUser
                } else if cause == "normal_clearing" && source == "caller" {
                    crate::providers::EndReason::HangupBot
                } else {
                    parse_end_reason(&cause)
                };
                events.push(base(EventKind::Ended { reason }));
            }
            "call.machine.detection.ended" => {
                if clean_string(payload.get("result")).as_deref() == Some("machine") {
                    events.push(base(EventKind::Ended {
                        reason: crate::providers::EndReason::Voicemail,
                    }));
                }
            }
            other => {
                tracing::debug!(event_type = %other, "Unmapped Telnyx event");
            }
        }

        Ok(WebhookParse {
            events,
            reply: WebhookReply::Empty,
        })
    }

    pub async fn initiate_call(&self, input: &InitiateInput) -> Result<InitiateOutput, BridgeError> {
        let client_state =
            base64::engine::general_purpose::STANDARD.encode(input.call_id.as_bytes());

        let mut body = serde_json::json!({
            "connection_id": self.config.connection_id,
            "to": input.to,
            "from": self.config.phone_number,
            "client_state": client_state,
        });
        if let Some(ref stream_url) = input.stream_url {
            body["stream_url"] = serde_json::json!(stream_url);
            body["stream_track"] = serde_json::json!("inbound_track");
            body["stream_bidirectional_mode"] = serde_json::json!("rtp");
        }

        let resp = self
            .client
            .post(format!("{API_BASE}/calls"))
            .bearer_auth(&self.config.api_key)
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
        let provider_call_id = clean_string(body["data"].get("call_control_id"))
            .ok_or_else(|| BridgeError::BadPayload("Telnyx response missing call_control_id".into()))?;

        Ok(InitiateOutput {
            provider_call_id,
            status: "initiated".to_string(),
        })
    }

    async fn call_action(
        &self,
        call: &CallRef,
        action: &str,
        body: serde_json::Value,
    ) -> Result<(), BridgeError> {
        let id = call
            .provider_call_id
            .as_deref()
            .ok_or_else(|| BridgeError::NoControlUrl(call.call_id.clone()))?;

        let resp = self
            .client
            .post(format!("{API_BASE}/calls/{id}/actions/{action}"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
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
        self.call_action(call, "hangup", serde_json::json!({})).await
    }

    pub async fn play_tts(&self, call: &CallRef, text: &str) -> Result<(), BridgeError> {
        self.call_action(
            call,
            "speak",
            serde_json::json!({
                "payload": text,
                "voice": "female",
                "language": "ru-RU",
            }),
        )
        .await
    }

    pub async fn start_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.call_action(
            call,
            "transcription_start",
            serde_json::json!({
                "transcription_engine": "B",
                "language": "ru",
            }),
        )
        .await
    }

    pub async fn stop_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.call_action(call, "transcription_stop", serde_json::json!({}))
            .await
    }
}

/// HMAC-SHA256 over `timestamp|body`, base64-encoded.
fn telnyx_signature(signing_key: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(signing_key.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(timestamp.as_bytes());
    mac.update(b"|");
    mac.update(body);
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn adapter(skip: bool) -> TelnyxAdapter {
        TelnyxAdapter::new(
            TelnyxConfig {
                api_key: "KEY123".into(),
                public_key: "signing-secret".into(),
                connection_id: "conn-1".into(),
                phone_number: "+15550009999".into(),
            },
            skip,
            "/voice/stream",
            10_000,
        )
    }

    fn ctx(body: serde_json::Value, headers: &[(&str, &str)]) -> WebhookContext {
        WebhookContext {
            method: "POST".into(),
            url: "https://voice.example.com/voice/webhook".into(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            body: bytes::Bytes::from(body.to_string()),
        }
    }

    fn hangup_body(cause: &str, source: &str) -> serde_json::Value {
        serde_json::json!({
            "data": {
                "event_type": "call.hangup",
                "payload": {
                    "call_control_id": "cc-1",
                    "client_state": base64::engine::general_purpose::STANDARD.encode("call-5"),
                    "hangup_cause": cause,
                    "hangup_source": source,
                    "from": "+15550001111",
                    "to": "+15550002222",
                    "direction": "outgoing"
                }
            }
        })
    }

    #[test]
    fn signature_over_timestamp_and_body() {
        let adapter = adapter(false);
        let body = hangup_body("normal_clearing", "callee");
        let raw = body.to_string();
        let sig = telnyx_signature("signing-secret", "1700000000", raw.as_bytes());

        let ok = ctx(
            body.clone(),
            &[("telnyx-signature", sig.as_str()), ("telnyx-timestamp", "1700000000")],
        );
        assert!(adapter.verify_webhook(&ok).is_ok());

        let bad = ctx(
            body,
            &[("telnyx-signature", sig.as_str()), ("telnyx-timestamp", "1700000001")],
        );
        assert!(adapter.verify_webhook(&bad).is_err());
    }

    #[test]
    fn client_state_recovers_call_id() {
        let adapter = adapter(true);
        let parse = adapter
            .parse_webhook_event(&ctx(hangup_body("normal_clearing", "callee"), &[]))
            .unwrap();

        let event = &parse.events[0];
        assert_eq!(event.call_id.as_deref(), Some("call-5"));
        assert_eq!(event.provider_call_id.as_deref(), Some("cc-1"));
        assert_eq!(
            event.kind,
            EventKind::Ended {
                reason: crate::providers::EndReason::HangupUser
            }
        );
    }

    #[test]
    fn caller_hangup_is_bot_side() {
        let adapter = adapter(true);
        let parse = adapter
            .parse_webhook_event(&ctx(hangup_body("normal_clearing", "caller"), &[]))
            .unwrap();
        assert_eq!(
            parse.events[0].kind,
            EventKind::Ended {
                reason: crate::providers::EndReason::HangupBot
            }
        );
    }

    #[test]
    fn busy_cause_maps_to_busy() {
        let adapter = adapter(true);
        let parse = adapter
            .parse_webhook_event(&ctx(hangup_body("user_busy", ""), &[]))
            .unwrap();
        assert_eq!(
            parse.events[0].kind,
            EventKind::Ended {
                reason: crate::providers::EndReason::Busy
            }
        );
    }

    #[test]
    fn transcription_event_becomes_speech() {
        let adapter = adapter(true);
        let body = serde_json::json!({
            "data": {
                "event_type": "call.transcription",
                "payload": {
                    "call_control_id": "cc-2",
                    "transcription_data": {
                        "transcript": "добрый день",
                        "is_final": true,
                        "confidence": 0.87
                    }
                }
            }
        });
        let parse = adapter.parse_webhook_event(&ctx(body, &[])).unwrap();
        assert_eq!(
            parse.events[0].kind,
            EventKind::Speech {
                transcript: "добрый день".into(),
                is_final: true,
                confidence: Some(0.87),
            }
        );
    }

    #[test]
    fn missing_event_type_is_bad_payload() {
        let adapter = adapter(true);
        let err = adapter
            .parse_webhook_event(&ctx(serde_json::json!({"data": {}}), &[]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::BadPayload(_)));
    }
}
