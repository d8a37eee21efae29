use std::time::Duration;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::config::TwilioConfig;
use crate::error::BridgeError;
use crate::providers::{
    next_event_id, now_ms, parse_end_reason, query_params, CallDirection, EventKind, InitiateInput,
    InitiateOutput, NormalizedEvent, StreamRegistry, WebhookContext, WebhookParse, WebhookReply,
};
use crate::stream::token::token_matches;

use super::CallRef;

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Twilio adapter: REST control plane plus form-encoded webhooks signed with
/// HMAC-SHA1 over the URL and sorted POST parameters.
pub struct TwilioAdapter {
    client: reqwest::Client,
    config: TwilioConfig,
    skip_signature_verification: bool,
    webhook_path: String,
    streams: StreamRegistry,
    control_timeout: Duration,
}

impl TwilioAdapter {
    pub fn new(
        config: TwilioConfig,
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

        let signature = ctx
            .header("x-twilio-signature")
            .ok_or_else(|| BridgeError::UnauthorizedWebhook("missing X-Twilio-Signature".into()))?;

        let expected = twilio_signature(&self.config.auth_token, &ctx.url, &ctx.form_params());
        if token_matches(signature, &expected) {
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
            .get("CallSid")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::BadPayload("missing CallSid".into()))?
            .to_string();

        let call_id = query.get("callId").cloned();
        let direction = params.get("Direction").map(|d| {
            if d.starts_with("outbound") {
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

        // Answering-machine detection beats the raw status.
        if let Some(answered_by) = params.get("AnsweredBy") {
            if answered_by.starts_with("machine") {
                events.push(base(EventKind::Ended {
                    reason: crate::providers::EndReason::Voicemail,
                }));
                return Ok(WebhookParse {
                    events,
                    reply: WebhookReply::Empty,
                });
            }
        }

        let status = params.get("CallStatus").map(String::as_str).unwrap_or("");
        match status {
            "queued" | "initiated" => events.push(base(EventKind::Initiated)),
            "ringing" => events.push(base(EventKind::Ringing)),
            "in-progress" | "answered" => events.push(base(EventKind::Answered)),
            "busy" | "no-answer" | "failed" | "canceled" | "completed" => {
                events.push(base(EventKind::Ended {
                    reason: parse_end_reason(status),
                }));
            }
            "" => {}
            other => {
                tracing::debug!(status = %other, "Unmapped Twilio call status");
            }
        }

        // The answer leg wants TwiML back; status callbacks want nothing.
        let reply = if query.get("kind").map(String::as_str) == Some("answer") {
            WebhookReply::Xml(self.answer_twiml(call_id.as_deref(), query.get("msg")))
        } else {
            WebhookReply::Empty
        };

        Ok(WebhookParse { events, reply })
    }

    /// TwiML for the answer webhook. The call id travels as a stream
    /// `<Parameter>` because Twilio strips query strings from the WS URL.
    fn answer_twiml(&self, call_id: Option<&str>, initial_message: Option<&String>) -> String {
        if let Some(ws_base) = self.streams.ws_base() {
            let call_id = call_id.unwrap_or("");
            return format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Connect>
        <Stream url="{ws_base}">
            <Parameter name="callId" value="{call_id}" />
        </Stream>
    </Connect>
</Response>"#
            );
        }

        // No streaming: speak the notify message and leave the line open for
        // a short acknowledgement window.
        match initial_message {
            Some(msg) => format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Say>{}</Say>
    <Pause length="30" />
</Response>"#,
                xml_escape(msg)
            ),
            None => r#"<?xml version="1.0" encoding="UTF-8"?>
<Response>
    <Pause length="60" />
</Response>"#
                .to_string(),
        }
    }

    pub async fn initiate_call(&self, input: &InitiateInput) -> Result<InitiateOutput, BridgeError> {
        let origin = self
            .streams
            .origin()
            .ok_or_else(|| BridgeError::Internal("public URL not resolved".into()))?;

        let url = format!("{API_BASE}/Accounts/{}/Calls.json", self.config.account_sid);

        let mut answer_url = format!(
            "{origin}{}?kind=answer&callId={}",
            self.webhook_path, input.call_id
        );
        if let Some(ref msg) = input.initial_message {
            answer_url.push_str(&format!("&msg={}", urlencoded(msg)));
        }
        let status_url = format!(
            "{origin}{}?kind=status&callId={}",
            self.webhook_path, input.call_id
        );

        let params = [
            ("To", input.to.as_str()),
            ("From", self.config.phone_number.as_str()),
            ("Url", answer_url.as_str()),
            ("StatusCallback", status_url.as_str()),
            ("StatusCallbackEvent", "initiated ringing answered completed"),
        ];

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .timeout(self.control_timeout)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::ProviderError { status, body });
        }

        let body: serde_json::Value = resp.json().await?;
        let provider_call_id = body["sid"]
            .as_str()
            .ok_or_else(|| BridgeError::BadPayload("Twilio response missing sid".into()))?
            .to_string();
        let status = body["status"].as_str().unwrap_or("queued").to_string();

        Ok(InitiateOutput {
            provider_call_id,
            status,
        })
    }

    pub async fn hangup_call(&self, call: &CallRef) -> Result<(), BridgeError> {
        let sid = call
            .provider_call_id
            .as_deref()
            .ok_or_else(|| BridgeError::NoControlUrl(call.call_id.clone()))?;

        let url = format!(
            "{API_BASE}/Accounts/{}/Calls/{sid}.json",
            self.config.account_sid
        );
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Status", "completed")])
            .timeout(self.control_timeout)
            .send()
            .await?;

        error_for_status(resp).await
    }

    /// Provider-native speak: replace the live call's TwiML with a Say.
    pub async fn play_tts(&self, call: &CallRef, text: &str) -> Result<(), BridgeError> {
        let sid = call
            .provider_call_id
            .as_deref()
            .ok_or_else(|| BridgeError::NoControlUrl(call.call_id.clone()))?;

        let twiml = format!(
            r#"<Response><Say>{}</Say><Pause length="60" /></Response>"#,
            xml_escape(text)
        );
        let url = format!(
            "{API_BASE}/Accounts/{}/Calls/{sid}.json",
            self.config.account_sid
        );
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&[("Twiml", twiml.as_str())])
            .timeout(self.control_timeout)
            .send()
            .await?;

        error_for_status(resp).await
    }
}

async fn error_for_status(resp: reqwest::Response) -> Result<(), BridgeError> {
    if resp.status().is_success() {
        Ok(())
    } else {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(BridgeError::ProviderError { status, body })
    }
}

/// HMAC-SHA1 over the full URL followed by the sorted POST parameters,
/// base64-encoded.
fn twilio_signature(
    auth_token: &str,
    url: &str,
    params: &std::collections::HashMap<String, String>,
) -> String {
    let mut keys: Vec<&String> = params.keys().collect();
    keys.sort();

    let mut payload = url.to_string();
    for key in keys {
        payload.push_str(key);
        payload.push_str(&params[key]);
    }

    let mut mac =
        Hmac::<Sha1>::new_from_slice(auth_token.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Query-parameter percent-encoding.
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

    fn adapter(skip: bool) -> TwilioAdapter {
        TwilioAdapter::new(
            TwilioConfig {
                account_sid: "AC123".into(),
                auth_token: "secret-token".into(),
                phone_number: "+15550009999".into(),
            },
            skip,
            "/voice/webhook",
            "/voice/stream",
            10_000,
        )
    }

    fn ctx(url: &str, body: &str, signature: Option<&str>) -> WebhookContext {
        let mut headers = HashMap::new();
        if let Some(sig) = signature {
            headers.insert("x-twilio-signature".to_string(), sig.to_string());
        }
        WebhookContext {
            method: "POST".into(),
            url: url.to_string(),
            headers,
            body: bytes::Bytes::from(body.to_string()),
        }
    }

    #[test]
    fn valid_signature_accepted() {
        let adapter = adapter(false);
        let url = "https://voice.example.com/voice/webhook?kind=status&callId=call-1";
        let body = "CallSid=CA1&CallStatus=ringing&From=%2B15550001111";

        let params = ctx(url, body, None).form_params();
        let sig = twilio_signature("secret-token", url, &params);

        assert!(adapter.verify_webhook(&ctx(url, body, Some(&sig))).is_ok());
    }

    #[test]
    fn bad_signature_rejected() {
        let adapter = adapter(false);
        let url = "https://voice.example.com/voice/webhook";
        let body = "CallSid=CA1&CallStatus=ringing";

        let err = adapter
            .verify_webhook(&ctx(url, body, Some("forged")))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnauthorizedWebhook(_)));

        let err = adapter.verify_webhook(&ctx(url, body, None)).unwrap_err();
        assert!(matches!(err, BridgeError::UnauthorizedWebhook(_)));
    }

    #[test]
    fn skip_flag_bypasses_verification() {
        let adapter = adapter(true);
        let url = "https://voice.example.com/voice/webhook";
        assert!(adapter.verify_webhook(&ctx(url, "CallSid=CA1", None)).is_ok());
    }

    #[test]
    fn status_webhook_maps_to_normalized_events() {
        let adapter = adapter(true);
        let url = "https://voice.example.com/voice/webhook?kind=status&callId=call-7";
        let parse = adapter
            .parse_webhook_event(&ctx(
                url,
                "CallSid=CA9&CallStatus=ringing&From=%2B15550001111&To=%2B15550002222&Direction=outbound-api",
                None,
            ))
            .unwrap();

        assert_eq!(parse.events.len(), 1);
        let event = &parse.events[0];
        assert_eq!(event.call_id.as_deref(), Some("call-7"));
        assert_eq!(event.provider_call_id.as_deref(), Some("CA9"));
        assert_eq!(event.kind, EventKind::Ringing);
        assert_eq!(event.direction, Some(CallDirection::Outbound));
        assert!(matches!(parse.reply, WebhookReply::Empty));
    }

    #[test]
    fn terminal_status_maps_reason() {
        let adapter = adapter(true);
        let url = "https://voice.example.com/voice/webhook?kind=status&callId=call-7";
        let parse = adapter
            .parse_webhook_event(&ctx(url, "CallSid=CA9&CallStatus=no-answer", None))
            .unwrap();
        assert_eq!(
            parse.events[0].kind,
            EventKind::Ended {
                reason: crate::providers::EndReason::NoAnswer
            }
        );
    }

    #[test]
    fn machine_answer_is_voicemail() {
        let adapter = adapter(true);
        let url = "https://voice.example.com/voice/webhook?kind=status&callId=call-7";
        let parse = adapter
            .parse_webhook_event(&ctx(
                url,
                "CallSid=CA9&CallStatus=in-progress&AnsweredBy=machine_start",
                None,
            ))
            .unwrap();
        assert_eq!(
            parse.events[0].kind,
            EventKind::Ended {
                reason: crate::providers::EndReason::Voicemail
            }
        );
    }

    #[test]
    fn answer_webhook_returns_stream_twiml_with_call_id_parameter() {
        let adapter = adapter(true);
        adapter.streams().set_public_url("https://voice.example.com");

        let url = "https://voice.example.com/voice/webhook?kind=answer&callId=call-7";
        let parse = adapter
            .parse_webhook_event(&ctx(url, "CallSid=CA9&CallStatus=in-progress", None))
            .unwrap();

        let WebhookReply::Xml(twiml) = parse.reply else {
            panic!("expected TwiML reply");
        };
        assert!(twiml.contains(r#"<Stream url="wss://voice.example.com/voice/stream">"#));
        assert!(twiml.contains(r#"<Parameter name="callId" value="call-7" />"#));
    }

    #[test]
    fn missing_call_sid_is_bad_payload() {
        let adapter = adapter(true);
        let err = adapter
            .parse_webhook_event(&ctx(
                "https://voice.example.com/voice/webhook",
                "CallStatus=ringing",
                None,
            ))
            .unwrap_err();
        assert!(matches!(err, BridgeError::BadPayload(_)));
    }

    #[test]
    fn xml_escape_covers_twiml_specials() {
        assert_eq!(
            xml_escape(r#"a < b & "c""#),
            "a &lt; b &amp; &quot;c&quot;"
        );
    }
}
