use std::sync::Mutex;

use crate::error::BridgeError;
use crate::providers::{
    CallRef, InitiateInput, InitiateOutput, NormalizedEvent, StreamRegistry, WebhookContext,
    WebhookParse, WebhookReply,
};

/// Deterministic in-process adapter: no network, every command succeeds and
/// is recorded. Webhook bodies are already-normalized event batches, which
/// makes end-to-end scenarios scriptable.
pub struct MockAdapter {
    streams: StreamRegistry,
    commands: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            streams: StreamRegistry::new("/voice/stream"),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Commands observed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("command log lock").clone()
    }

    fn record(&self, command: String) {
        self.commands.lock().expect("command log lock").push(command);
    }

    pub fn verify_webhook(&self, _ctx: &WebhookContext) -> Result<(), BridgeError> {
        Ok(())
    }

    pub fn parse_webhook_event(&self, ctx: &WebhookContext) -> Result<WebhookParse, BridgeError> {
        let body = ctx.json_body()?;
        let events: Vec<NormalizedEvent> = serde_json::from_value(
            body.get("events")
                .cloned()
                .ok_or_else(|| BridgeError::BadPayload("missing events".into()))?,
        )
        .map_err(|e| BridgeError::BadPayload(format!("invalid events: {e}")))?;

        Ok(WebhookParse {
            events,
            reply: WebhookReply::Empty,
        })
    }

    pub async fn initiate_call(&self, input: &InitiateInput) -> Result<InitiateOutput, BridgeError> {
        self.record(format!("initiate:{}:{}", input.call_id, input.to));
        Ok(InitiateOutput {
            provider_call_id: format!("mock-{}", input.call_id),
            status: "initiated".to_string(),
        })
    }

    pub async fn hangup_call(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.record(format!("hangup:{}", call.call_id));
        Ok(())
    }

    pub async fn play_tts(&self, call: &CallRef, text: &str) -> Result<(), BridgeError> {
        self.record(format!("speak:{}:{}", call.call_id, text));
        Ok(())
    }

    pub async fn start_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.record(format!("listen-start:{}", call.call_id));
        Ok(())
    }

    pub async fn stop_listening(&self, call: &CallRef) -> Result<(), BridgeError> {
        self.record(format!("listen-stop:{}", call.call_id));
        Ok(())
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{EventKind, next_event_id, now_ms};
    use std::collections::HashMap;

    #[tokio::test]
    async fn commands_recorded_in_order() {
        let adapter = MockAdapter::new();
        let call = CallRef {
            call_id: "call-1".into(),
            provider_call_id: Some("mock-call-1".into()),
        };

        let out = adapter
            .initiate_call(&InitiateInput {
                call_id: "call-1".into(),
                to: "+15550001111".into(),
                from: "+15550009999".into(),
                stream_url: None,
                initial_message: None,
            })
            .await
            .unwrap();
        assert_eq!(out.provider_call_id, "mock-call-1");

        adapter.play_tts(&call, "hello").await.unwrap();
        adapter.hangup_call(&call).await.unwrap();

        assert_eq!(
            adapter.commands(),
            vec![
                "initiate:call-1:+15550001111",
                "speak:call-1:hello",
                "hangup:call-1",
            ]
        );
    }

    #[test]
    fn webhook_passes_through_normalized_events() {
        let adapter = MockAdapter::new();
        let event = NormalizedEvent {
            id: next_event_id(),
            call_id: Some("call-1".into()),
            provider_call_id: None,
            timestamp: now_ms(),
            direction: None,
            from: None,
            to: None,
            kind: EventKind::Ringing,
        };
        let ctx = WebhookContext {
            method: "POST".into(),
            url: "http://localhost/voice/webhook".into(),
            headers: HashMap::new(),
            body: bytes::Bytes::from(
                serde_json::json!({ "events": [event] }).to_string(),
            ),
        };

        let parse = adapter.parse_webhook_event(&ctx).unwrap();
        assert_eq!(parse.events.len(), 1);
        assert_eq!(parse.events[0].kind, EventKind::Ringing);
    }
}
