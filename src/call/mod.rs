pub mod history;
pub mod record;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, Notify};

use crate::config::{LimitsConfig, StreamingConfig};
use crate::error::BridgeError;
use crate::providers::{
    now_ms, CallDirection, CallRef, EndReason, EventKind, InitiateInput, NormalizedEvent, Provider,
};
use crate::stream::StreamHub;
use crate::tts::TelephonyTts;

use history::CallHistory;
pub use record::{CallMetadata, CallMode, CallRecord, CallState, Speaker};

/// Fired exactly once per call with the final immutable record.
pub type EndHook = Arc<dyn Fn(CallRecord) -> BoxFuture<'static, ()> + Send + Sync>;

/// Options for an outbound dial.
#[derive(Debug, Clone, Default)]
pub struct InitiateOptions {
    pub prompt: String,
    pub objective: Option<String>,
    pub context: Option<String>,
    pub language: Option<String>,
    pub mode: CallMode,
    pub message_to: Option<String>,
}

struct Store {
    by_id: HashMap<String, CallRecord>,
    by_provider_id: HashMap<String, String>,
    /// Last time anything happened on a call, for the silence watchdog.
    activity: HashMap<String, i64>,
}

impl Store {
    /// Resolve an event to an internal call id via the explicit id, the
    /// provider reverse index, or nothing.
    fn resolve(&self, event: &NormalizedEvent) -> Option<String> {
        if let Some(ref id) = event.call_id {
            if self.by_id.contains_key(id) {
                return Some(id.clone());
            }
        }
        if let Some(ref pid) = event.provider_call_id {
            if let Some(id) = self.by_provider_id.get(pid) {
                return Some(id.clone());
            }
        }
        None
    }

    fn live_count(&self) -> usize {
        self.by_id.values().filter(|r| !r.state.is_terminal()).count()
    }
}

/// Authoritative owner of call records, transitions and timeouts.
pub struct CallManager {
    limits: LimitsConfig,
    streaming: StreamingConfig,
    from_number: String,
    calls: Mutex<Store>,
    /// Per-call notifier, pinged on every user-final transcript append and
    /// on terminal transitions. `continue_call` waits on it.
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    provider: OnceLock<Arc<Provider>>,
    hub: OnceLock<Arc<StreamHub>>,
    tts: OnceLock<Arc<TelephonyTts>>,
    end_hook: std::sync::Mutex<Option<EndHook>>,
    history: CallHistory,
}

impl CallManager {
    pub fn new(
        limits: LimitsConfig,
        streaming: StreamingConfig,
        from_number: String,
        history: CallHistory,
    ) -> Arc<Self> {
        Arc::new(Self {
            limits,
            streaming,
            from_number,
            calls: Mutex::new(Store {
                by_id: HashMap::new(),
                by_provider_id: HashMap::new(),
                activity: HashMap::new(),
            }),
            waiters: Mutex::new(HashMap::new()),
            provider: OnceLock::new(),
            hub: OnceLock::new(),
            tts: OnceLock::new(),
            end_hook: std::sync::Mutex::new(None),
            history,
        })
    }

    pub fn wire_provider(&self, provider: Arc<Provider>) {
        let _ = self.provider.set(provider);
    }

    pub fn wire_hub(&self, hub: Arc<StreamHub>) {
        let _ = self.hub.set(hub);
    }

    pub fn wire_tts(&self, tts: Arc<TelephonyTts>) {
        let _ = self.tts.set(tts);
    }

    pub fn set_on_call_ended(&self, hook: EndHook) {
        *self.end_hook.lock().expect("hook lock") = Some(hook);
    }

    fn provider(&self) -> Result<Arc<Provider>, BridgeError> {
        self.provider
            .get()
            .cloned()
            .ok_or_else(|| BridgeError::Internal("provider not wired".into()))
    }

    async fn waiter(&self, call_id: &str) -> Arc<Notify> {
        let mut waiters = self.waiters.lock().await;
        Arc::clone(
            waiters
                .entry(call_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Start an outbound call.
    pub async fn initiate_call(
        self: &Arc<Self>,
        to: &str,
        session_key: Option<String>,
        opts: InitiateOptions,
    ) -> Result<String, BridgeError> {
        let provider = self.provider()?;

        {
            let store = self.calls.lock().await;
            if store.live_count() >= self.limits.max_concurrent_calls {
                return Err(BridgeError::TooManyCalls {
                    limit: self.limits.max_concurrent_calls,
                });
            }
        }

        let call_id = mint_call_id();
        let metadata = CallMetadata {
            prompt: opts.prompt.clone(),
            objective: opts.objective,
            context: opts.context,
            language: opts.language,
            mode: opts.mode,
            message_to: opts.message_to,
            session_key,
        };

        let mut record = CallRecord::new(
            call_id.clone(),
            self.from_number.clone(),
            to.to_string(),
            CallDirection::Outbound,
            metadata,
            now_ms(),
        );

        let stream_url = if self.streaming.enabled {
            provider.register_call_stream(&call_id)
        } else {
            None
        };
        if let Some(ref url) = stream_url {
            record.stream_auth_token = url.split("token=").nth(1).map(str::to_string);
        }

        {
            let mut store = self.calls.lock().await;
            store.activity.insert(call_id.clone(), record.started_at);
            store.by_id.insert(call_id.clone(), record);
        }
        self.waiter(&call_id).await;

        let input = InitiateInput {
            call_id: call_id.clone(),
            to: to.to_string(),
            from: self.from_number.clone(),
            stream_url,
            initial_message: match opts.mode {
                CallMode::Notify => Some(opts.prompt),
                CallMode::Conversation => None,
            },
        };

        match provider.initiate_call(&input).await {
            Ok(out) => {
                tracing::info!(
                    call_id = %call_id,
                    provider_call_id = %out.provider_call_id,
                    status = %out.status,
                    "Outbound call initiated"
                );
                let mut store = self.calls.lock().await;
                if let Some(r) = store.by_id.get_mut(&call_id) {
                    r.provider_call_id = Some(out.provider_call_id.clone());
                }
                store.by_provider_id.insert(out.provider_call_id, call_id.clone());
            }
            Err(e) => {
                // The carrier never saw this call; drop the record instead
                // of recording a phantom failure.
                self.calls.lock().await.by_id.remove(&call_id);
                self.waiters.lock().await.remove(&call_id);
                provider.forget_call(&call_id);
                return Err(e);
            }
        }

        self.spawn_watchdog(call_id.clone());
        Ok(call_id)
    }

    /// Synthesize a bot-spoken message and append the next user turn of the
    /// transcript, bounded by `transcript_timeout_ms`.
    ///
    /// This always speaks as the bot; it never forges a user transcript
    /// entry.
    pub async fn continue_call(
        self: &Arc<Self>,
        call_id: &str,
        message: &str,
    ) -> Result<Vec<record::TranscriptEntry>, BridgeError> {
        self.speak(call_id, message).await?;

        let baseline = {
            let store = self.calls.lock().await;
            store
                .by_id
                .get(call_id)
                .ok_or_else(|| BridgeError::CallNotFound(call_id.to_string()))?
                .transcript
                .len()
        };

        let notify = self.waiter(call_id).await;
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.limits.transcript_timeout_ms);

        loop {
            {
                let store = self.calls.lock().await;
                let record = store
                    .by_id
                    .get(call_id)
                    .ok_or_else(|| BridgeError::CallNotFound(call_id.to_string()))?;
                let heard_user = record.transcript[baseline.min(record.transcript.len())..]
                    .iter()
                    .any(|t| t.speaker == Speaker::User);
                if heard_user || record.state.is_terminal() {
                    return Ok(record.transcript.clone());
                }
            }

            if tokio::time::timeout_at(deadline, notify.notified())
                .await
                .is_err()
            {
                return Err(BridgeError::TranscriptTimeout);
            }
        }
    }

    /// Speak text into the call. Conversation-mode streaming goes through
    /// the bridge's serialized TTS queue; everything else uses the
    /// provider-native speak command.
    pub async fn speak(self: &Arc<Self>, call_id: &str, text: &str) -> Result<(), BridgeError> {
        let provider = self.provider()?;

        // Transcript updates at emission time, not completion time.
        let (call_ref, stream_sid, mode) = {
            let mut store = self.calls.lock().await;
            let record = store
                .by_id
                .get_mut(call_id)
                .ok_or_else(|| BridgeError::CallNotFound(call_id.to_string()))?;
            if record.state.is_terminal() {
                return Err(BridgeError::InvalidTransition {
                    from: format!("{:?}", record.state),
                    to: "speaking".into(),
                });
            }
            record.append_transcript(Speaker::Bot, text.to_string(), now_ms());
            if record.state.can_transition_to(CallState::Speaking) {
                record.state = CallState::Speaking;
            }
            let refr = CallRef {
                call_id: record.call_id.clone(),
                provider_call_id: record.provider_call_id.clone(),
            };
            let sid = record.stream_sid.clone();
            let mode = record.metadata.mode;
            store.activity.insert(call_id.to_string(), now_ms());
            (refr, sid, mode)
        };

        let use_queue = mode == CallMode::Conversation
            && self.streaming.enabled
            && stream_sid.is_some()
            && self.hub.get().is_some();

        if use_queue {
            let stream_sid = stream_sid.expect("checked above");
            let hub = self.hub.get().expect("checked above");
            match self.tts.get() {
                Some(tts) => {
                    let audio = match tts.synthesize_for_telephony(text).await {
                        Ok(a) => a,
                        Err(e) => {
                            // Degrade to provider-native speak.
                            tracing::warn!(call_id, "TTS failed, falling back to provider speak: {e}");
                            return provider.play_tts(&call_ref, text).await;
                        }
                    };
                    hub.enqueue_playback(&stream_sid, audio).await
                }
                None => provider.play_tts(&call_ref, text).await,
            }
        } else {
            provider.play_tts(&call_ref, text).await?;
            // Without a media stream the reply can only come back through
            // carrier-side transcription webhooks.
            if !self.streaming.enabled {
                if let Err(e) = provider.start_listening(&call_ref).await {
                    tracing::debug!(call_id, "Carrier transcription not started: {e}");
                }
            }
            Ok(())
        }
    }

    /// Hang up from our side. Provider errors surface to the caller and do
    /// not transition the call.
    pub async fn end_call(self: &Arc<Self>, call_id: &str) -> Result<(), BridgeError> {
        let provider = self.provider()?;

        let call_ref = {
            let store = self.calls.lock().await;
            let record = store
                .by_id
                .get(call_id)
                .ok_or_else(|| BridgeError::CallNotFound(call_id.to_string()))?;
            if record.state.is_terminal() {
                return Ok(());
            }
            CallRef {
                call_id: record.call_id.clone(),
                provider_call_id: record.provider_call_id.clone(),
            }
        };

        if let Err(e) = provider.stop_listening(&call_ref).await {
            tracing::debug!(call_id, "Carrier transcription not stopped: {e}");
        }
        provider.hangup_call(&call_ref).await?;

        let finished = {
            let mut store = self.calls.lock().await;
            if let Some(record) = store.by_id.get_mut(call_id) {
                if record.state.can_transition_to(CallState::Ending) {
                    record.state = CallState::Ending;
                }
            }
            // The carrier will usually confirm with a call.ended webhook;
            // the mock and misbehaving carriers are finalized here.
            self.finish_locked(&mut store, call_id, EndReason::HangupBot, None)
        };
        if let Some(record) = finished {
            self.after_terminal(record).await;
        }

        Ok(())
    }

    pub async fn get_call(&self, call_id: &str) -> Option<CallRecord> {
        self.calls.lock().await.by_id.get(call_id).cloned()
    }

    pub async fn get_call_by_provider_call_id(&self, provider_call_id: &str) -> Option<CallRecord> {
        let store = self.calls.lock().await;
        let id = store.by_provider_id.get(provider_call_id)?;
        store.by_id.get(id).cloned()
    }

    pub async fn active_calls(&self) -> Vec<CallRecord> {
        let store = self.calls.lock().await;
        let mut calls: Vec<CallRecord> = store
            .by_id
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect();
        calls.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        calls
    }

    /// Terminal records, newest first.
    pub fn call_history(&self, limit: usize) -> Vec<CallRecord> {
        self.history.read_last(limit)
    }

    /// Apply one normalized event. Events for the same call are applied in
    /// arrival order; redelivered terminal events are idempotent.
    pub async fn apply_event(self: &Arc<Self>, event: NormalizedEvent) {
        let mut finished: Option<CallRecord> = None;
        let mut notify_user_turn = false;

        let call_id = {
            let mut store = self.calls.lock().await;

            let call_id = match store.resolve(&event) {
                Some(id) => id,
                None => match self.admit_inbound(&mut store, &event) {
                    Some(id) => id,
                    None => {
                        tracing::warn!(event_id = %event.id, "Event for unknown call, dropping");
                        return;
                    }
                },
            };

            // Keep the reverse index current the first time the provider id
            // shows up.
            if let Some(ref pid) = event.provider_call_id {
                if !store.by_provider_id.contains_key(pid) {
                    store.by_provider_id.insert(pid.clone(), call_id.clone());
                    if let Some(r) = store.by_id.get_mut(&call_id) {
                        if r.provider_call_id.is_none() {
                            r.provider_call_id = Some(pid.clone());
                        }
                    }
                }
            }

            store.activity.insert(call_id.clone(), now_ms());

            match &event.kind {
                EventKind::Initiated => {}
                EventKind::Ringing => {
                    self.advance(&mut store, &call_id, &[CallState::Ringing]);
                }
                EventKind::Answered => {
                    self.advance(&mut store, &call_id, &[CallState::Ringing, CallState::Answered]);
                }
                EventKind::Active => {
                    self.advance(
                        &mut store,
                        &call_id,
                        &[CallState::Ringing, CallState::Answered, CallState::Active],
                    );
                }
                EventKind::Speaking => {
                    self.advance(&mut store, &call_id, &[CallState::Speaking]);
                }
                EventKind::Speech {
                    transcript,
                    is_final,
                    ..
                } => {
                    if *is_final {
                        if let Some(record) = store.by_id.get_mut(&call_id) {
                            record.append_transcript(
                                Speaker::User,
                                transcript.clone(),
                                event.timestamp,
                            );
                        }
                        self.advance(&mut store, &call_id, &[CallState::Listening]);
                        notify_user_turn = true;
                    }
                }
                EventKind::Dtmf { digits } => {
                    tracing::info!(call_id = %call_id, digits = %digits, "DTMF received");
                }
                EventKind::Ended { reason } => {
                    finished = self.finish_locked(&mut store, &call_id, *reason, None);
                }
                EventKind::Error { error, retryable } => {
                    if retryable.unwrap_or(false) {
                        tracing::warn!(call_id = %call_id, "Retryable provider error: {error}");
                    } else {
                        finished = self.finish_locked(
                            &mut store,
                            &call_id,
                            EndReason::Failed,
                            Some(error.clone()),
                        );
                    }
                }
            }

            call_id
        };

        if notify_user_turn {
            self.waiter(&call_id).await.notify_waiters();
        }
        if let Some(record) = finished {
            self.after_terminal(record).await;
        }
    }

    /// A carrier webhook for a call we did not originate: create the record.
    fn admit_inbound(&self, store: &mut Store, event: &NormalizedEvent) -> Option<String> {
        if !matches!(
            event.kind,
            EventKind::Initiated | EventKind::Ringing | EventKind::Answered
        ) {
            return None;
        }

        let call_id = event
            .call_id
            .clone()
            .unwrap_or_else(mint_call_id);

        let metadata = CallMetadata {
            mode: if self.streaming.enabled && self.streaming.is_conversation() {
                CallMode::Conversation
            } else {
                CallMode::Notify
            },
            ..CallMetadata::default()
        };

        let mut record = CallRecord::new(
            call_id.clone(),
            event.from.clone().unwrap_or_else(|| "unknown".to_string()),
            event.to.clone().unwrap_or_else(|| self.from_number.clone()),
            event.direction.unwrap_or(CallDirection::Inbound),
            metadata,
            event.timestamp,
        );
        record.provider_call_id = event.provider_call_id.clone();

        tracing::info!(
            call_id = %call_id,
            from = %record.from,
            "Inbound call admitted"
        );

        if let Some(ref pid) = event.provider_call_id {
            store.by_provider_id.insert(pid.clone(), call_id.clone());
        }
        store.activity.insert(call_id.clone(), event.timestamp);
        store.by_id.insert(call_id.clone(), record);
        Some(call_id)
    }

    /// Walk the record through a chain of states, applying each edge that is
    /// legal from wherever the record currently is.
    fn advance(&self, store: &mut Store, call_id: &str, chain: &[CallState]) {
        let Some(record) = store.by_id.get_mut(call_id) else {
            return;
        };
        for &target in chain {
            if record.state.can_transition_to(target) {
                tracing::debug!(
                    call_id = %call_id,
                    from = ?record.state,
                    to = ?target,
                    "State transition"
                );
                record.state = target;
            } else if record.state != target {
                tracing::debug!(
                    call_id = %call_id,
                    from = ?record.state,
                    to = ?target,
                    "Skipping invalid transition"
                );
            }
        }
    }

    /// Drive a call to its terminal state. Returns the final record the
    /// first time only; redeliveries are a no-op.
    fn finish_locked(
        &self,
        store: &mut Store,
        call_id: &str,
        reason: EndReason,
        reason_label: Option<String>,
    ) -> Option<CallRecord> {
        let record = store.by_id.get_mut(call_id)?;
        if record.state.is_terminal() {
            return None;
        }

        let terminal = CallState::from_end_reason(reason);

        // Hangups are reachable only via the ending phase.
        if matches!(terminal, CallState::HangupUser | CallState::HangupBot)
            && record.state != CallState::Ending
            && record.state.can_transition_to(CallState::Ending)
        {
            record.state = CallState::Ending;
        }

        if record.state.can_transition_to(terminal) {
            record.state = terminal;
        } else {
            // A hangup reason arriving before the call ever became active
            // still terminates the call; map it to completed.
            tracing::debug!(
                call_id = %call_id,
                from = ?record.state,
                to = ?terminal,
                "Terminal transition not reachable, completing instead"
            );
            record.state = CallState::Completed;
        }

        record.end_reason = Some(reason_label.unwrap_or_else(|| reason.as_str().to_string()));
        record.ended_at = Some(now_ms());
        store.activity.remove(call_id);

        tracing::info!(
            call_id = %call_id,
            state = ?record.state,
            reason = %record.end_reason.as_deref().unwrap_or(""),
            "Call ended"
        );

        Some(record.clone())
    }

    /// Post-terminal bookkeeping: persist history, fire the end hook exactly
    /// once, then delete the in-memory record.
    async fn after_terminal(self: &Arc<Self>, record: CallRecord) {
        self.history.append(&record);

        if let Some(provider) = self.provider.get() {
            provider.forget_call(&record.call_id);
        }
        if let Some(hub) = self.hub.get() {
            if let Some(ref sid) = record.stream_sid {
                hub.close_stream(sid).await;
            }
        }

        // Wake any continue_call waiter so it observes the terminal state.
        self.waiter(&record.call_id).await.notify_waiters();

        let hook = self.end_hook.lock().expect("hook lock").clone();
        let manager = Arc::clone(self);
        let call_id = record.call_id.clone();
        tokio::spawn(async move {
            if let Some(hook) = hook {
                hook(record).await;
            }
            // The record is deleted only after the outcome hook finishes.
            let mut store = manager.calls.lock().await;
            store.by_id.remove(&call_id);
            store.by_provider_id.retain(|_, id| id != &call_id);
            drop(store);
            manager.waiters.lock().await.remove(&call_id);
        });
    }

    /// Watchdog for ring, silence and absolute-duration timeouts.
    fn spawn_watchdog(self: &Arc<Self>, call_id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let tick = Duration::from_millis(1000);
            loop {
                tokio::time::sleep(tick).await;

                let finished = {
                    let mut store = manager.calls.lock().await;
                    let Some(record) = store.by_id.get(&call_id) else {
                        return;
                    };
                    if record.state.is_terminal() {
                        return;
                    }

                    let now = now_ms();
                    let age = now - record.started_at;
                    let idle = now - store.activity.get(&call_id).copied().unwrap_or(now);

                    if matches!(record.state, CallState::Initiating | CallState::Ringing)
                        && age > manager.limits.ring_timeout_ms as i64
                    {
                        tracing::warn!(call_id = %call_id, "Ring timeout");
                        manager.finish_locked(&mut store, &call_id, EndReason::NoAnswer, None)
                    } else if age > (manager.limits.max_duration_seconds * 1000) as i64 {
                        tracing::warn!(call_id = %call_id, "Max call duration reached");
                        manager.finish_locked(&mut store, &call_id, EndReason::Timeout, None)
                    } else if !matches!(record.state, CallState::Initiating | CallState::Ringing)
                        && idle > manager.limits.silence_timeout_ms as i64
                    {
                        tracing::warn!(call_id = %call_id, "Silence timeout");
                        manager.finish_locked(&mut store, &call_id, EndReason::Timeout, None)
                    } else {
                        None
                    }
                };

                if let Some(record) = finished {
                    manager.after_terminal(record).await;
                    return;
                }
            }
        });
    }

    // Bridge-facing hooks ---------------------------------------------------

    /// The media stream for a call was accepted.
    pub async fn on_stream_accepted(self: &Arc<Self>, call_id: &str, stream_sid: &str) {
        let mut store = self.calls.lock().await;
        if let Some(record) = store.by_id.get_mut(call_id) {
            record.stream_sid = Some(stream_sid.to_string());
        }
        self.advance(
            &mut store,
            call_id,
            &[CallState::Ringing, CallState::Answered, CallState::Active],
        );
        store.activity.insert(call_id.to_string(), now_ms());
        // Outbound streams sometimes connect before the watchdog is useful
        // for inbound calls too.
        drop(store);
        self.spawn_watchdog(call_id.to_string());
    }

    /// Final user transcript from the realtime session.
    pub async fn on_user_final(self: &Arc<Self>, call_id: &str, text: &str) {
        {
            let mut store = self.calls.lock().await;
            if let Some(record) = store.by_id.get_mut(call_id) {
                record.append_transcript(Speaker::User, text.to_string(), now_ms());
            }
            self.advance(&mut store, call_id, &[CallState::Listening]);
            store.activity.insert(call_id.to_string(), now_ms());
        }
        self.waiter(call_id).await.notify_waiters();
    }

    /// Final assistant transcript from the realtime session.
    pub async fn on_assistant_final(self: &Arc<Self>, call_id: &str, text: &str) {
        let mut store = self.calls.lock().await;
        if let Some(record) = store.by_id.get_mut(call_id) {
            record.append_transcript(Speaker::Assistant, text.to_string(), now_ms());
        }
        self.advance(&mut store, call_id, &[CallState::Speaking]);
        store.activity.insert(call_id.to_string(), now_ms());
    }

    /// Server-side VAD says the peer started talking.
    pub async fn on_peer_speech_started(self: &Arc<Self>, call_id: &str) {
        let mut store = self.calls.lock().await;
        self.advance(&mut store, call_id, &[CallState::Listening]);
        store.activity.insert(call_id.to_string(), now_ms());
    }

    /// Terminal failure originating inside the bridge (e.g. conversation
    /// realtime socket lost).
    pub async fn fail_call(self: &Arc<Self>, call_id: &str, reason_label: &str) {
        let finished = {
            let mut store = self.calls.lock().await;
            self.finish_locked(
                &mut store,
                call_id,
                EndReason::Failed,
                Some(reason_label.to_string()),
            )
        };
        if let Some(record) = finished {
            self.after_terminal(record).await;
        }
    }
}

fn mint_call_id() -> String {
    format!("call-{:016x}", rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{next_event_id, MockAdapter};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_manager() -> Arc<CallManager> {
        let history_path = std::env::temp_dir().join(format!(
            "voice-bridge-mgr-{}-{}.jsonl",
            std::process::id(),
            rand::random::<u32>()
        ));
        let manager = CallManager::new(
            LimitsConfig::default(),
            StreamingConfig::default(),
            "+15550009999".to_string(),
            CallHistory::new(history_path),
        );
        manager.wire_provider(Arc::new(Provider::Mock(MockAdapter::new())));
        manager
    }

    fn event(call_id: &str, kind: EventKind) -> NormalizedEvent {
        NormalizedEvent {
            id: next_event_id(),
            call_id: Some(call_id.to_string()),
            provider_call_id: None,
            timestamp: now_ms(),
            direction: None,
            from: None,
            to: None,
            kind,
        }
    }

    #[tokio::test]
    async fn happy_outbound_reaches_hangup_user() {
        let manager = test_manager();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_in_hook = Arc::clone(&fired);
        manager.set_on_call_ended(Arc::new(move |record: CallRecord| {
            let fired = Arc::clone(&fired_in_hook);
            Box::pin(async move {
                assert_eq!(record.state, CallState::HangupUser);
                assert!(record.ended_at.is_some());
                fired.fetch_add(1, Ordering::SeqCst);
            })
        }));

        let call_id = manager
            .initiate_call(
                "+15550001111",
                Some("agent:main:telegram:dm:42".into()),
                InitiateOptions {
                    prompt: "Забронировать столик на имя Елена, завтра 20:00, 4 гостя".into(),
                    ..InitiateOptions::default()
                },
            )
            .await
            .expect("initiate");

        manager.apply_event(event(&call_id, EventKind::Ringing)).await;
        manager.apply_event(event(&call_id, EventKind::Answered)).await;
        manager
            .apply_event(event(&call_id, EventKind::Ended { reason: EndReason::HangupUser }))
            .await;

        // Redelivered terminal event must be idempotent.
        manager
            .apply_event(event(&call_id, EventKind::Ended { reason: EndReason::HangupUser }))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let history = manager.call_history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, CallState::HangupUser);
        assert_eq!(history[0].end_reason.as_deref(), Some("hangup-user"));
    }

    #[tokio::test]
    async fn concurrency_cap_enforced() {
        let history_path = std::env::temp_dir().join(format!(
            "voice-bridge-cap-{}-{}.jsonl",
            std::process::id(),
            rand::random::<u32>()
        ));
        let manager = CallManager::new(
            LimitsConfig {
                max_concurrent_calls: 1,
                ..LimitsConfig::default()
            },
            StreamingConfig::default(),
            "+15550009999".to_string(),
            CallHistory::new(history_path),
        );
        manager.wire_provider(Arc::new(Provider::Mock(MockAdapter::new())));

        let first = manager
            .initiate_call("+15550001111", None, InitiateOptions::default())
            .await;
        assert!(first.is_ok());

        let second = manager
            .initiate_call("+15550002222", None, InitiateOptions::default())
            .await;
        assert!(matches!(second, Err(BridgeError::TooManyCalls { limit: 1 })));
    }

    #[tokio::test]
    async fn speech_events_append_user_transcript() {
        let manager = test_manager();
        let call_id = manager
            .initiate_call("+15550001111", None, InitiateOptions::default())
            .await
            .unwrap();

        manager.apply_event(event(&call_id, EventKind::Ringing)).await;
        manager.apply_event(event(&call_id, EventKind::Answered)).await;
        manager.apply_event(event(&call_id, EventKind::Active)).await;

        manager
            .apply_event(event(
                &call_id,
                EventKind::Speech {
                    transcript: "Добрый день".into(),
                    is_final: true,
                    confidence: Some(0.95),
                },
            ))
            .await;
        // Partials never reach the transcript.
        manager
            .apply_event(event(
                &call_id,
                EventKind::Speech {
                    transcript: "мы ра".into(),
                    is_final: false,
                    confidence: None,
                },
            ))
            .await;

        let record = manager.get_call(&call_id).await.unwrap();
        assert_eq!(record.transcript.len(), 1);
        assert_eq!(record.transcript[0].speaker, Speaker::User);
        assert_eq!(record.transcript[0].text, "Добрый день");
        assert_eq!(record.state, CallState::Listening);
    }

    #[tokio::test]
    async fn inbound_event_creates_record() {
        let manager = test_manager();

        let inbound = NormalizedEvent {
            id: next_event_id(),
            call_id: None,
            provider_call_id: Some("PA-778".into()),
            timestamp: now_ms(),
            direction: Some(CallDirection::Inbound),
            from: Some("+74950000000".into()),
            to: Some("+15550009999".into()),
            kind: EventKind::Ringing,
        };
        manager.apply_event(inbound).await;

        let record = manager.get_call_by_provider_call_id("PA-778").await.unwrap();
        assert_eq!(record.direction, CallDirection::Inbound);
        assert_eq!(record.from, "+74950000000");
        assert_eq!(record.state, CallState::Ringing);
    }

    #[tokio::test]
    async fn failed_realtime_sets_custom_end_reason() {
        let manager = test_manager();
        let call_id = manager
            .initiate_call("+15550001111", None, InitiateOptions::default())
            .await
            .unwrap();

        manager.apply_event(event(&call_id, EventKind::Ringing)).await;
        manager.apply_event(event(&call_id, EventKind::Answered)).await;
        manager.apply_event(event(&call_id, EventKind::Active)).await;

        manager.fail_call(&call_id, "realtime-disconnected").await;

        let history = manager.call_history(5);
        assert_eq!(history[0].state, CallState::Failed);
        assert_eq!(history[0].end_reason.as_deref(), Some("realtime-disconnected"));
    }

    #[tokio::test]
    async fn end_call_is_idempotent_on_terminal_calls() {
        let manager = test_manager();
        let call_id = manager
            .initiate_call("+15550001111", None, InitiateOptions::default())
            .await
            .unwrap();

        manager
            .apply_event(event(&call_id, EventKind::Ended { reason: EndReason::Busy }))
            .await;

        // Ended already; a second end_call must not re-fire the hook. The
        // record may already be cleaned up, which is also fine.
        match manager.end_call(&call_id).await {
            Ok(()) | Err(BridgeError::CallNotFound(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
