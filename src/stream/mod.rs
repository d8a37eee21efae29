pub mod queue;
pub mod token;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};

use crate::audio::{self, FRAME_INTERVAL_MS, FRAME_SIZE};
use crate::call::{CallManager, CallMode};
use crate::config::{RealtimeConfig, StreamingConfig};
use crate::error::BridgeError;
use crate::providers::Provider;
use crate::realtime::{RealtimeEvent, RealtimeMode, RealtimeSession, SessionOptions};
use queue::{PlaybackError, TtsQueue};

/// WS close code for rejected connections.
const POLICY_VIOLATION: u16 = 1008;

/// How audio is framed on the carrier socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// JSON envelope with base64 payloads (Twilio-style).
    Framed,
    /// Bare binary mu-law frames, identity in the query-string token
    /// (Voximplant-style).
    Raw,
}

/// Carrier media-stream events for the framed transport.
#[derive(Debug, Deserialize)]
#[serde(tag = "event")]
#[serde(rename_all = "lowercase")]
enum CarrierEvent {
    Connected {
        #[serde(default)]
        #[allow(dead_code)]
        protocol: Option<String>,
    },
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        #[serde(rename = "streamSid", default)]
        #[allow(dead_code)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    Mark {
        #[serde(rename = "streamSid", default)]
        #[allow(dead_code)]
        stream_sid: Option<String>,
    },
    Stop {
        #[serde(rename = "streamSid", default)]
        #[allow(dead_code)]
        stream_sid: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMetadata {
    #[serde(default)]
    call_sid: Option<String>,
    #[serde(default)]
    custom_parameters: HashMap<String, String>,
    #[serde(default)]
    #[allow(dead_code)]
    media_format: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String, // base64-encoded mu-law audio
}

struct StreamHandle {
    call_id: String,
    transport: Transport,
    out_tx: mpsc::Sender<Message>,
    queue: TtsQueue,
    session: Arc<RealtimeSession>,
}

/// The media-stream bridge: owns carrier sockets, realtime sessions and the
/// per-stream TTS queues.
pub struct StreamHub {
    streaming: StreamingConfig,
    realtime_config: RealtimeConfig,
    manager: OnceLock<Arc<CallManager>>,
    provider: OnceLock<Arc<Provider>>,
    streams: Mutex<HashMap<String, StreamHandle>>,
}

impl StreamHub {
    pub fn new(streaming: StreamingConfig, realtime_config: RealtimeConfig) -> Arc<Self> {
        Arc::new(Self {
            streaming,
            realtime_config,
            manager: OnceLock::new(),
            provider: OnceLock::new(),
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn wire_manager(&self, manager: Arc<CallManager>) {
        let _ = self.manager.set(manager);
    }

    pub fn wire_provider(&self, provider: Arc<Provider>) {
        let _ = self.provider.set(provider);
    }

    fn manager(&self) -> Option<Arc<CallManager>> {
        self.manager.get().cloned()
    }

    /// Drive one carrier WebSocket until it closes.
    pub async fn handle_socket(self: Arc<Self>, mut socket: WebSocket, query_token: Option<String>) {
        tracing::info!("Carrier media stream connected");

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        let mut established: Option<(String, Transport)> = None;

        loop {
            tokio::select! {
                ws_msg = socket.recv() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            let event: CarrierEvent = match serde_json::from_str(&text) {
                                Ok(e) => e,
                                Err(e) => {
                                    tracing::warn!("Failed to parse stream event: {e}");
                                    continue;
                                }
                            };

                            match event {
                                CarrierEvent::Connected { .. } => {
                                    tracing::debug!("Stream handshake");
                                }
                                CarrierEvent::Start { stream_sid, start } => {
                                    match self
                                        .establish_framed(
                                            &stream_sid,
                                            &start,
                                            query_token.as_deref(),
                                            out_tx.clone(),
                                        )
                                        .await
                                    {
                                        Ok(()) => {
                                            established =
                                                Some((stream_sid.clone(), Transport::Framed));
                                            // Server-originated start ack so the
                                            // provider begins playing inbound audio.
                                            let ack = serde_json::json!({
                                                "event": "start",
                                                "streamSid": stream_sid,
                                                "start": {
                                                    "mediaFormat": {
                                                        "encoding": "audio/x-mulaw",
                                                        "sampleRate": 8000,
                                                        "channels": 1
                                                    }
                                                }
                                            });
                                            let _ = socket
                                                .send(Message::Text(ack.to_string().into()))
                                                .await;
                                        }
                                        Err(e) => {
                                            tracing::warn!("Rejecting media stream: {e}");
                                            let _ = socket
                                                .send(Message::Close(Some(CloseFrame {
                                                    code: POLICY_VIOLATION,
                                                    reason: "stream rejected".into(),
                                                })))
                                                .await;
                                            break;
                                        }
                                    }
                                }
                                CarrierEvent::Media { media, .. } => {
                                    let Some((ref sid, _)) = established else {
                                        continue;
                                    };
                                    match audio::decode_frame(&media.payload) {
                                        Ok(mulaw) => self.forward_audio(sid, &mulaw).await,
                                        Err(e) => {
                                            tracing::warn!("Failed to decode media payload: {e}")
                                        }
                                    }
                                }
                                CarrierEvent::Mark { .. } => {
                                    tracing::debug!("Mark received");
                                }
                                CarrierEvent::Stop { .. } => {
                                    tracing::info!("Stream stopped by carrier");
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(bin))) => {
                            // Raw transport: identity comes from the query
                            // token, first frame establishes the stream.
                            if established.is_none() {
                                match self
                                    .establish_raw(query_token.as_deref(), out_tx.clone())
                                    .await
                                {
                                    Ok(stream_sid) => {
                                        established = Some((stream_sid, Transport::Raw));
                                    }
                                    Err(e) => {
                                        tracing::warn!("Rejecting raw media stream: {e}");
                                        let _ = socket
                                            .send(Message::Close(Some(CloseFrame {
                                                code: POLICY_VIOLATION,
                                                reason: "stream rejected".into(),
                                            })))
                                            .await;
                                        break;
                                    }
                                }
                            }
                            if let Some((ref sid, _)) = established {
                                self.forward_audio(sid, &bin).await;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("Media stream closed");
                            break;
                        }
                        Some(Err(e)) => {
                            tracing::error!("Media stream WebSocket error: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                Some(msg) = out_rx.recv() => {
                    if let Err(e) = socket.send(msg).await {
                        tracing::error!("Failed to send to carrier: {e}");
                        break;
                    }
                }
            }
        }

        if let Some((stream_sid, _)) = established {
            self.close_stream(&stream_sid).await;
        }
    }

    /// Resolve identity for a framed start event and wire up the session.
    async fn establish_framed(
        self: &Arc<Self>,
        stream_sid: &str,
        start: &StartMetadata,
        query_token: Option<&str>,
        out_tx: mpsc::Sender<Message>,
    ) -> Result<(), BridgeError> {
        let manager = self
            .manager()
            .ok_or_else(|| BridgeError::Internal("call manager not wired".into()))?;

        let call_id = self
            .resolve_call_id(start, query_token, &manager)
            .await
            .ok_or_else(|| BridgeError::BadPayload("cannot resolve callId for stream".into()))?;

        self.accept_stream(stream_sid, &call_id, query_token, Transport::Framed, out_tx)
            .await
    }

    async fn establish_raw(
        self: &Arc<Self>,
        query_token: Option<&str>,
        out_tx: mpsc::Sender<Message>,
    ) -> Result<String, BridgeError> {
        let token = query_token
            .ok_or_else(|| BridgeError::UnauthorizedWebhook("missing stream token".into()))?;
        let provider = self
            .provider
            .get()
            .ok_or_else(|| BridgeError::Internal("provider not wired".into()))?;

        let call_id = provider
            .resolve_call_id_by_token(token)
            .ok_or_else(|| BridgeError::UnauthorizedWebhook("unknown stream token".into()))?;

        let stream_sid = format!("raw-{call_id}");
        self.accept_stream(&stream_sid, &call_id, Some(token), Transport::Raw, out_tx)
            .await?;
        Ok(stream_sid)
    }

    /// Identity precedence for framed streams: customParameters, then the
    /// start callSid, then the query token.
    async fn resolve_call_id(
        &self,
        start: &StartMetadata,
        query_token: Option<&str>,
        manager: &Arc<CallManager>,
    ) -> Option<String> {
        if let Some(id) = start.custom_parameters.get("callId") {
            return Some(id.clone());
        }
        for key in ["callSid", "providerCallId", "call_session_history_id"] {
            if let Some(pid) = start.custom_parameters.get(key) {
                if let Some(record) = manager.get_call_by_provider_call_id(pid).await {
                    return Some(record.call_id);
                }
            }
        }
        if let Some(ref pid) = start.call_sid {
            if let Some(record) = manager.get_call_by_provider_call_id(pid).await {
                return Some(record.call_id);
            }
        }
        let token = query_token?;
        self.provider.get()?.resolve_call_id_by_token(token)
    }

    /// Accept check, realtime session setup and registration.
    async fn accept_stream(
        self: &Arc<Self>,
        stream_sid: &str,
        call_id: &str,
        token: Option<&str>,
        transport: Transport,
        out_tx: mpsc::Sender<Message>,
    ) -> Result<(), BridgeError> {
        let manager = self
            .manager()
            .ok_or_else(|| BridgeError::Internal("call manager not wired".into()))?;

        let record = manager
            .get_call(call_id)
            .await
            .ok_or_else(|| BridgeError::CallNotFound(call_id.to_string()))?;
        if record.state.is_terminal() {
            return Err(BridgeError::BadPayload("call already ended".into()));
        }

        // When the connection carries a token, it must match the per-call
        // secret even if identity also arrived in the start payload.
        if let Some(token) = token {
            let provider = self
                .provider
                .get()
                .ok_or_else(|| BridgeError::Internal("provider not wired".into()))?;
            if !provider.is_valid_stream_token(call_id, token) {
                return Err(BridgeError::UnauthorizedWebhook(
                    "invalid stream token".into(),
                ));
            }
        }

        let mode = if self.streaming.is_conversation()
            && record.metadata.mode == CallMode::Conversation
        {
            RealtimeMode::Conversation
        } else {
            RealtimeMode::Transcription
        };

        let opts = SessionOptions {
            mode,
            instructions: build_instructions(&record),
            voice: self.realtime_config.voice.clone(),
            language: record.metadata.language.clone(),
            opening_instruction: match mode {
                RealtimeMode::Conversation => Some(
                    "Поздоровайся первым и сразу переходи к цели звонка.".to_string(),
                ),
                RealtimeMode::Transcription => None,
            },
        };

        let (session, events) = RealtimeSession::connect(&self.realtime_config, opts)
            .await
            .map_err(|e| BridgeError::RealtimeDisconnected(e.to_string()))?;
        let session = Arc::new(session);

        {
            let mut streams = self.streams.lock().await;
            streams.insert(
                stream_sid.to_string(),
                StreamHandle {
                    call_id: call_id.to_string(),
                    transport,
                    out_tx,
                    queue: TtsQueue::new(),
                    session: Arc::clone(&session),
                },
            );
        }

        self.spawn_event_pump(stream_sid.to_string(), call_id.to_string(), mode, events);
        manager.on_stream_accepted(call_id, stream_sid).await;

        tracing::info!(
            call_id = %call_id,
            stream_sid = %stream_sid,
            transport = ?transport,
            mode = ?mode,
            "Media stream accepted"
        );
        Ok(())
    }

    /// Pump realtime events into the call manager and back onto the carrier.
    fn spawn_event_pump(
        self: &Arc<Self>,
        stream_sid: String,
        call_id: String,
        mode: RealtimeMode,
        mut events: mpsc::Receiver<RealtimeEvent>,
    ) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = hub.manager() else { return };
                match event {
                    RealtimeEvent::UserPartial(_) => {}
                    RealtimeEvent::UserFinal { transcript, .. } => {
                        manager.on_user_final(&call_id, &transcript).await;
                    }
                    RealtimeEvent::SpeechStarted => {
                        // Barge-in: stop whatever the bot is saying.
                        hub.clear_tts_queue(&stream_sid).await;
                        manager.on_peer_speech_started(&call_id).await;
                    }
                    RealtimeEvent::AssistantPartial(_) => {}
                    RealtimeEvent::AssistantFinal(text) => {
                        manager.on_assistant_final(&call_id, &text).await;
                    }
                    RealtimeEvent::AssistantAudio(mulaw) => {
                        hub.send_audio(&stream_sid, &mulaw).await;
                    }
                    RealtimeEvent::Disconnected { reason } => {
                        tracing::warn!(
                            call_id = %call_id,
                            stream_sid = %stream_sid,
                            "Realtime session lost: {reason}"
                        );
                        if mode == RealtimeMode::Conversation {
                            manager.fail_call(&call_id, "realtime-disconnected").await;
                            hub.close_stream(&stream_sid).await;
                        }
                        return;
                    }
                }
            }
        });
    }

    /// Forward carrier audio to the realtime session, unbuffered.
    async fn forward_audio(&self, stream_sid: &str, mulaw: &[u8]) {
        let streams = self.streams.lock().await;
        if let Some(handle) = streams.get(stream_sid) {
            handle.session.send_audio(mulaw);
        }
    }

    /// Emit mu-law bytes to the carrier in its transport framing.
    pub async fn send_audio(&self, stream_sid: &str, mulaw: &[u8]) {
        let (out_tx, transport) = {
            let streams = self.streams.lock().await;
            let Some(handle) = streams.get(stream_sid) else {
                return;
            };
            (handle.out_tx.clone(), handle.transport)
        };

        let msg = frame_message(transport, stream_sid, mulaw);
        if out_tx.send(msg).await.is_err() {
            tracing::debug!(stream_sid = %stream_sid, "Carrier socket gone, dropping audio");
        }
    }

    #[allow(dead_code)]
    pub async fn send_mark(&self, stream_sid: &str, name: &str) {
        let streams = self.streams.lock().await;
        let Some(handle) = streams.get(stream_sid) else {
            return;
        };
        if handle.transport == Transport::Framed {
            let mark = serde_json::json!({
                "event": "mark",
                "streamSid": stream_sid,
                "mark": { "name": name }
            });
            let _ = handle.out_tx.send(Message::Text(mark.to_string().into())).await;
        }
    }

    /// Tell the carrier to drop any buffered outbound audio.
    pub async fn clear_audio(&self, stream_sid: &str) {
        let streams = self.streams.lock().await;
        let Some(handle) = streams.get(stream_sid) else {
            return;
        };
        if handle.transport == Transport::Framed {
            let clear = serde_json::json!({
                "event": "clear",
                "streamSid": stream_sid,
            });
            let _ = handle.out_tx.send(Message::Text(clear.to_string().into())).await;
        }
    }

    /// Queue synthesized speech for paced playout: 160-byte frames, 20 ms
    /// apart, abort checked before each frame and after each sleep.
    pub async fn enqueue_playback(
        &self,
        stream_sid: &str,
        mulaw: Vec<u8>,
    ) -> Result<(), BridgeError> {
        let (out_tx, transport, queue) = {
            let streams = self.streams.lock().await;
            let handle = streams
                .get(stream_sid)
                .ok_or_else(|| BridgeError::Internal(format!("no stream {stream_sid}")))?;
            (handle.out_tx.clone(), handle.transport, handle.queue.clone())
        };

        let sid = stream_sid.to_string();
        let done = queue
            .enqueue(Box::new(move |signal| {
                Box::pin(async move {
                    for chunk in audio::chunk(&mulaw, FRAME_SIZE) {
                        if signal.is_cancelled() {
                            return Ok(());
                        }
                        let msg = frame_message(transport, &sid, chunk);
                        if out_tx.send(msg).await.is_err() {
                            return Err(PlaybackError("carrier socket closed".into()));
                        }
                        tokio::time::sleep(Duration::from_millis(FRAME_INTERVAL_MS)).await;
                        if signal.is_cancelled() {
                            return Ok(());
                        }
                    }

                    if transport == Transport::Framed {
                        let mark = serde_json::json!({
                            "event": "mark",
                            "streamSid": sid,
                            "mark": { "name": "playback_end" }
                        });
                        let _ = out_tx.send(Message::Text(mark.to_string().into())).await;
                    }
                    Ok(())
                })
            }))
            .await;

        let sid = stream_sid.to_string();
        tokio::spawn(async move {
            match done.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(stream_sid = %sid, "Playback failed: {e}"),
                Err(_) => {}
            }
        });

        Ok(())
    }

    /// Barge-in entry point: abort current playback, drop the queue, and
    /// tell the carrier to flush.
    pub async fn clear_tts_queue(&self, stream_sid: &str) {
        let queue = {
            let streams = self.streams.lock().await;
            streams.get(stream_sid).map(|h| h.queue.clone())
        };
        if let Some(queue) = queue {
            queue.clear().await;
        }
        self.clear_audio(stream_sid).await;
    }

    /// Tear down one stream: queue, realtime session and registration.
    pub async fn close_stream(&self, stream_sid: &str) {
        let handle = self.streams.lock().await.remove(stream_sid);
        if let Some(handle) = handle {
            handle.queue.close().await;
            handle.session.close();
            tracing::info!(
                call_id = %handle.call_id,
                stream_sid = %stream_sid,
                "Media stream closed"
            );
        }
    }
}

fn frame_message(transport: Transport, stream_sid: &str, mulaw: &[u8]) -> Message {
    match transport {
        Transport::Framed => {
            let msg = serde_json::json!({
                "event": "media",
                "streamSid": stream_sid,
                "media": { "payload": audio::encode_frame(mulaw) }
            });
            Message::Text(msg.to_string().into())
        }
        Transport::Raw => Message::Binary(mulaw.to_vec().into()),
    }
}

/// Compose the realtime system prompt from the call's metadata.
fn build_instructions(record: &crate::call::CallRecord) -> Option<String> {
    let meta = &record.metadata;
    if meta.prompt.is_empty() && meta.objective.is_none() && meta.context.is_none() {
        return None;
    }

    let mut parts = vec![
        "Ты — вежливый голосовой ассистент, который звонит по поручению пользователя."
            .to_string(),
    ];
    if !meta.prompt.is_empty() {
        parts.push(format!("Задача: {}", crate::outcome::sanitize_task(&meta.prompt)));
    }
    if let Some(ref objective) = meta.objective {
        parts.push(format!("Цель: {objective}"));
    }
    if let Some(ref context) = meta.context {
        parts.push(format!("Контекст: {context}"));
    }
    parts.push("Говори коротко и естественно, без списков и разметки.".to_string());

    Some(parts.join("\n"))
}
