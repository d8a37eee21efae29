use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::RealtimeConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SESSION_ACK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// How the cloud model participates in the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeMode {
    /// Carrier audio in, user transcripts out. May reconnect on drop.
    Transcription,
    /// Full dialog: user transcripts plus assistant audio and transcripts.
    /// Never reconnects — server state is not preserved and resumption would
    /// desync the dialog.
    Conversation,
}

/// Per-call session parameters.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub mode: RealtimeMode,
    /// System prompt for conversation mode.
    pub instructions: Option<String>,
    pub voice: String,
    pub language: Option<String>,
    /// One-time per-response instruction used to force the opening line.
    pub opening_instruction: Option<String>,
}

/// Everything a consumer can observe from one session, as a single stream
/// of tagged variants.
#[derive(Debug, Clone)]
pub enum RealtimeEvent {
    UserPartial(String),
    UserFinal {
        transcript: String,
        confidence: Option<f64>,
    },
    /// Server-side VAD noticed the peer speaking. Any buffered partial user
    /// transcript has been discarded by the time this is emitted.
    SpeechStarted,
    AssistantPartial(String),
    AssistantFinal(String),
    /// Mu-law frames of assistant speech.
    AssistantAudio(Vec<u8>),
    /// The session is gone for good (reconnects exhausted or not allowed).
    Disconnected { reason: String },
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handle to one realtime WebSocket session. One per call.
pub struct RealtimeSession {
    audio_tx: mpsc::Sender<Vec<u8>>,
    connected: Arc<AtomicBool>,
    dropped_frames: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl RealtimeSession {
    /// Open a session and resolve only once the server has acknowledged the
    /// session configuration. Returns the handle and the event stream.
    pub async fn connect(
        config: &RealtimeConfig,
        opts: SessionOptions,
    ) -> Result<(Self, mpsc::Receiver<RealtimeEvent>), RealtimeError> {
        let socket = open_and_configure(config, &opts).await?;

        let (audio_tx, audio_rx) = mpsc::channel::<Vec<u8>>(256);
        let (event_tx, event_rx) = mpsc::channel::<RealtimeEvent>(256);
        let connected = Arc::new(AtomicBool::new(true));
        let dropped_frames = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let driver = Driver {
            config: config.clone(),
            opts,
            audio_rx,
            event_tx,
            connected: Arc::clone(&connected),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(driver.run(socket));

        Ok((
            Self {
                audio_tx,
                connected,
                dropped_frames,
                shutdown,
            },
            event_rx,
        ))
    }

    /// Append carrier audio to the model's input buffer. No-op when the
    /// session is not connected. Frames are dropped rather than buffered
    /// when the socket cannot keep up.
    pub fn send_audio(&self, mulaw: &[u8]) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        if self.audio_tx.try_send(mulaw.to_vec()).is_err() {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped == 1 || dropped % 100 == 0 {
                tracing::warn!(dropped, "Realtime socket backlogged, dropping audio frames");
            }
        }
    }

    /// Tear the session down. Idempotent.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.connected.store(false, Ordering::Relaxed);
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connect the WebSocket, send session.update, and wait for the server ack.
async fn open_and_configure(
    config: &RealtimeConfig,
    opts: &SessionOptions,
) -> Result<WsStream, RealtimeError> {
    let url = format!("{}?model={}", config.url, config.model);
    let mut request = url
        .clone()
        .into_client_request()
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", config.api_key)
            .parse()
            .map_err(|_| RealtimeError::Connect("invalid API key header".into()))?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", "realtime=v1".parse().expect("static header"));

    let (mut socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
        .await
        .map_err(|_| RealtimeError::Connect(format!("timed out connecting to {url}")))?
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;

    let update = session_update_payload(config, opts);
    socket
        .send(Message::Text(update.to_string().into()))
        .await
        .map_err(|e| RealtimeError::Handshake(e.to_string()))?;

    // Trigger the first assistant response only after the server confirms
    // our configuration, otherwise the model starts generating under default
    // instructions and resets mid-utterance.
    match tokio::time::timeout(SESSION_ACK_TIMEOUT, wait_for_ack(&mut socket)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            tracing::warn!("No session.updated ack within 5s, proceeding anyway");
        }
    }

    if opts.mode == RealtimeMode::Conversation {
        let mut response = serde_json::json!({ "type": "response.create" });
        if let Some(ref opening) = opts.opening_instruction {
            response["response"] = serde_json::json!({ "instructions": opening });
        }
        socket
            .send(Message::Text(response.to_string().into()))
            .await
            .map_err(|e| RealtimeError::Handshake(e.to_string()))?;
    }

    Ok(socket)
}

async fn wait_for_ack(socket: &mut WsStream) -> Result<(), RealtimeError> {
    while let Some(msg) = socket.next().await {
        let msg = msg.map_err(|e| RealtimeError::Handshake(e.to_string()))?;
        if let Message::Text(text) = msg {
            if event_type(&text).as_deref() == Some("session.updated") {
                return Ok(());
            }
        }
    }
    Err(RealtimeError::Handshake(
        "socket closed before session.updated".into(),
    ))
}

fn session_update_payload(config: &RealtimeConfig, opts: &SessionOptions) -> serde_json::Value {
    let mut transcription = serde_json::json!({ "model": "whisper-1" });
    if let Some(ref lang) = opts.language {
        transcription["language"] = serde_json::json!(lang);
    }

    let mut session = serde_json::json!({
        "input_audio_format": "g711_ulaw",
        "input_audio_transcription": transcription,
        "turn_detection": { "type": "server_vad" },
    });

    match opts.mode {
        RealtimeMode::Transcription => {
            session["modalities"] = serde_json::json!(["text"]);
        }
        RealtimeMode::Conversation => {
            session["modalities"] = serde_json::json!(["audio", "text"]);
            session["output_audio_format"] = serde_json::json!("g711_ulaw");
            session["voice"] = serde_json::json!(if opts.voice.is_empty() {
                config.voice.clone()
            } else {
                opts.voice.clone()
            });
            if let Some(ref instructions) = opts.instructions {
                session["instructions"] = serde_json::json!(instructions);
            }
        }
    }

    serde_json::json!({ "type": "session.update", "session": session })
}

struct Driver {
    config: RealtimeConfig,
    opts: SessionOptions,
    audio_rx: mpsc::Receiver<Vec<u8>>,
    event_tx: mpsc::Sender<RealtimeEvent>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Driver {
    async fn run(mut self, first_socket: WsStream) {
        let mut socket = Some(first_socket);
        let mut attempts: u32 = 0;

        loop {
            let current = match socket.take() {
                Some(s) => s,
                None => break,
            };

            let reason = self.pump(current).await;
            self.connected.store(false, Ordering::Relaxed);

            if self.shutdown.is_cancelled() {
                return;
            }

            match self.opts.mode {
                RealtimeMode::Conversation => {
                    tracing::warn!(reason = %reason, "Conversation session lost, not reconnecting");
                    let _ = self
                        .event_tx
                        .send(RealtimeEvent::Disconnected { reason })
                        .await;
                    return;
                }
                RealtimeMode::Transcription => {
                    attempts += 1;
                    if attempts > MAX_RECONNECT_ATTEMPTS {
                        tracing::error!(reason = %reason, "Transcription reconnects exhausted");
                        let _ = self
                            .event_tx
                            .send(RealtimeEvent::Disconnected { reason })
                            .await;
                        return;
                    }

                    let backoff = Duration::from_millis(500 * 2u64.pow(attempts - 1));
                    tracing::warn!(
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "Realtime socket lost, reconnecting"
                    );
                    tokio::time::sleep(backoff).await;

                    match open_and_configure(&self.config, &self.opts).await {
                        Ok(s) => {
                            self.connected.store(true, Ordering::Relaxed);
                            attempts = 0;
                            socket = Some(s);
                        }
                        Err(e) => {
                            tracing::warn!(attempt = attempts, "Reconnect failed: {e}");
                            socket = self.retry_connect(&mut attempts).await;
                            if socket.is_none() {
                                let _ = self
                                    .event_tx
                                    .send(RealtimeEvent::Disconnected {
                                        reason: e.to_string(),
                                    })
                                    .await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn retry_connect(&mut self, attempts: &mut u32) -> Option<WsStream> {
        while *attempts < MAX_RECONNECT_ATTEMPTS {
            *attempts += 1;
            let backoff = Duration::from_millis(500 * 2u64.pow(*attempts - 1));
            tokio::time::sleep(backoff).await;
            if self.shutdown.is_cancelled() {
                return None;
            }
            match open_and_configure(&self.config, &self.opts).await {
                Ok(s) => {
                    self.connected.store(true, Ordering::Relaxed);
                    *attempts = 0;
                    return Some(s);
                }
                Err(e) => {
                    tracing::warn!(attempt = *attempts, "Reconnect failed: {e}");
                }
            }
        }
        None
    }

    /// Drive one socket until it drops. Returns the close reason.
    async fn pump(&mut self, socket: WsStream) -> String {
        let (mut sink, mut stream) = socket.split();
        let mut turn = TurnState::default();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return "closed by owner".into();
                }

                maybe_audio = self.audio_rx.recv() => {
                    let Some(frame) = maybe_audio else {
                        return "audio channel closed".into();
                    };
                    let append = serde_json::json!({
                        "type": "input_audio_buffer.append",
                        "audio": crate::audio::encode_frame(&frame),
                    });
                    if let Err(e) = sink.send(Message::Text(append.to_string().into())).await {
                        return format!("send failed: {e}");
                    }
                }

                ws_msg = stream.next() => {
                    match ws_msg {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_server_event(&text, &mut turn).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return match frame {
                                Some(f) => format!("closed: {} {}", u16::from(f.code), f.reason),
                                None => "closed".into(),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return format!("socket error: {e}"),
                        None => return "socket ended".into(),
                    }
                }
            }
        }
    }

    async fn handle_server_event(&self, text: &str, turn: &mut TurnState) {
        let Some(kind) = event_type(text) else {
            tracing::debug!("Unparseable realtime event, ignoring");
            return;
        };

        match kind.as_str() {
            "input_audio_buffer.speech_started" => {
                // Whatever partial we were holding is stale once the server
                // re-detects speech.
                turn.user_partial.clear();
                self.emit(RealtimeEvent::SpeechStarted).await;
            }
            "conversation.item.input_audio_transcription.delta" => {
                if let Ok(p) = serde_json::from_str::<DeltaPayload>(text) {
                    turn.user_partial.push_str(&p.delta);
                    self.emit(RealtimeEvent::UserPartial(turn.user_partial.clone()))
                        .await;
                }
            }
            "conversation.item.input_audio_transcription.completed" => {
                if let Ok(p) = serde_json::from_str::<TranscriptPayload>(text) {
                    turn.user_partial.clear();
                    self.emit(RealtimeEvent::UserFinal {
                        transcript: p.transcript,
                        confidence: p.confidence,
                    })
                    .await;
                }
            }
            "response.audio.delta" => {
                if let Ok(p) = serde_json::from_str::<DeltaPayload>(text) {
                    if let Ok(bytes) = crate::audio::decode_frame(&p.delta) {
                        self.emit(RealtimeEvent::AssistantAudio(bytes)).await;
                    }
                }
            }
            "response.audio_transcript.delta" => {
                if let Ok(p) = serde_json::from_str::<DeltaPayload>(text) {
                    turn.assistant_partial.push_str(&p.delta);
                    self.emit(RealtimeEvent::AssistantPartial(
                        turn.assistant_partial.clone(),
                    ))
                    .await;
                }
            }
            "response.audio_transcript.done" => {
                // The assistant final fires here and only here. response.done
                // repeats the same text and must not emit a second final.
                if let Ok(p) = serde_json::from_str::<TranscriptPayload>(text) {
                    turn.assistant_partial.clear();
                    self.emit(RealtimeEvent::AssistantFinal(p.transcript)).await;
                }
            }
            "response.done" | "session.updated" | "session.created" => {}
            "error" => {
                tracing::warn!("Realtime server error event: {text}");
            }
            _ => {
                tracing::trace!(kind = %kind, "Ignoring realtime event");
            }
        }
    }

    async fn emit(&self, event: RealtimeEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Realtime event receiver gone");
        }
    }
}

#[derive(Default)]
struct TurnState {
    user_partial: String,
    assistant_partial: String,
}

#[derive(Debug, Deserialize)]
struct EventTag {
    #[serde(rename = "type")]
    kind: String,
}

fn event_type(text: &str) -> Option<String> {
    serde_json::from_str::<EventTag>(text).ok().map(|t| t.kind)
}

#[derive(Debug, Deserialize)]
struct DeltaPayload {
    delta: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptPayload {
    transcript: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
}
