use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::call::{CallManager, CallMode, InitiateOptions};
use crate::config::Config;
use crate::error::BridgeError;
use crate::providers::{now_ms, Provider, WebhookContext, WebhookParse, WebhookReply};
use crate::proxy::{proxy_handler, ProxyState};
use crate::ratelimit::{Decision, FailureWindow};
use crate::stream::StreamHub;

const INTERNAL_ERROR_BODY: &str = "Internal Server Error";

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub manager: Arc<CallManager>,
    pub provider: Arc<Provider>,
    pub hub: Arc<StreamHub>,
    pub hook_limiter: Arc<FailureWindow>,
    pub public_url: String,
}

pub fn build_router(state: AppState) -> Router {
    let webhook_path = state.config.server.webhook_path.clone();
    let stream_path = state.config.streaming.stream_path.clone();
    let proxy = state.config.proxy.clone();

    let mut router = Router::new()
        .route(&webhook_path, post(handle_webhook))
        .route(&stream_path, get(handle_stream_upgrade))
        .route("/api/call", post(api_call))
        .route("/api/continue", post(api_continue))
        .route("/api/speak", post(api_speak))
        .route("/api/end", post(api_end))
        .route("/api/status", get(api_status))
        .route("/hooks/wake", post(handle_wake_hook))
        .route("/health", get(health))
        .with_state(state);

    if let Some(proxy_config) = proxy {
        let base = proxy_config.base_path.trim_end_matches('/').to_string();
        let proxy_state = ProxyState::new(proxy_config);
        router = router
            .route(&base, any(proxy_handler).with_state(proxy_state.clone()))
            .route(
                &format!("{base}/{{*rest}}"),
                any(proxy_handler).with_state(proxy_state),
            );
    }

    router.layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

/// POST <webhook_path> — carrier callbacks.
///
/// The raw body is handed to the adapter for signature verification before
/// any parsing; unverified payloads never reach the event parser.
async fn handle_webhook(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| state.config.server.webhook_path.clone());

    let ctx = WebhookContext {
        method: "POST".to_string(),
        url: format!("{}{}", state.public_url.trim_end_matches('/'), path_and_query),
        headers: lowercase_headers(&headers),
        body,
    };

    if let Err(e) = state.provider.verify_webhook(&ctx) {
        tracing::warn!("Webhook rejected: {e}");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    let WebhookParse { events, reply } = match state.provider.parse_webhook_event(&ctx) {
        Ok(parse) => parse,
        Err(e) => {
            tracing::warn!("Webhook parse failed: {e}");
            let status = e.http_status();
            return if status.is_server_error() {
                (status, INTERNAL_ERROR_BODY).into_response()
            } else {
                (status, e.to_string()).into_response()
            };
        }
    };

    // Events for one call are applied in arrival order.
    for event in events {
        state.manager.apply_event(event).await;
    }

    match reply {
        WebhookReply::Empty => StatusCode::OK.into_response(),
        WebhookReply::Xml(xml) => {
            ([("Content-Type", "text/xml")], xml).into_response()
        }
        WebhookReply::Json(value) => Json(value).into_response(),
    }
}

/// WS UPGRADE <stream_path> — carrier media streams, handled by the bridge.
async fn handle_stream_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let token = params.get("token").cloned();
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| hub.handle_socket(socket, token))
}

// Control API --------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    /// E.164 number to dial.
    pub to: String,
    pub prompt: String,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    /// "notify" (default) or "conversation".
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub message_to: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CallResponse {
    success: bool,
    call_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

fn error_response(e: &BridgeError) -> Response {
    (
        e.http_status(),
        Json(ErrorResponse {
            success: false,
            error: e.to_string(),
        }),
    )
        .into_response()
}

async fn api_call(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CallRequest>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.server.api_token) {
        return resp;
    }

    tracing::info!(to = %req.to, "Outbound call requested");

    let mode = match req.mode.as_deref() {
        Some("conversation") => CallMode::Conversation,
        _ => CallMode::Notify,
    };

    let result = state
        .manager
        .initiate_call(
            &req.to,
            req.session_key,
            InitiateOptions {
                prompt: req.prompt,
                objective: req.objective,
                context: req.context,
                language: req.language,
                mode,
                message_to: req.message_to,
            },
        )
        .await;

    match result {
        Ok(call_id) => Json(CallResponse {
            success: true,
            call_id,
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Failed to initiate call: {e}");
            error_response(&e)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContinueRequest {
    call_id: String,
    message: String,
}

async fn api_continue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ContinueRequest>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.server.api_token) {
        return resp;
    }

    match state.manager.continue_call(&req.call_id, &req.message).await {
        Ok(transcript) => Json(serde_json::json!({
            "success": true,
            "transcript": transcript,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpeakRequest {
    call_id: String,
    text: String,
}

async fn api_speak(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SpeakRequest>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.server.api_token) {
        return resp;
    }

    match state.manager.speak(&req.call_id, &req.text).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndRequest {
    call_id: String,
}

async fn api_end(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<EndRequest>,
) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.server.api_token) {
        return resp;
    }

    match state.manager.end_call(&req.call_id).await {
        Ok(()) => Json(serde_json::json!({ "success": true })).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn api_status(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&headers, &state.config.server.api_token) {
        return resp;
    }

    let active = state.manager.active_calls().await;
    let history = state.manager.call_history(state.config.history.limit);

    Json(serde_json::json!({
        "success": true,
        "provider": state.provider.name(),
        "publicUrl": state.public_url,
        "activeCalls": active,
        "history": history,
    }))
    .into_response()
}

/// POST /hooks/wake — auxiliary wake-up hook with a fixed-window auth
/// failure limit per client key.
async fn handle_wake_hook(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let key = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "local".to_string());

    match state.hook_limiter.check(&key, now_ms()) {
        Decision::Throttle { retry_after_secs } => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_after_secs.to_string())],
                "Too Many Requests",
            )
                .into_response();
        }
        Decision::Allow => {}
    }

    if check_auth(&headers, &state.config.server.api_token).is_err() {
        state.hook_limiter.record_failure(&key, now_ms());
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    state.hook_limiter.record_success(&key);
    Json(serde_json::json!({ "ok": true })).into_response()
}

/// Bearer-token check shared by the control API endpoints.
#[allow(clippy::result_large_err)]
pub fn check_auth(headers: &HeaderMap, expected_token: &str) -> Result<(), Response> {
    if expected_token.is_empty() {
        tracing::warn!("API token not configured — rejecting request");
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                success: false,
                error: "API token not configured".to_string(),
            }),
        )
            .into_response());
    }

    let provided = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if crate::stream::token::token_matches(token, expected_token) => Ok(()),
        _ => {
            tracing::warn!("Unauthorized API request");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    success: false,
                    error: "Invalid or missing bearer token".to_string(),
                }),
            )
                .into_response())
        }
    }
}

fn lowercase_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}
