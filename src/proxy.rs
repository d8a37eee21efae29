use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message as ClientMessage, WebSocket};
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;

use crate::config::ProxyConfig;

const PROXY_TIMEOUT: Duration = Duration::from_secs(30);
const BAD_GATEWAY_BODY: &str = "Bad Gateway";

/// Optional WebSocket upgrade extractor.
///
/// `axum` 0.8 no longer provides a blanket `FromRequestParts` impl for
/// `Option<T>`, so this adapts `WebSocketUpgrade` the same way the removed
/// blanket impl did: a failed extraction yields `None` instead of
/// rejecting the request.
pub(crate) struct MaybeWebSocketUpgrade(Option<WebSocketUpgrade>);

impl<S> FromRequestParts<S> for MaybeWebSocketUpgrade
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeWebSocketUpgrade(
            WebSocketUpgrade::from_request_parts(parts, state).await.ok(),
        ))
    }
}

/// Path-prefixed proxy to an upstream HTTP service, with a WS splice for
/// upgrade requests.
#[derive(Clone)]
pub struct ProxyState {
    config: ProxyConfig,
    client: reqwest::Client,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_path(&self) -> &str {
        &self.config.base_path
    }

    fn upstream_authority(&self) -> String {
        format!("{}:{}", self.config.upstream_host, self.config.upstream_port)
    }
}

/// Forward one request under the proxy prefix. WS upgrades are spliced to
/// the upstream; plain HTTP preserves method, body and headers (with Host
/// overridden). Every failure collapses into a quiet fixed 502.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    MaybeWebSocketUpgrade(ws): MaybeWebSocketUpgrade,
    request: Request,
) -> Response {
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if let Some(ws) = ws {
        let upstream_url = format!("ws://{}{}", state.upstream_authority(), path_and_query);
        return ws.on_upgrade(move |socket| splice_websocket(socket, upstream_url));
    }

    match forward_http(&state, request, &path_and_query).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(upstream = %state.upstream_authority(), "Proxy error: {e}");
            (StatusCode::BAD_GATEWAY, BAD_GATEWAY_BODY).into_response()
        }
    }
}

async fn forward_http(
    state: &ProxyState,
    request: Request,
    path_and_query: &str,
) -> Result<Response, String> {
    let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
        .map_err(|e| e.to_string())?;
    let url = format!("http://{}{}", state.upstream_authority(), path_and_query);

    let headers = request.headers().clone();
    let body = axum::body::to_bytes(request.into_body(), 2 * 1024 * 1024)
        .await
        .map_err(|e| e.to_string())?;

    let mut upstream = state
        .client
        .request(method, &url)
        .timeout(PROXY_TIMEOUT)
        .body(body.to_vec());

    for (name, value) in filtered_headers(&headers) {
        upstream = upstream.header(name, value);
    }
    upstream = upstream.header("host", state.upstream_authority());

    let resp = upstream.send().await.map_err(|e| e.to_string())?;

    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in resp.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
    builder
        .body(Body::from(bytes))
        .map_err(|e| e.to_string())
}

/// Request headers worth forwarding: everything except hop-by-hop headers
/// and Host (which is overridden).
fn filtered_headers(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "host" && !is_hop_by_hop(name)
        })
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect()
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "sec-websocket-key"
            | "sec-websocket-version"
            | "sec-websocket-extensions"
    )
}

/// Bidirectional relay between the accepted client socket and a fresh
/// upstream WS connection. A refused upgrade closes the client.
async fn splice_websocket(client: WebSocket, upstream_url: String) {
    let (upstream, _) = match connect_async(&upstream_url).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(upstream = %upstream_url, "Upstream WS refused: {e}");
            // The non-upgrade upstream response reaches the client only as a
            // close; the handshake already consumed the 101 on our side.
            let mut client = client;
            let _ = client.send(ClientMessage::Close(None)).await;
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                ClientMessage::Text(text) => UpstreamMessage::Text(text.as_str().into()),
                ClientMessage::Binary(bin) => UpstreamMessage::Binary(bin.to_vec().into()),
                ClientMessage::Ping(data) => UpstreamMessage::Ping(data.to_vec().into()),
                ClientMessage::Pong(data) => UpstreamMessage::Pong(data.to_vec().into()),
                ClientMessage::Close(_) => break,
            };
            if upstream_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = upstream_tx.send(UpstreamMessage::Close(None)).await;
    };

    let to_client = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            let forwarded = match msg {
                UpstreamMessage::Text(text) => ClientMessage::Text(text.as_str().into()),
                UpstreamMessage::Binary(bin) => ClientMessage::Binary(bin.to_vec().into()),
                UpstreamMessage::Ping(data) => ClientMessage::Ping(data.to_vec().into()),
                UpstreamMessage::Pong(data) => ClientMessage::Pong(data.to_vec().into()),
                UpstreamMessage::Close(_) => break,
                UpstreamMessage::Frame(_) => continue,
            };
            if client_tx.send(forwarded).await.is_err() {
                break;
            }
        }
        let _ = client_tx.send(ClientMessage::Close(None)).await;
    };

    tokio::join!(to_upstream, to_client);
    tracing::debug!(upstream = %upstream_url, "WS splice finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("transfer-encoding", "chunked".parse().unwrap());
        headers.insert("host", "original.example.com".parse().unwrap());
        headers.insert("x-custom", "kept".parse().unwrap());
        headers.insert("authorization", "Bearer tok".parse().unwrap());

        let forwarded = filtered_headers(&headers);
        let names: Vec<&str> = forwarded.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"x-custom"));
        assert!(names.contains(&"authorization"));
        assert!(!names.contains(&"host"));
        assert!(!names.contains(&"connection"));
        assert!(!names.contains(&"transfer-encoding"));
    }

    #[test]
    fn upstream_authority_formats_host_port() {
        let state = ProxyState::new(ProxyConfig {
            base_path: "/app".into(),
            upstream_host: "127.0.0.1".into(),
            upstream_port: 8188,
        });
        assert_eq!(state.upstream_authority(), "127.0.0.1:8188");
        assert_eq!(state.base_path(), "/app");
    }
}
