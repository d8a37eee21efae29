use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::call::history::CallHistory;
use crate::call::CallManager;
use crate::config::Config;
use crate::error::BridgeError;
use crate::outcome::{HostClient, OutcomePipeline};
use crate::providers::{
    MockAdapter, PlivoAdapter, Provider, TelnyxAdapter, TwilioAdapter, VoximplantAdapter,
};
use crate::ratelimit::FailureWindow;
use crate::server::{build_router, AppState};
use crate::stream::StreamHub;
use crate::tts::TelephonyTts;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Wire the configured provider, call manager, bridge and outcome pipeline,
/// then serve until ctrl-c. `stop()` semantics (drain + teardown) run on the
/// way out.
pub async fn run(config: Config) -> Result<(), BridgeError> {
    let public_url = resolve_public_url(&config);
    tracing::info!(public_url = %public_url, provider = %config.provider.name, "Starting voice-bridge");

    let provider = Arc::new(build_provider(&config)?);
    provider.set_public_url(&public_url);

    let manager = CallManager::new(
        config.limits.clone(),
        config.streaming.clone(),
        provider_phone_number(&config),
        CallHistory::new(&config.history.path),
    );
    manager.wire_provider(Arc::clone(&provider));

    let hub = StreamHub::new(config.streaming.clone(), config.realtime.clone());
    hub.wire_manager(Arc::clone(&manager));
    hub.wire_provider(Arc::clone(&provider));
    manager.wire_hub(Arc::clone(&hub));

    // In realtime-conversation mode the realtime session owns assistant
    // audio; a separate telephony TTS adapter would fight it for the stream.
    if !(config.streaming.enabled && config.streaming.is_conversation()) {
        match TelephonyTts::from_merged(&config.tts, None) {
            Ok(tts) => manager.wire_tts(Arc::new(tts)),
            Err(e) => {
                tracing::warn!("Telephony TTS unavailable, using provider-native speak: {e}")
            }
        }
    }

    let host = Arc::new(HostClient::new(config.host_runtime.clone()));
    let outcome = Arc::new(OutcomePipeline::new(config.summary.clone(), host));
    manager.set_on_call_ended(Arc::new(move |record| {
        let outcome = Arc::clone(&outcome);
        Box::pin(async move { outcome.run(record).await })
    }));

    let state = AppState {
        config: config.clone(),
        manager: Arc::clone(&manager),
        provider,
        hub,
        hook_limiter: Arc::new(FailureWindow::new()),
        public_url,
    };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| BridgeError::ConfigInvalid(format!("invalid server address: {e}")))?;

    tracing::info!(%addr, "Listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| BridgeError::ConfigInvalid(format!("failed to bind {addr}: {e}")))?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            shutdown_signal.cancel();
        }
    });

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { serve_shutdown.cancelled().await })
        .await
        .map_err(|e| BridgeError::Internal(format!("server error: {e}")))?;

    stop(&manager).await;
    Ok(())
}

/// Drain in-flight calls before the process exits. The tunnel (when used) is
/// externally managed, so there is nothing to tear down beyond the calls and
/// the already-closed listener.
async fn stop(manager: &Arc<CallManager>) {
    let active = manager.active_calls().await;
    if active.is_empty() {
        return;
    }

    tracing::info!(count = active.len(), "Draining in-flight calls");
    for record in &active {
        if let Err(e) = manager.end_call(&record.call_id).await {
            tracing::warn!(call_id = %record.call_id, "Failed to end call during drain: {e}");
        }
    }

    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        if manager.active_calls().await.is_empty() {
            tracing::info!("All calls drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!("Drain timeout, exiting with calls still active");
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

fn build_provider(config: &Config) -> Result<Provider, BridgeError> {
    let skip = config.provider.skip_signature_verification;
    let webhook_path = &config.server.webhook_path;
    let stream_path = &config.streaming.stream_path;
    let control_timeout = config.limits.control_timeout_ms;

    Ok(match config.provider.name.as_str() {
        "twilio" => Provider::Twilio(TwilioAdapter::new(
            config.twilio.clone().unwrap_or_default(),
            skip,
            webhook_path,
            stream_path,
            control_timeout,
        )),
        "telnyx" => Provider::Telnyx(TelnyxAdapter::new(
            config.telnyx.clone().unwrap_or_default(),
            skip,
            stream_path,
            control_timeout,
        )),
        "plivo" => Provider::Plivo(PlivoAdapter::new(
            config.plivo.clone().unwrap_or_default(),
            skip,
            webhook_path,
            stream_path,
            control_timeout,
        )),
        "voximplant" => Provider::Voximplant(VoximplantAdapter::new(
            config.voximplant.clone().unwrap_or_default(),
            skip,
            stream_path,
            control_timeout,
        )),
        "mock" => Provider::Mock(MockAdapter::new()),
        other => {
            return Err(BridgeError::ConfigInvalid(format!(
                "unknown provider {other:?}"
            )))
        }
    })
}

fn provider_phone_number(config: &Config) -> String {
    match config.provider.name.as_str() {
        "twilio" => config
            .twilio
            .as_ref()
            .map(|t| t.phone_number.clone())
            .unwrap_or_default(),
        "telnyx" => config
            .telnyx
            .as_ref()
            .map(|t| t.phone_number.clone())
            .unwrap_or_default(),
        "plivo" => config
            .plivo
            .as_ref()
            .map(|p| p.phone_number.clone())
            .unwrap_or_default(),
        "voximplant" => config
            .voximplant
            .as_ref()
            .map(|v| v.phone_number.clone())
            .unwrap_or_default(),
        _ => "mock".to_string(),
    }
}

/// Public URL priority: explicit config, then externally managed tunnel,
/// then LAN exposure, then the local bind address.
pub fn resolve_public_url(config: &Config) -> String {
    if let Some(ref url) = config.server.public_url {
        return url.trim_end_matches('/').to_string();
    }
    if let Some(ref tunnel) = config.tunnel {
        tracing::info!(url = %tunnel.url, "Using tunnel public URL");
        return tunnel.url.trim_end_matches('/').to_string();
    }
    if config.server.expose_lan {
        if let Some(ip) = lan_ip() {
            return format!("http://{ip}:{}", config.server.port);
        }
        tracing::warn!("LAN exposure requested but no LAN address found");
    }
    config.local_url()
}

/// Best-effort LAN address: the source address of an outbound UDP socket.
/// No packets are sent.
fn lan_ip() -> Option<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_loopback() {
        None
    } else {
        Some(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;

    fn base_config() -> Config {
        toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 3100

            [provider]
            name = "mock"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn explicit_public_url_wins() {
        let mut config = base_config();
        config.server.public_url = Some("https://voice.example.com/".into());
        config.tunnel = Some(TunnelConfig {
            url: "https://tunnel.example.com".into(),
        });
        assert_eq!(resolve_public_url(&config), "https://voice.example.com");
    }

    #[test]
    fn tunnel_beats_local() {
        let mut config = base_config();
        config.tunnel = Some(TunnelConfig {
            url: "https://tunnel.example.com".into(),
        });
        assert_eq!(resolve_public_url(&config), "https://tunnel.example.com");
    }

    #[test]
    fn falls_back_to_local_url() {
        let config = base_config();
        assert_eq!(resolve_public_url(&config), "http://127.0.0.1:3100");
    }

    #[test]
    fn mock_provider_builds() {
        let provider = build_provider(&base_config()).unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn unknown_provider_is_config_error() {
        let mut config = base_config();
        config.provider.name = "semaphore".into();
        assert!(matches!(
            build_provider(&config),
            Err(BridgeError::ConfigInvalid(_))
        ));
    }
}
