//! Metaverse Office Server
//!
//! Runs the WebSocket presence server and the HTTP validation surface
//! side by side until Ctrl-C.

use std::sync::Arc;
use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use metaverse_office::{
    config::ServerConfig,
    network::{
        auth::{IdentityVerifier, JwtVerifier},
        http::{create_router, serve_http, HttpState},
        server::PresenceServer,
    },
    presence::Registry,
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;

    info!("Metaverse Office Server v{}", VERSION);
    info!("WebSocket: ws://{}{}", config.bind_addr, config.ws_path);
    info!("HTTP:      http://{}", config.http_bind_addr);
    if !config.auth.is_configured() {
        warn!("no AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set, every token will be rejected");
    }

    let registry = Arc::new(Registry::new());
    let verifier: Arc<dyn IdentityVerifier> = Arc::new(JwtVerifier::new(config.auth.clone()));

    let router = create_router(
        HttpState {
            registry: registry.clone(),
            verifier: verifier.clone(),
            version: config.version.clone(),
        },
        &config.cors_origins,
    );
    let http_listener = TcpListener::bind(config.http_bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind_addr))?;

    let server = Arc::new(PresenceServer::with_registry(config, registry, verifier));

    let (http_stop_tx, http_stop_rx) = tokio::sync::oneshot::channel::<()>();
    let http = tokio::spawn(serve_http(http_listener, router, async move {
        let _ = http_stop_rx.await;
    }));

    let ws_server = server.clone();
    let mut ws = tokio::spawn(async move { ws_server.run().await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for ctrl-c")?,
        result = &mut ws => {
            result.context("websocket task panicked")??;
            anyhow::bail!("websocket server stopped unexpectedly");
        }
    }
    info!("shutting down");

    server.shutdown();
    let _ = http_stop_tx.send(());

    ws.await.context("websocket task panicked")??;
    http.await.context("http task panicked")??;
    Ok(())
}
