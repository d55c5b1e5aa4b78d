//! WebSocket Presence Server
//!
//! Accepts WebSocket connections, runs one [`Session`] per connection and
//! reaps idle rooms in the background.
//!
//! Each connection gets two tasks: a reader driving the session state
//! machine and a writer draining the outbound queue onto the socket. The
//! writer also sends heartbeat pings; the reader closes connections that
//! stay silent past the idle timeout or whose queue stays full past the
//! send timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::network::auth::IdentityVerifier;
use crate::network::protocol::ServerMessage;
use crate::network::session::{Flow, Session, SessionConfig};
use crate::presence::player::Outbound;
use crate::presence::registry::Registry;

/// How long a finished connection may spend flushing its queue.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decrements the live connection count when a connection task ends.
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The presence server.
pub struct PresenceServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    verifier: Arc<dyn IdentityVerifier>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl PresenceServer {
    /// Create a server with its own registry.
    pub fn new(config: ServerConfig, verifier: Arc<dyn IdentityVerifier>) -> Self {
        Self::with_registry(config, Arc::new(Registry::new()), verifier)
    }

    /// Create a server over an existing registry, shared with the HTTP surface.
    pub fn with_registry(
        config: ServerConfig,
        registry: Arc<Registry>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            verifier,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Shared room registry.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Create the configured private rooms.
    pub async fn init_private_rooms(&self) {
        for (room_id, allowed) in &self.config.private_rooms {
            self.registry.create_private_room(room_id, allowed.iter().cloned()).await;
            info!(room_id = %room_id, allowed = allowed.len(), "private room created");
        }
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr).await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("presence server listening on {}{}", listener.local_addr()?, self.config.ws_path);
        self.init_private_rooms().await;

        let reaper = tokio::spawn(Self::run_reaper(
            self.registry.clone(),
            self.config.reap_interval,
            self.config.room_idle_ttl,
        ));

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::SeqCst) >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        reaper.abort();
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        self.connections.fetch_add(1, Ordering::SeqCst);
        let guard = ConnectionGuard(self.connections.clone());

        let registry = self.registry.clone();
        let verifier = self.verifier.clone();
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let span = info_span!("connection", conn_id = %Uuid::new_v4(), %addr);

        tokio::spawn(async move {
            let _guard = guard;

            let ws_path = config.ws_path.clone();
            let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                if req.uri().path() == ws_path {
                    Ok(resp)
                } else {
                    let mut reject = ErrorResponse::new(Some("not found".to_string()));
                    *reject.status_mut() = StatusCode::NOT_FOUND;
                    Err(reject)
                }
            };

            let ws_stream = match accept_hdr_async(stream, check_path).await {
                Ok(ws) => ws,
                Err(e) => {
                    debug!("websocket handshake failed: {}", e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(config.outbound_queue);

            let outbound = Outbound::new(msg_tx, config.send_timeout);
            let kick = outbound.kick_signal();
            let mut session = Session::new(
                registry,
                verifier,
                outbound,
                SessionConfig { max_auth_attempts: config.max_auth_attempts },
            );

            let heartbeat_every = config.heartbeat_interval;
            let writer = tokio::spawn(async move {
                let mut heartbeat = interval(heartbeat_every);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                heartbeat.tick().await;

                loop {
                    tokio::select! {
                        msg = msg_rx.recv() => {
                            let Some(msg) = msg else {
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            };
                            let text = match msg.to_json() {
                                Ok(t) => t,
                                Err(e) => {
                                    error!("failed to serialize {}: {}", msg.kind(), e);
                                    continue;
                                }
                            };
                            if ws_sender.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        _ = heartbeat.tick() => {
                            if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }.in_current_span());

            loop {
                tokio::select! {
                    frame = timeout(config.idle_timeout, ws_receiver.next()) => {
                        let flow = match frame {
                            Err(_) => {
                                info!("idle timeout");
                                break;
                            }
                            Ok(Some(Ok(Message::Text(text)))) => session.handle_text(&text).await,
                            Ok(Some(Ok(Message::Binary(data)))) => session.handle_binary(&data).await,
                            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                                debug!("client disconnected");
                                break;
                            }
                            Ok(Some(Err(e))) => {
                                warn!("websocket error: {}", e);
                                break;
                            }
                            // Pings are answered by tungstenite; pongs only refresh the idle timer.
                            Ok(Some(Ok(_))) => Flow::Continue,
                        };
                        if flow == Flow::Close {
                            break;
                        }
                    }
                    _ = kick.notified() => {
                        warn!("outbound queue stalled, dropping connection");
                        break;
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }

            let player = session.player().map(|p| p.id());
            session.close().await;
            drop(session);

            // Senders are gone once the session is dropped; let the writer flush.
            let abort = writer.abort_handle();
            if timeout(WRITER_DRAIN, writer).await.is_err() {
                abort.abort();
            }

            match player {
                Some(id) => info!(player_id = %id, "connection cleaned up"),
                None => debug!("connection cleaned up"),
            }
        }.instrument(span));
    }

    async fn run_reaper(registry: Arc<Registry>, every: Duration, ttl: Duration) {
        let mut ticker = interval(every);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle_rooms(ttl).await;
            if !reaped.is_empty() {
                debug!(?reaped, "idle rooms removed");
            }
        }
    }

    /// Signal shutdown. Open connections leave their rooms and close.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Rooms currently in the registry.
    pub async fn room_count(&self) -> usize {
        self.registry.room_count().await
    }
}
