//! Relay HTTP Server
//!
//! Axum server exposing the WebSocket endpoint plus health endpoints, with
//! request tracing and graceful shutdown.
//!
//! ```text
//! GET /ws        → WebSocket upgrade (token via subprotocol or ?token=)
//! GET /health    → Health check (JSON)
//! GET /healthz   → Liveness
//! ```
//!
//! Each accepted socket runs as an actor: a writer task drains the
//! connection's outbound queue into the socket and pings the peer, closing it
//! when a pong is overdue, while the reader loop feeds text frames to the
//! [`Dispatcher`] one at a time. Whichever side stops first ends the
//! connection and unregisters it.

use axum::{
    body::Bytes,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::{Json, Response},
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::auth::{CredentialSource, Handshake};
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::protocol::OutboundFrame;

/// Ping cadence and how long a peer may take to answer
#[derive(Debug, Clone, Copy)]
pub struct KeepAlive {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for KeepAlive {
    fn from(config: &Config) -> Self {
        Self {
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
        }
    }
}

/// Shared state for handlers
#[derive(Clone)]
pub struct RelayState {
    pub dispatcher: Dispatcher,
    pub keep_alive: KeepAlive,
    pub start_time: Instant,
}

/// Deprecated credential channel: `/ws?token=...`
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub connections: usize,
    pub timestamp: String,
}

/// Build the relay router
pub fn build_router(dispatcher: Dispatcher, keep_alive: KeepAlive, log_requests: bool) -> Router {
    let state = Arc::new(RelayState {
        dispatcher,
        keep_alive,
        start_time: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers([header::CONTENT_TYPE]);

    let router = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(cors));

    if log_requests {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Relay server
pub struct RelayServer {
    config: Config,
    dispatcher: Dispatcher,
}

impl RelayServer {
    pub fn new(config: Config, dispatcher: Dispatcher) -> Self {
        Self { config, dispatcher }
    }

    /// Listen until a shutdown signal arrives
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let router = build_router(
            self.dispatcher,
            KeepAlive::from(&self.config),
            self.config.log_requests,
        );

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Relay listening on ws://{}/ws", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Relay server shut down gracefully");
        Ok(())
    }
}

/// GET /ws
async fn ws_upgrade(
    State(state): State<Arc<RelayState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let protocols = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let handshake = Handshake::new(protocols, query.token);

    // Browsers drop the socket unless the offered protocol is echoed back
    let ws = match handshake.credential() {
        Some(credential) if credential.source == CredentialSource::Subprotocol => {
            ws.protocols([credential.token])
        }
        _ => ws,
    };

    let dispatcher = state.dispatcher.clone();
    let keep_alive = state.keep_alive;
    ws.on_upgrade(move |socket| run_connection(socket, dispatcher, handshake, keep_alive))
}

/// Drive one WebSocket from open to close
pub async fn run_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    handshake: Handshake,
    keep_alive: KeepAlive,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();

    let id = match dispatcher.open(&handshake, tx).await {
        Ok(id) => id,
        Err(e) => {
            // Flush the error frame queued by the dispatcher, then close
            while let Ok(frame) = rx.try_recv() {
                let _ = ws_sender.send(Message::Text(frame.to_json().into())).await;
            }
            let _ = ws_sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();
    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx, pong_rx, keep_alive));

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    dispatcher.handle_frame(id, text.as_str()).await;
                }
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => {
                        dispatcher.handle_frame(id, text).await;
                    }
                    Err(_) => debug!(connection_id = %id, "Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Pong(_))) => {
                    let _ = pong_tx.send(());
                }
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection_id = %id, reason = ?frame, "Client initiated close");
                    break;
                }
                Some(Err(e)) => {
                    warn!(connection_id = %id, error = %e, "WebSocket receive error");
                    break;
                }
                None => break,
            },
            _ = &mut writer_handle => {
                debug!(connection_id = %id, "Writer stopped, dropping connection");
                break;
            }
        }
    }

    dispatcher.close(id);
    writer_handle.abort();
}

/// Forward queued frames to the socket, ping periodically and give up on a
/// peer whose pong is overdue
async fn writer_task(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut pong_rx: mpsc::UnboundedReceiver<()>,
    keep_alive: KeepAlive,
) {
    let mut ping_timer = interval(keep_alive.ping_interval);
    // Skip the first immediate tick
    ping_timer.tick().await;

    // Set while a ping is unanswered
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let overdue = async move {
            match pong_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if ws_sender.send(Message::Text(frame.to_json().into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            },
            Some(()) = pong_rx.recv() => {
                pong_deadline = None;
            }
            _ = ping_timer.tick() => {
                if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                pong_deadline.get_or_insert_with(|| Instant::now() + keep_alive.pong_timeout);
            }
            _ = overdue => {
                warn!("Pong timeout, closing connection");
                let close = Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "Pong timeout".into(),
                }));
                let _ = timeout(keep_alive.pong_timeout, ws_sender.send(close)).await;
                break;
            }
        }
    }
}

/// GET /health
async fn health_check(State(state): State<Arc<RelayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connections: state.dispatcher.registry().len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// GET /healthz
async fn liveness() -> StatusCode {
    StatusCode::OK
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtVerifier;
    use crate::bot::DisabledBot;
    use crate::store::SqliteStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let store = Arc::new(SqliteStore::open_in_memory("bot@local").unwrap());
        let dispatcher = Dispatcher::new(
            Arc::new(JwtVerifier::new(b"test-secret-at-least-32-characters-long")),
            store.clone(),
            store,
            Arc::new(DisabledBot),
        );
        build_router(dispatcher, KeepAlive::default(), false)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let response = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"], 0);
        assert!(json["uptime_secs"].is_number());
    }

    #[tokio::test]
    async fn test_liveness_endpoint() {
        let response = test_router()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ws_requires_upgrade() {
        let response = test_router()
            .oneshot(Request::builder().uri("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }
}
