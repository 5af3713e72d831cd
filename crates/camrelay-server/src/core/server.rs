use std::net::SocketAddr;

use anyhow::{Context, Result};
use camrelay_proto::{Outbound, close};
use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, sleep, timeout};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{info, warn};

use super::registry::{Registry, Role};
use super::session::{close_message, run_session};
use super::unix_time;
use crate::app::AppState;

/// How long shutdown waits for sessions to finish their close handshakes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Viewer,
    Producer,
    Worker,
}

/// Classifies a request path by substring, in declaration order.
fn classify_endpoint(path: &str) -> Option<Endpoint> {
    if path.contains("/browser") {
        Some(Endpoint::Viewer)
    } else if path.contains("/pi") {
        Some(Endpoint::Producer)
    } else if path.contains("/wsl") {
        Some(Endpoint::Worker)
    } else {
        None
    }
}

/// Binds the listener and runs the accept loop until shutdown, then closes
/// every live session.
pub async fn run_ws_server(
    listen: &str,
    state: AppState,
) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind websocket listener on {listen}"))?;

    info!("websocket server listening: listen={listen}");
    serve(listener, state).await
}

pub(crate) async fn serve(
    listener: TcpListener,
    state: AppState,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("tcp accept failed")?;
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, state).await {
                        warn!("connection handling failed: peer={}, error={}", peer, err);
                    }
                });
            }
        }
    }

    shutdown_sessions(&state).await;
    Ok(())
}

/// Completes the WebSocket handshake (capturing the request path), applies
/// endpoint routing and viewer rate limiting, and hands the socket to its
/// session. Policy violations close with 1008 after the handshake so the
/// code actually reaches the peer.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: AppState,
) -> Result<()> {
    let mut request_path = None;
    let capture_path = |request: &Request, response: Response| {
        request_path = Some(request.uri().path().to_string());
        Ok(response)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(state.config.max_message_bytes);
    ws_config.max_frame_size = Some(state.config.max_message_bytes);

    let mut ws = accept_hdr_async_with_config(stream, capture_path, Some(ws_config))
        .await
        .context("websocket handshake failed")?;

    let path = request_path.unwrap_or_else(|| "/".to_string());
    info!("new connection: peer={}, path={}", peer, path);

    let endpoint = match classify_endpoint(&path) {
        Some(endpoint) => endpoint,
        None => {
            warn!("unsupported endpoint: peer={}, path={}", peer, path);
            let _ = ws
                .send(close_message(CloseCode::Policy, close::UNSUPPORTED_ENDPOINT))
                .await;
            return Ok(());
        }
    };

    match endpoint {
        Endpoint::Viewer => {
            if !state.limiter.admit(peer.ip()) {
                warn!("connection rate limit applied: ip={}", peer.ip());
                let error = Outbound::Error {
                    error: close::RATE_LIMITED.to_string(),
                    timestamp: unix_time(),
                };
                if let Ok(text) = error.to_text() {
                    let _ = ws.send(Message::Text(text)).await;
                }
                let _ = ws
                    .send(close_message(CloseCode::Policy, close::RATE_LIMITED))
                    .await;
                return Ok(());
            }
            run_session(ws, Role::Viewer, peer, state).await
        }
        Endpoint::Producer => run_session(ws, Role::Producer, peer, state).await,
        Endpoint::Worker => run_session(ws, Role::Worker, peer, state).await,
    }
}

/// Sends Close 1001 to every peer, then waits up to the drain timeout for
/// the registry to empty.
async fn shutdown_sessions(state: &AppState) {
    let senders = state.registry.all_senders();
    info!("closing sessions: count={}", senders.len());

    for sender in senders {
        let _ = sender.try_send(close_message(CloseCode::Away, close::SHUTTING_DOWN));
    }

    if timeout(DRAIN_TIMEOUT, wait_for_drain(&state.registry)).await.is_err() {
        warn!("timeout waiting for sessions to close");
    }
}

async fn wait_for_drain(registry: &Registry) {
    while !registry.is_empty() {
        sleep(Duration::from_millis(50)).await;
    }
}
