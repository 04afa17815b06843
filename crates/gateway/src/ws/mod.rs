// WebSocket surface.
//
// One upgrade endpoint; each accepted socket gets a process-unique address,
// an outbound channel registered with the broadcast layer, and a
// ConnectionSession that routes its inbound frames. The loop also serves the
// heartbeat: ping every HEARTBEAT_INTERVAL_MS, disconnect when no pong
// arrives within HEARTBEAT_TIMEOUT_MS.

pub mod read_receipts;
pub mod session;
pub mod subsystems;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
    routing::get,
    Router,
};
use huntart_common::protocol::Frame;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::broadcast::BroadcastLayer;
use crate::metrics::{self, GatewayMetrics};
use session::ConnectionSession;
use subsystems::SessionServices;

const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
const MAX_FRAME_BYTES: usize = 65_536;

#[derive(Clone)]
pub struct GatewayState {
    pub services: SessionServices,
    pub authenticator: Authenticator,
    pub metrics: Arc<GatewayMetrics>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<GatewayState>) -> String {
    state.metrics.render_prometheus()
}

async fn ws_upgrade(
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let address = format!("ws:{}", Uuid::new_v4());

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<Frame>();
    if let Err(error) = state.services.broadcast.register(&address, outbound_sender).await {
        tracing::error!(error = ?error, address = %address, "failed to register connection");
        return;
    }
    metrics::connection_opened();
    tracing::debug!(address = %address, "connection opened");

    let mut session =
        ConnectionSession::new(address.clone(), state.services.clone(), state.authenticator);

    let mut heartbeat_interval =
        tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset(); // skip immediate first tick
    // Set when a ping goes out, cleared by the pong. The timeout only ever
    // measures an unanswered ping, never the quiet time before the first one.
    let mut pending_ping: Option<Instant> = None;
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if heartbeat_expired(pending_ping, heartbeat_timeout) {
                    tracing::warn!(address = %address, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
                pending_ping.get_or_insert_with(Instant::now);
            }
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Text(raw)) => {
                        if raw.len() > MAX_FRAME_BYTES {
                            let oversized = crate::error::GatewayError::MalformedMessage(
                                format!("frame exceeds {MAX_FRAME_BYTES} bytes"),
                            );
                            if send_frame(&mut socket, &oversized.to_frame()).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let replies = session.handle_raw(&raw).await;
                        let mut send_failed = false;
                        for reply in replies {
                            if send_frame(&mut socket, &reply).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        pending_ping = None;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(Message::Binary(_)) => {
                        tracing::debug!(address = %address, "ignoring binary frame");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    session.on_disconnect().await;
    if let Err(error) = state.services.broadcast.unregister(&address).await {
        tracing::warn!(error = ?error, address = %address, "failed to unregister connection");
    }
    metrics::connection_closed();
    tracing::debug!(address = %address, "connection closed");
}

fn heartbeat_expired(pending_ping: Option<Instant>, timeout: Duration) -> bool {
    pending_ping.is_some_and(|sent_at| sent_at.elapsed() > timeout)
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    // Outbound frames are plain data structs; encoding cannot fail.
    let text = frame.encode().unwrap_or_default();
    socket.send(Message::Text(text.into())).await
}
