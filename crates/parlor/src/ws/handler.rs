//! WebSocket handler for client connections.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        RawQuery, State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::relay::{ConnectionState, Relay, Session};
use super::types::OutboundEvent;
use crate::api::AppState;
use crate::auth::{AuthError, Identity, credential_from_request};

/// WebSocket upgrade handler.
///
/// GET /api/ws
///
/// The credential is verified before the upgrade is looked at, so a rejected
/// handshake never touches presence or room state.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(&state.relay, &headers, query.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            debug!("Connection {}: {}", ConnectionState::Closed, e);
            return e.into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    info!("WebSocket upgrade request from {}", identity);
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, relay, identity))
}

async fn authenticate(
    relay: &Relay,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<Identity, AuthError> {
    debug!("Connection {}", ConnectionState::Connecting);
    let credential = credential_from_request(headers, query)?;
    let identity = relay.authenticate(credential.as_deref()).await?;
    debug!("Connection {} as {}", ConnectionState::Authenticated, identity);
    Ok(identity)
}

/// Handle a WebSocket connection.
async fn handle_ws_connection(socket: WebSocket, relay: Relay, identity: Identity) {
    let (sender, receiver) = socket.split();
    let (session, events) = relay.open(identity);
    let connection_id = session.id();
    let close = session.close_signal();
    let ping_every = Duration::from_secs(relay.config().ping_interval_secs.max(1));

    let send_task = tokio::spawn(write_events(sender, events, ping_every, close.clone()));

    read_frames(&session, receiver, close).await;

    send_task.abort();
    session.close();
    info!("WebSocket connection {} closed", connection_id);
}

/// Forward outbound events and periodic pings to the client.
///
/// However it ends, `close` is cancelled on exit so the read side stops too.
async fn write_events<S>(
    mut sender: S,
    mut events: mpsc::Receiver<OutboundEvent>,
    ping_every: Duration,
    close: CancellationToken,
) where
    S: Sink<Message> + Unpin,
{
    let _close_on_exit = close.drop_guard();
    let mut ping_interval = tokio::time::interval(ping_every);
    // The first tick completes immediately.
    ping_interval.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break;
                };
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        warn!("Failed to serialize event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    debug!("WebSocket write failed");
                    break;
                }
            }

            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    debug!("WebSocket ping failed");
                    break;
                }
            }
        }
    }
}

/// Handle inbound frames one at a time, in receipt order, until the peer
/// goes away or `close` fires.
async fn read_frames<S>(session: &Session, mut receiver: S, close: CancellationToken)
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let connection_id = session.id();
    loop {
        let frame = tokio::select! {
            _ = close.cancelled() => {
                info!("Connection {} can no longer be written to, closing", connection_id);
                return;
            }
            frame = receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = session.handle_text(text.as_str()).await {
                    debug!("Event from {} failed: {}", connection_id, e);
                }
            }
            Some(Ok(Message::Binary(_))) => {
                debug!("Received binary frame on {}, ignoring", connection_id);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                info!("Connection {} closed by client", connection_id);
                return;
            }
            Some(Err(e)) => {
                warn!("WebSocket error on {}: {}", connection_id, e);
                return;
            }
            None => {
                debug!("Connection {} stream ended", connection_id);
                return;
            }
        }
    }
}
