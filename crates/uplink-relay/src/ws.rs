//! WebSocket transport: upgrades subscriber connections and binds them to
//! the hub.
//!
//! The hub only ever touches a session through its outbound queue; this
//! module owns everything socket-shaped. A writer task drains the queue to
//! the wire and pings periodically, the read side watches for teardown and
//! reports it back to the hub as an unregistration.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use log::{debug, info};

use crate::hub::{HubHandle, Session, SubscriptionFilter};
use crate::server::AppState;

/// Ping interval for keepalive.
const PING_INTERVAL_SECS: u64 = 30;

/// WebSocket upgrade handler.
///
/// GET /ws?app_id=&dev_id=&user_id=&experiment=
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(filter): Query<SubscriptionFilter>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state.hub, filter))
}

async fn handle_connection(socket: WebSocket, hub: HubHandle, filter: SubscriptionFilter) {
    let (session, mut outbound) = Session::new(filter);
    let session_id = session.id();
    info!("subscriber {session_id} connected");
    hub.register(session).await;

    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Queue closed: the hub evicted us or the session was
                    // unregistered. Tell the peer and stop.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Subscribers send no commands; the read side exists to notice teardown.
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(other) => debug!("ignoring frame from subscriber {session_id}: {other:?}"),
        }
    }

    info!("subscriber {session_id} disconnected");
    hub.unregister(session_id).await;
    send_task.abort();
}
