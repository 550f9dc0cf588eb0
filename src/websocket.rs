// src/websocket.rs

use crate::{
    config::WebSocketSettings,
    fanout,
    models::{ClientMessage, ServerMessage, UserId},
    registry::{ConnectionHandle, ConnectionId, Frame, JoinOutcome},
    state::ChatState,
};
use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::{
    sink::{Sink, SinkExt},
    stream::{Stream, StreamExt},
};
use std::{fmt::Display, sync::Arc};
use tokio::{sync::mpsc, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The handler for `/ws`. Anything that is not a WebSocket upgrade gets `426 Upgrade Required`.
pub async fn websocket_handler(
    State(state): State<ChatState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(rejection) => {
            debug!(%rejection, "rejecting non-upgrade request");
            (StatusCode::UPGRADE_REQUIRED, rejection.body_text()).into_response()
        }
    }
}

async fn handle_socket(socket: WebSocket, state: ChatState) {
    let (sender, receiver) = socket.split();
    serve_connection(sender, receiver, state).await;
}

/// Manages the lifecycle of a connection. It stays anonymous until its first `join_chat`.
async fn serve_connection<W, R, E>(sender: W, receiver: R, state: ChatState)
where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(state.websocket.outbound_buffer.max(1));
    let shutdown = CancellationToken::new();
    let handle = ConnectionHandle::new(outbound_tx, shutdown.clone());
    info!(conn_id = %handle.id(), "client connected");

    let send_task = tokio::spawn(write_to_client(
        sender,
        outbound_rx,
        shutdown.clone(),
        state.websocket.clone(),
        handle.id(),
    ));

    let joined = read_from_client(receiver, &handle, &shutdown, &state).await;

    // Stop the writer and wait for it to send the close frame.
    shutdown.cancel();
    if let Err(e) = send_task.await {
        warn!(conn_id = %handle.id(), error = %e, "writer task failed");
    }

    cleanup_client(&state, &handle, joined).await;
}

/// Reads frames until the peer goes away or the connection is told to shut down.
/// Returns the user this connection last joined as.
async fn read_from_client<R, E>(
    mut receiver: R,
    handle: &ConnectionHandle,
    shutdown: &CancellationToken,
    state: &ChatState,
) -> Option<UserId>
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut joined = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = receiver.next() => next,
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                handle_frame(text.as_str(), handle, &mut joined, state).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(Message::Binary(_))) => {
                debug!(conn_id = %handle.id(), "ignoring binary frame");
            }
            // Pings are answered by the socket itself.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn_id = %handle.id(), error = %e, "read error");
                break;
            }
        }
    }

    joined
}

async fn handle_frame(
    text: &str,
    handle: &ConnectionHandle,
    joined: &mut Option<UserId>,
    state: &ChatState,
) {
    let frame = match ClientMessage::parse(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn_id = %handle.id(), error = %e, "ignoring frame");
            return;
        }
    };
    debug!(conn_id = %handle.id(), kind = frame.kind(), "received frame");

    match frame {
        ClientMessage::JoinChat(join) => {
            let outcome = fanout::join_chat(state, *joined, &join, handle).await;
            if outcome != JoinOutcome::Rejected {
                *joined = Some(join.user_id);
            }
        }
        ClientMessage::SendMessage(send) => {
            let (chat_id, user_id) = (send.chat_id, send.user_id);
            if let Err(e) = fanout::send_message(state, send).await {
                warn!(
                    conn_id = %handle.id(),
                    chat_id,
                    user_id,
                    error = %e,
                    "send_message failed"
                );
                report_error(handle, e.client_message());
            }
        }
    }
}

/// Sends an `error` frame back to this connection only.
fn report_error(handle: &ConnectionHandle, message: String) {
    let json = match (ServerMessage::Error { message }).to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(conn_id = %handle.id(), error = %e, "failed to encode error frame");
            return;
        }
    };
    if let Err(e) = handle.try_send(Frame::from(json)) {
        debug!(conn_id = %handle.id(), error = %e, "could not report error to sender");
    }
}

/// Drains the outbound queue into the socket and keeps the connection alive with pings.
/// A failed or timed-out write shuts the whole connection down.
async fn write_to_client<W>(
    mut sender: W,
    mut outbound: mpsc::Receiver<Frame>,
    shutdown: CancellationToken,
    settings: Arc<WebSocketSettings>,
    conn_id: ConnectionId,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let write_timeout = settings.write_timeout();
    let mut ping = tokio::time::interval(settings.ping_interval());
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ping.tick().await;

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => Message::Text(frame.to_string().into()),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(write_timeout, sender.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(%conn_id, error = %e, "write failed");
                shutdown.cancel();
                return;
            }
            Err(_) => {
                warn!(%conn_id, timeout = ?write_timeout, "write timed out, dropping connection");
                shutdown.cancel();
                return;
            }
        }
    }

    let _ = tokio::time::timeout(write_timeout, sender.send(Message::Close(None))).await;
}

/// Releases this connection's registration unless a newer connection has taken it over.
async fn cleanup_client(state: &ChatState, handle: &ConnectionHandle, joined: Option<UserId>) {
    match joined {
        Some(user_id) => {
            let released = state.registry.leave(user_id, handle.id()).await;
            info!(conn_id = %handle.id(), user_id, released, "client disconnected");
        }
        None => info!(conn_id = %handle.id(), "anonymous client disconnected"),
    }
}
