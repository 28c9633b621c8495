//! WebSocket transport via axum.
//!
//! Every request path is a candidate task URL, so the whole app is a single
//! fallback handler. Admission runs before the upgrade by asking the router
//! task; a refused client gets a plain HTTP status instead of
//! `101 Switching Protocols`.
//!
//! After the upgrade each socket runs in its own task, forwarding inbound
//! frames to the router and draining a private outbound queue. The queue
//! preserves per-connection FIFO order. [`Outbound::Close`] drops the socket
//! without a close handshake.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use patrec_core::TaskKind;
use tokio::sync::{mpsc, oneshot};

use crate::{ServerEvent, error::AdmissionError};

/// Requests from socket tasks to the router task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Admission check before the upgrade
    Verify { path: String, respond_to: oneshot::Sender<Result<TaskKind, AdmissionError>> },
    /// Upgrade completed; register the outbound queue and admit
    Accept { connection_id: u64, path: String, outbound: mpsc::UnboundedSender<Outbound> },
    /// Anything else the socket observed
    Event(ServerEvent),
}

/// Work for a socket task.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Write a text frame
    Text(String),
    /// Drop the socket
    Close,
}

/// Shared state of the upgrade handler.
#[derive(Clone)]
pub(crate) struct TransportState {
    commands: mpsc::UnboundedSender<Command>,
    max_payload_bytes: usize,
    next_connection_id: Arc<AtomicU64>,
}

impl TransportState {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>, max_payload_bytes: usize) -> Self {
        Self { commands, max_payload_bytes, next_connection_id: Arc::new(AtomicU64::new(1)) }
    }
}

/// The HTTP app: every path goes through the upgrade handler.
pub(crate) fn app(state: TransportState) -> Router {
    Router::new().fallback(upgrade).with_state(state)
}

async fn upgrade(State(state): State<TransportState>, uri: Uri, ws: WebSocketUpgrade) -> Response {
    let path = uri.path().to_string();

    let (respond_to, verdict) = oneshot::channel();
    if state.commands.send(Command::Verify { path: path.clone(), respond_to }).is_err() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match verdict.await {
        Ok(Ok(kind)) => tracing::debug!(%path, task = %kind, "upgrade admitted"),
        Ok(Err(e @ AdmissionError::PoolFull { .. })) => {
            tracing::info!(%path, "upgrade refused: {e}");
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        },
        Ok(Err(e @ AdmissionError::UnknownTask(_))) => {
            tracing::info!(%path, "upgrade refused: {e}");
            return (StatusCode::NOT_FOUND, e.to_string()).into_response();
        },
        Err(_) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }

    let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let commands = state.commands.clone();
    ws.max_message_size(state.max_payload_bytes)
        .on_upgrade(move |socket| handle_socket(socket, connection_id, path, commands))
}

/// Pump one socket until either side ends it.
async fn handle_socket(
    socket: WebSocket,
    connection_id: u64,
    path: String,
    commands: mpsc::UnboundedSender<Command>,
) {
    let (outbound, mut queue) = mpsc::unbounded_channel();
    if commands.send(Command::Accept { connection_id, path, outbound }).is_err() {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    let report = |event: ServerEvent| {
        // The router task only stops at shutdown.
        let _ = commands.send(Command::Event(event));
    };

    loop {
        tokio::select! {
            next = queue.recv() => match next {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        report(ServerEvent::ConnectionErrored { connection_id, error: e.to_string() });
                        return;
                    }
                },
                Some(Outbound::Close) | None => {
                    tracing::debug!(connection_id, "dropping socket");
                    return;
                },
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    report(ServerEvent::MessageReceived { connection_id, payload: text.as_str().to_owned() });
                },
                Some(Ok(Message::Binary(bytes))) => match binary_payload(&bytes) {
                    Ok(payload) => report(ServerEvent::MessageReceived { connection_id, payload }),
                    Err(error) => {
                        report(ServerEvent::ConnectionErrored { connection_id, error });
                        return;
                    },
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {},
                Some(Ok(Message::Close(_))) | None => {
                    report(ServerEvent::ConnectionClosed { connection_id });
                    return;
                },
                Some(Err(e)) => {
                    report(ServerEvent::ConnectionErrored { connection_id, error: e.to_string() });
                    return;
                },
            },
        }
    }
}

/// Text carried by a binary frame. Non-UTF-8 frames are refused, never repaired.
fn binary_payload(bytes: &[u8]) -> Result<String, String> {
    std::str::from_utf8(bytes).map(str::to_owned).map_err(|e| format!("binary frame is not UTF-8: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_binary_frame_is_forwarded_verbatim() {
        let raw = r#"{"data": {"message": "Let's start"}}"#;

        assert_eq!(binary_payload(raw.as_bytes()), Ok(raw.to_string()));
    }

    #[test]
    fn invalid_utf8_binary_frame_is_refused() {
        let error = binary_payload(&[b'{', 0xff, 0xfe, b'}']).unwrap_err();

        assert!(error.contains("not UTF-8"));
    }
}
