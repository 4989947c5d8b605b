//! WebSocket routing engine: the runner and terminal endpoints.
//!
//! Each accepted socket is split into a read loop and a writer task that
//! drains the peer's frame queue; the two race in a `tokio::select!` so a
//! closed queue (registry sweep) or a dead socket tears the whole handler
//! down, which runs the matching unregister.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use relay_protocol::{decode_frame, encode_frame, ControlMessage};

use crate::hub::{Frame, Hub};

/// `GET /ws/runner` — runner attachment point.
pub async fn runner_ws(State(hub): State<Arc<Hub>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_runner_socket(socket, hub))
        .into_response()
}

/// `GET /ws/terminal/{runner_id}` — browser attachment point. The runner
/// must already be registered or the upgrade is refused outright.
pub async fn terminal_ws(
    State(hub): State<Arc<Hub>>,
    Path(runner_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    if hub.runner(&runner_id).is_none() {
        tracing::warn!(runner_id = %runner_id, "terminal connection for unknown runner");
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "runner not found" })),
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| handle_client_socket(socket, hub, runner_id))
        .into_response()
}

async fn handle_runner_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (sink, mut stream) = socket.split();

    // Handshake: exactly one frame, which must be a valid registration.
    // Any failure closes the socket with no registry side effects.
    let Some(runner_id) = read_registration(&mut stream, &hub).await else {
        return;
    };

    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(err) = hub.register_runner(&runner_id, tx) {
        tracing::warn!(runner_id = %runner_id, error = %err, "runner handshake rejected");
        return;
    }

    tokio::select! {
        _ = write_frames(sink, rx) => {}
        _ = runner_read_loop(&hub, &runner_id, &mut stream) => {}
    }

    hub.unregister_runner(&runner_id);
    tracing::info!(runner_id = %runner_id, "runner disconnected");
}

/// Read the runner's first frame and validate it. Returns the runner id on
/// success.
async fn read_registration(
    stream: &mut SplitStream<WebSocket>,
    hub: &Hub,
) -> Option<String> {
    let text = match first_data_frame(stream).await? {
        Message::Text(text) => text,
        other => {
            tracing::warn!(frame = ?other, "runner handshake: expected a register frame");
            return None;
        }
    };
    match ControlMessage::from_json(text.as_str()) {
        Ok(ControlMessage::Register { runner_id, token }) => {
            if runner_id.is_empty() {
                tracing::warn!("runner handshake: empty runner id");
                return None;
            }
            if !hub.token_ok(&token) {
                tracing::warn!(runner_id = %runner_id, "runner handshake: token rejected");
                return None;
            }
            Some(runner_id)
        }
        Ok(other) => {
            tracing::warn!(kind = other.kind(), "runner handshake: unexpected message kind");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "runner handshake: unparseable frame");
            None
        }
    }
}

async fn runner_read_loop(hub: &Hub, runner_id: &str, stream: &mut SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => match ControlMessage::from_json(text.as_str()) {
                Ok(msg) => handle_runner_control(hub, runner_id, &msg, text.as_str()),
                Err(err) => {
                    tracing::warn!(runner_id = %runner_id, error = %err, "dropping unparseable runner frame");
                }
            },
            Message::Binary(data) => {
                let Some((session_id, payload)) = decode_frame(&data) else {
                    tracing::warn!(runner_id = %runner_id, len = data.len(), "dropping malformed binary frame");
                    continue;
                };
                // Strip the header: the browser hop carries raw bytes only.
                if let Err(err) = hub.route_to_client(session_id, Frame::Binary(payload.to_vec())) {
                    tracing::debug!(session_id = %session_id, error = %err, "pty output had no client");
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Lifecycle traffic from a runner. Always logged; relayed to the owning
/// client when the hub's forwarding policy is on. A `session_ended` also
/// retires the session, which closes the client's socket once the final
/// frame has drained.
fn handle_runner_control(hub: &Hub, runner_id: &str, msg: &ControlMessage, raw: &str) {
    match msg {
        ControlMessage::SessionStarted { session_id } => {
            tracing::info!(runner_id = %runner_id, session_id = %session_id, "session started");
            forward_to_client(hub, msg, raw);
        }
        ControlMessage::SessionEnded {
            session_id,
            exit_code,
        } => {
            tracing::info!(runner_id = %runner_id, session_id = %session_id, exit_code, "session ended");
            forward_to_client(hub, msg, raw);
            hub.unregister_client(session_id);
        }
        ControlMessage::Error { message, .. } => {
            tracing::warn!(runner_id = %runner_id, message = %message, "error from runner");
            forward_to_client(hub, msg, raw);
        }
        other => {
            tracing::warn!(runner_id = %runner_id, kind = other.kind(), "dropping unexpected runner message");
        }
    }
}

fn forward_to_client(hub: &Hub, msg: &ControlMessage, raw: &str) {
    if !hub.forwards_lifecycle() {
        return;
    }
    let Some(session_id) = msg.session_id() else {
        return;
    };
    if let Err(err) = hub.route_to_client(session_id, Frame::Text(raw.to_string())) {
        tracing::debug!(session_id = %session_id, error = %err, "lifecycle frame had no client");
    }
}

async fn handle_client_socket(socket: WebSocket, hub: Arc<Hub>, runner_id: String) {
    let (sink, mut stream) = socket.split();

    // Handshake: exactly one frame, which must name the session to start.
    let Some((session_id, raw_start)) = read_session_start(&mut stream).await else {
        return;
    };

    let (tx, rx) = mpsc::unbounded_channel();
    if let Err(err) = hub.register_client(&session_id, &runner_id, tx) {
        tracing::warn!(session_id = %session_id, runner_id = %runner_id, error = %err, "client handshake rejected");
        return;
    }

    // Hand the original request to the runner verbatim.
    if let Err(err) = hub.route_to_runner(&session_id, Frame::Text(raw_start)) {
        tracing::warn!(session_id = %session_id, error = %err, "failed to deliver session start");
        hub.unregister_client(&session_id);
        return;
    }

    tokio::select! {
        _ = write_frames(sink, rx) => {}
        _ = client_read_loop(&hub, &session_id, &mut stream) => {}
    }

    // TODO: tell the runner the client is gone so it can reap the PTY early
    // instead of waiting for the process to exit.
    hub.unregister_client(&session_id);
    tracing::info!(session_id = %session_id, "client disconnected");
}

async fn read_session_start(stream: &mut SplitStream<WebSocket>) -> Option<(String, String)> {
    let text = match first_data_frame(stream).await? {
        Message::Text(text) => text,
        other => {
            tracing::warn!(frame = ?other, "client handshake: expected a session start frame");
            return None;
        }
    };
    match ControlMessage::from_json(text.as_str()) {
        Ok(ControlMessage::StartSession { session_id, .. }) => {
            if session_id.is_empty() {
                tracing::warn!("client handshake: empty session id");
                return None;
            }
            Some((session_id, text.to_string()))
        }
        Ok(other) => {
            tracing::warn!(kind = other.kind(), "client handshake: unexpected message kind");
            None
        }
        Err(err) => {
            tracing::warn!(error = %err, "client handshake: unparseable frame");
            None
        }
    }
}

async fn client_read_loop(hub: &Hub, session_id: &str, stream: &mut SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Binary(data) => {
                // Prepend the header for the runner hop.
                let framed = encode_frame(session_id, &data);
                if let Err(err) = hub.route_to_runner(session_id, Frame::Binary(framed)) {
                    tracing::debug!(session_id = %session_id, error = %err, "client input had no runner");
                }
            }
            Message::Text(text) => {
                if let Err(err) = hub.route_to_runner(session_id, Frame::Text(text.to_string())) {
                    tracing::debug!(session_id = %session_id, error = %err, "client control frame had no runner");
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// Drain a peer's frame queue into its socket. Ends when the socket dies or
/// every sender is gone, in which case the socket is closed cleanly.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        if sink.send(msg).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Next text or binary frame, skipping interleaved ping/pong traffic.
/// Returns `None` when the socket closes first.
async fn first_data_frame(stream: &mut SplitStream<WebSocket>) -> Option<Message> {
    loop {
        match stream.next().await? {
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(msg) => return Some(msg),
        }
    }
}
