//! Upstream session manager: one WebSocket to HQ, many PTYs below it.
//!
//! The agent cycles through connect → register → serve, retrying on a fixed
//! delay until [`Agent::close`] is called. While serving, a dedicated writer
//! task owns the sink and drains an unbounded outbound queue, so the dispatch
//! loop and every per-session output pump share the transport without
//! interleaving partial frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use relay_protocol::{decode_frame, encode_frame, ControlMessage};

use crate::pty::Pty;

/// Delay between reconnection attempts. Fixed, no jitter; fine for a handful
/// of runners per HQ.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const READ_BUF_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// HQ WebSocket endpoint, e.g. `ws://localhost:8080/ws/runner`.
    pub hq_url: String,
    /// Identity this runner registers under.
    pub runner_id: String,
    /// Token presented at registration.
    pub token: String,
}

type Outbound = mpsc::UnboundedSender<Message>;

/// The runner agent: owns the session map and the upstream connection.
pub struct Agent {
    cfg: AgentConfig,
    sessions: Mutex<HashMap<String, Arc<Pty>>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Self {
        Self {
            cfg,
            sessions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Connect and serve until [`Agent::close`]. Lost connections are
    /// re-dialed after [`RECONNECT_DELAY`], indefinitely.
    pub async fn run(self: Arc<Self>) {
        while !self.closed.load(Ordering::SeqCst) {
            match self.connect_and_serve().await {
                Ok(()) => tracing::info!("connection to hq closed"),
                Err(err) => tracing::warn!(error = %format!("{err:#}"), "connection to hq failed"),
            }
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            tracing::info!(delay_secs = RECONNECT_DELAY.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = self.shutdown.notified() => break,
            }
        }
        tracing::info!("runner agent stopped");
    }

    async fn connect_and_serve(self: &Arc<Self>) -> anyhow::Result<()> {
        tracing::info!(url = %self.cfg.hq_url, "connecting to hq");
        let (ws, _) = connect_async(&self.cfg.hq_url)
            .await
            .context("failed to reach hq")?;
        let (mut sink, mut stream) = ws.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        // Registration is the first frame on the wire.
        let register = ControlMessage::Register {
            runner_id: self.cfg.runner_id.clone(),
            token: self.cfg.token.clone(),
        };
        let _ = outbound.send(Message::text(register.to_json()));
        tracing::info!(runner_id = %self.cfg.runner_id, "registering with hq");

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_control(&outbound, text.as_str()),
                    Some(Ok(Message::Binary(data))) => self.handle_binary(&data),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "read error on hq connection");
                        break;
                    }
                }
            }
        }

        // Dropping the writer task drops the sink, which closes the socket;
        // pumps from still-live sessions see a dead queue and go quiet.
        writer.abort();
        Ok(())
    }

    fn handle_control(self: &Arc<Self>, outbound: &Outbound, text: &str) {
        match ControlMessage::from_json(text) {
            Ok(ControlMessage::StartSession {
                session_id,
                command,
            }) => self.start_session(outbound, session_id, command),
            Ok(ControlMessage::Resize {
                session_id,
                rows,
                cols,
            }) => self.resize_session(&session_id, rows, cols),
            Ok(other) => {
                tracing::warn!(kind = other.kind(), "dropping unexpected message from hq");
            }
            Err(err) => {
                tracing::warn!(error = %err, "dropping unparseable frame from hq");
            }
        }
    }

    fn start_session(self: &Arc<Self>, outbound: &Outbound, session_id: String, command: Vec<String>) {
        let pty = match Pty::spawn(&session_id, &command) {
            Ok(pty) => Arc::new(pty),
            Err(err) => {
                tracing::warn!(session_id = %session_id, error = %format!("{err:#}"), "pty spawn failed");
                let msg = ControlMessage::Error {
                    message: format!("failed to start pty: {err:#}"),
                    code: None,
                    session_id: Some(session_id),
                };
                let _ = outbound.send(Message::text(msg.to_json()));
                return;
            }
        };

        self.sessions
            .lock()
            .unwrap()
            .insert(session_id.clone(), pty.clone());
        let started = ControlMessage::SessionStarted {
            session_id: session_id.clone(),
        };
        let _ = outbound.send(Message::text(started.to_json()));

        // Output pump: PTY bytes go upstream with the session header on.
        let pump = {
            let pty = pty.clone();
            let out = outbound.clone();
            let sid = session_id.clone();
            tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; READ_BUF_SIZE];
                loop {
                    match pty.read_chunk(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if out.send(Message::binary(encode_frame(&sid, &buf[..n]))).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        };

        // Exit waiter: once the process is gone and the pump has drained,
        // retire the session and report the code as its final frame.
        let agent = self.clone();
        let out = outbound.clone();
        tokio::spawn(async move {
            let exit_code = {
                let pty = pty.clone();
                tokio::task::spawn_blocking(move || pty.wait())
                    .await
                    .unwrap_or(1)
            };
            let _ = pump.await;
            agent.sessions.lock().unwrap().remove(&session_id);
            let ended = ControlMessage::SessionEnded {
                session_id: session_id.clone(),
                exit_code,
            };
            let _ = out.send(Message::text(ended.to_json()));
            tracing::info!(session_id = %session_id, exit_code, "session ended");
        });
    }

    fn resize_session(&self, session_id: &str, rows: u16, cols: u16) {
        let pty = self.sessions.lock().unwrap().get(session_id).cloned();
        let Some(pty) = pty else {
            tracing::warn!(session_id = %session_id, "resize for unknown session");
            return;
        };
        if let Err(err) = pty.resize(rows, cols) {
            tracing::warn!(session_id = %session_id, error = %format!("{err:#}"), "resize failed");
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        let Some((session_id, payload)) = decode_frame(data) else {
            tracing::warn!(len = data.len(), "dropping malformed binary frame from hq");
            return;
        };
        let pty = self.sessions.lock().unwrap().get(session_id).cloned();
        let Some(pty) = pty else {
            tracing::warn!(session_id = %session_id, "input for unknown session");
            return;
        };
        if let Err(err) = pty.write(payload) {
            tracing::warn!(session_id = %session_id, error = %format!("{err:#}"), "pty write failed");
        }
    }

    /// Shut the agent down: stop reconnecting, close every live PTY (their
    /// waiters retire them), and drop the upstream connection. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down runner agent");
        let live: Vec<Arc<Pty>> = self.sessions.lock().unwrap().values().cloned().collect();
        for pty in live {
            pty.close();
        }
        self.shutdown.notify_one();
    }
}
