//! Connection registry: the hub's index of live runners and client sessions.
//!
//! The hub owns no sockets. Each WebSocket handler registers an unbounded
//! sender here and runs a writer task that drains the matching receiver, so
//! writes on one transport are serialized by its queue and the hub never
//! holds a lock across I/O. Dropping every sender for a peer ends its writer
//! task, which closes the socket.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// One outbound WebSocket frame, queued for a peer's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

pub type FrameSender = mpsc::UnboundedSender<Frame>;

/// Predicate applied to the token a runner presents at registration.
pub type TokenValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("runner {0} already registered")]
    RunnerExists(String),
    #[error("runner {0} not found")]
    RunnerNotFound(String),
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("peer connection closed")]
    PeerClosed,
}

/// A connected runner agent.
pub struct RunnerConn {
    pub id: String,
    tx: FrameSender,
    /// session_id -> that session's client sender. Secondary lock: only
    /// touched while holding the registry lock, never the other way around.
    sessions: DashMap<String, FrameSender>,
}

impl RunnerConn {
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// A connected browser client, bound to one session on one runner.
struct ClientConn {
    runner_id: String,
    tx: FrameSender,
}

struct Indexes {
    /// runner_id -> runner
    runners: HashMap<String, Arc<RunnerConn>>,
    /// session_id -> client
    clients: HashMap<String, ClientConn>,
    /// session_id -> runner_id
    sessions: HashMap<String, String>,
}

/// Routes frames between matched runner/client pairs.
pub struct Hub {
    inner: RwLock<Indexes>,
    validate_token: TokenValidator,
    forward_lifecycle: bool,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes {
                runners: HashMap::new(),
                clients: HashMap::new(),
                sessions: HashMap::new(),
            }),
            // Any non-empty token passes until a real policy is plugged in.
            validate_token: Arc::new(|token: &str| !token.is_empty()),
            forward_lifecycle: true,
        }
    }

    /// Replace the token predicate applied at runner registration.
    pub fn with_token_validator(
        mut self,
        validate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.validate_token = Arc::new(validate);
        self
    }

    /// When false, runner lifecycle frames (`session_started`,
    /// `session_ended`, `error`) are logged but not relayed to clients.
    pub fn with_lifecycle_forwarding(mut self, forward: bool) -> Self {
        self.forward_lifecycle = forward;
        self
    }

    pub fn token_ok(&self, token: &str) -> bool {
        (self.validate_token)(token)
    }

    pub fn forwards_lifecycle(&self) -> bool {
        self.forward_lifecycle
    }

    /// Add a runner. Fails on a duplicate id; the existing runner keeps its
    /// registration.
    pub fn register_runner(&self, id: &str, tx: FrameSender) -> Result<(), HubError> {
        let mut inner = self.inner.write().unwrap();
        if inner.runners.contains_key(id) {
            return Err(HubError::RunnerExists(id.to_string()));
        }
        inner.runners.insert(
            id.to_string(),
            Arc::new(RunnerConn {
                id: id.to_string(),
                tx,
                sessions: DashMap::new(),
            }),
        );
        tracing::info!(runner_id = %id, "runner registered");
        Ok(())
    }

    /// Remove a runner and every session bound to it. Dropping each client's
    /// sender ends that client's writer task, which closes its socket.
    pub fn unregister_runner(&self, id: &str) {
        let mut inner = self.inner.write().unwrap();
        let Some(runner) = inner.runners.remove(id) else {
            return;
        };
        let mut swept = 0usize;
        for entry in runner.sessions.iter() {
            inner.clients.remove(entry.key());
            inner.sessions.remove(entry.key());
            swept += 1;
        }
        runner.sessions.clear();
        tracing::info!(runner_id = %id, sessions = swept, "runner unregistered");
    }

    /// Bind a client session to a runner. Fails if the runner is unknown or
    /// the session id is already taken.
    pub fn register_client(
        &self,
        session_id: &str,
        runner_id: &str,
        tx: FrameSender,
    ) -> Result<(), HubError> {
        let mut inner = self.inner.write().unwrap();
        let Some(runner) = inner.runners.get(runner_id).cloned() else {
            return Err(HubError::RunnerNotFound(runner_id.to_string()));
        };
        if inner.clients.contains_key(session_id) {
            return Err(HubError::SessionExists(session_id.to_string()));
        }
        runner.sessions.insert(session_id.to_string(), tx.clone());
        inner.clients.insert(
            session_id.to_string(),
            ClientConn {
                runner_id: runner_id.to_string(),
                tx,
            },
        );
        inner
            .sessions
            .insert(session_id.to_string(), runner_id.to_string());
        tracing::info!(session_id = %session_id, runner_id = %runner_id, "client registered");
        Ok(())
    }

    /// Remove a client session from all indexes. A no-op when the session is
    /// already gone. The runner is not told; its PTY lives until the process
    /// exits on its own.
    pub fn unregister_client(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap();
        let Some(client) = inner.clients.remove(session_id) else {
            return;
        };
        if let Some(runner) = inner.runners.get(&client.runner_id) {
            runner.sessions.remove(session_id);
        }
        inner.sessions.remove(session_id);
        tracing::info!(session_id = %session_id, "client unregistered");
    }

    /// Queue a frame on the runner that owns `session_id`.
    pub fn route_to_runner(&self, session_id: &str, frame: Frame) -> Result<(), HubError> {
        let inner = self.inner.read().unwrap();
        let client = inner
            .clients
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
        let runner = inner
            .runners
            .get(&client.runner_id)
            .ok_or_else(|| HubError::RunnerNotFound(client.runner_id.clone()))?;
        runner.tx.send(frame).map_err(|_| HubError::PeerClosed)
    }

    /// Queue a frame on the client bound to `session_id`.
    pub fn route_to_client(&self, session_id: &str, frame: Frame) -> Result<(), HubError> {
        let inner = self.inner.read().unwrap();
        let client = inner
            .clients
            .get(session_id)
            .ok_or_else(|| HubError::SessionNotFound(session_id.to_string()))?;
        client.tx.send(frame).map_err(|_| HubError::PeerClosed)
    }

    pub fn runner(&self, id: &str) -> Option<Arc<RunnerConn>> {
        self.inner.read().unwrap().runners.get(id).cloned()
    }

    pub fn runner_for_session(&self, session_id: &str) -> Option<String> {
        self.inner.read().unwrap().sessions.get(session_id).cloned()
    }

    /// Snapshot of registered runner ids, in no particular order.
    pub fn list_runners(&self) -> Vec<String> {
        self.inner.read().unwrap().runners.keys().cloned().collect()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
