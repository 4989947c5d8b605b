//! Runner agent: host-resident peer of the HQ relay.
//!
//! Owns the PTYs for every session a browser starts on this host and
//! multiplexes them over a single upstream WebSocket. See [`agent::Agent`]
//! for the connection lifecycle and [`pty::Pty`] for the terminal itself.

pub mod agent;
pub mod pty;

pub use agent::{Agent, AgentConfig, RECONNECT_DELAY};
pub use pty::Pty;
