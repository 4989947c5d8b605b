//! Wire protocol shared by the HQ relay, runner agents, and browser clients.
//!
//! Every transport in the fabric carries two frame kinds, distinguished by
//! the WebSocket text/binary opcode:
//!
//! - **Control frames** (text): a JSON envelope `{"type": ..., "payload": ...}`,
//!   modeled here as the [`ControlMessage`] enum.
//! - **Data frames** (binary): opaque terminal bytes. On the runner↔HQ hop
//!   every data frame starts with a fixed 36-byte session-id header; on the
//!   browser↔HQ hop the header is absent and HQ translates between the two
//!   shapes. See [`encode_frame`] / [`decode_frame`].

use serde::{Deserialize, Serialize};

/// Width of the session-id header on hub-facing binary frames. Session ids
/// are UUIDs in textual form, which are exactly this long; shorter ids are
/// NUL-padded on the wire.
pub const SESSION_ID_LEN: usize = 36;

/// A control frame, tagged by its `type` field with per-kind payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlMessage {
    /// First frame from a runner; identifies and authenticates it.
    Register { runner_id: String, token: String },
    /// Client request to spawn a PTY. An empty `command` means the host's
    /// default shell.
    StartSession {
        session_id: String,
        command: Vec<String>,
    },
    /// Change a PTY's window size.
    Resize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    /// Runner acknowledgment that the PTY spawned.
    SessionStarted { session_id: String },
    /// The PTY's process exited.
    SessionEnded { session_id: String, exit_code: i32 },
    /// Session-scoped failure reported by the runner. `session_id` is set
    /// when the failure is attributable to one session (a failed spawn), so
    /// the relay can deliver it to the right client.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ControlMessage {
    /// The wire name of this message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Register { .. } => "register",
            ControlMessage::StartSession { .. } => "start_session",
            ControlMessage::Resize { .. } => "resize",
            ControlMessage::SessionStarted { .. } => "session_started",
            ControlMessage::SessionEnded { .. } => "session_ended",
            ControlMessage::Error { .. } => "error",
        }
    }

    /// The session this message is scoped to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ControlMessage::StartSession { session_id, .. }
            | ControlMessage::Resize { session_id, .. }
            | ControlMessage::SessionStarted { session_id }
            | ControlMessage::SessionEnded { session_id, .. } => Some(session_id),
            ControlMessage::Error { session_id, .. } => session_id.as_deref(),
            ControlMessage::Register { .. } => None,
        }
    }

    pub fn to_json(&self) -> String {
        // The envelope contains nothing a Serialize impl can reject.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Build a hub-facing binary frame: a 36-byte session-id header followed by
/// the terminal bytes. Ids shorter than the header are NUL-padded, longer
/// ones truncated.
pub fn encode_frame(session_id: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; SESSION_ID_LEN + payload.len()];
    let id = session_id.as_bytes();
    let n = id.len().min(SESSION_ID_LEN);
    frame[..n].copy_from_slice(&id[..n]);
    frame[SESSION_ID_LEN..].copy_from_slice(payload);
    frame
}

/// Split a hub-facing binary frame into its session id and payload.
///
/// Returns `None` for malformed frames: shorter than the header, or a header
/// that is not valid UTF-8. Trailing NUL padding is stripped from the id.
pub fn decode_frame(frame: &[u8]) -> Option<(&str, &[u8])> {
    if frame.len() < SESSION_ID_LEN {
        return None;
    }
    let (header, payload) = frame.split_at(SESSION_ID_LEN);
    let id = std::str::from_utf8(header).ok()?.trim_end_matches('\0');
    Some((id, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SID: &str = "11111111-1111-1111-1111-111111111111";

    #[test]
    fn start_session_wire_shape() {
        let json = format!(
            r#"{{"type":"start_session","payload":{{"session_id":"{SID}","command":["/bin/echo","hi"]}}}}"#
        );
        let msg = ControlMessage::from_json(&json).unwrap();
        assert_eq!(
            msg,
            ControlMessage::StartSession {
                session_id: SID.to_string(),
                command: vec!["/bin/echo".to_string(), "hi".to_string()],
            }
        );
        assert_eq!(msg.kind(), "start_session");
        assert_eq!(msg.session_id(), Some(SID));
        // Round-trips to the same wire text.
        assert_eq!(msg.to_json(), json);
    }

    #[test]
    fn resize_wire_shape() {
        let json = format!(r#"{{"type":"resize","payload":{{"session_id":"{SID}","rows":40,"cols":120}}}}"#);
        let msg = ControlMessage::from_json(&json).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Resize {
                session_id: SID.to_string(),
                rows: 40,
                cols: 120,
            }
        );
    }

    #[test]
    fn register_carries_runner_identity() {
        let msg = ControlMessage::Register {
            runner_id: "alpha".to_string(),
            token: "dev-token".to_string(),
        };
        let json = msg.to_json();
        assert_eq!(
            json,
            r#"{"type":"register","payload":{"runner_id":"alpha","token":"dev-token"}}"#
        );
        assert_eq!(ControlMessage::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn error_omits_absent_fields() {
        let msg = ControlMessage::Error {
            message: "spawn failed".to_string(),
            code: None,
            session_id: None,
        };
        assert_eq!(
            msg.to_json(),
            r#"{"type":"error","payload":{"message":"spawn failed"}}"#
        );
        assert_eq!(msg.session_id(), None);

        let scoped = ControlMessage::Error {
            message: "spawn failed".to_string(),
            code: None,
            session_id: Some(SID.to_string()),
        };
        assert_eq!(scoped.session_id(), Some(SID));
        assert_eq!(
            ControlMessage::from_json(&scoped.to_json()).unwrap(),
            scoped
        );
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        assert!(ControlMessage::from_json(r#"{"type":"nonsense","payload":{}}"#).is_err());
        assert!(ControlMessage::from_json("not json").is_err());
    }

    #[test]
    fn frame_round_trip() {
        let frame = encode_frame(SID, b"hello from a pty");
        assert_eq!(frame.len(), SESSION_ID_LEN + 16);
        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, SID);
        assert_eq!(payload, b"hello from a pty");
    }

    #[test]
    fn short_ids_are_padded_and_trimmed() {
        let frame = encode_frame("S", b"x");
        assert_eq!(frame.len(), SESSION_ID_LEN + 1);
        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, "S");
        assert_eq!(payload, b"x");
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(decode_frame(&[0u8; SESSION_ID_LEN - 1]).is_none());
        assert!(decode_frame(b"").is_none());
        // Exactly the header with no payload is still a valid (empty) frame.
        let frame = encode_frame(SID, b"");
        let (id, payload) = decode_frame(&frame).unwrap();
        assert_eq!(id, SID);
        assert!(payload.is_empty());
    }

    #[test]
    fn empty_command_survives_the_wire() {
        let msg = ControlMessage::StartSession {
            session_id: SID.to_string(),
            command: vec![],
        };
        let parsed = ControlMessage::from_json(&msg.to_json()).unwrap();
        match parsed {
            ControlMessage::StartSession { command, .. } => assert!(command.is_empty()),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
