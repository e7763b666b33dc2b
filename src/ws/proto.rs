//! Wire vocabulary: the tagged envelope plus the event and command shapes
//! exchanged with controllers.
//!
//! Every frame is `{"type": "<kind>", "data": {...}}`. Events serialize from
//! one sum type; commands arrive as an envelope whose payload is decoded per
//! kind so an unknown or malformed command never tears the connection down.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub const CMD_START_DEBUG: &str = "startDebug";
pub const CMD_SET_BREAKPOINT: &str = "setBreakpoint";
pub const CMD_CONTINUE: &str = "continue";
pub const CMD_STEP_OVER: &str = "stepOver";
pub const CMD_EXIT: &str = "exit";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing payload for `{0}`")]
    MissingPayload(String),
    #[error("malformed payload for `{0}`: {1}")]
    MalformedPayload(String, #[source] serde_json::Error),
}

/// Tagged message envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl Envelope {
    /// Build a command envelope; controllers and tests compose frames with it.
    pub fn command<T: Serialize>(kind: &str, payload: &T) -> serde_json::Result<Envelope> {
        let raw = serde_json::to_string(payload)?;
        Ok(Envelope {
            kind: kind.to_string(),
            data: Some(RawValue::from_string(raw)?),
        })
    }

    /// Decode the payload into the shape the envelope's kind calls for.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| ProtocolError::MissingPayload(self.kind.clone()))?;
        serde_json::from_str(data.get())
            .map_err(|e| ProtocolError::MalformedPayload(self.kind.clone(), e))
    }
}

/// Controller-visible session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Ready,
    Executing,
    Breakpoint,
}

/// Server → controller messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    SessionStarted {
        session_id: String,
        pid: i32,
    },
    StateUpdate {
        session_id: String,
        new_state: SessionState,
    },
    InitialBreakpoint {
        session_id: String,
        pid: i32,
    },
    BreakpointHit {
        session_id: String,
        pid: i32,
        filename: String,
        line: u64,
        function: String,
    },
}

// Controller → server payloads, one per command kind.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDebugCmd {
    pub session_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointCmd {
    pub session_id: String,
    pub filename: String,
    pub line: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueCmd {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOverCmd {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitCmd {
    pub session_id: String,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_wire_shapes() {
        let started = Event::SessionStarted {
            session_id: "abc".to_string(),
            pid: 0,
        };
        assert_eq!(
            serde_json::to_string(&started).unwrap(),
            r#"{"type":"sessionStarted","data":{"sessionId":"abc","pid":0}}"#
        );

        let state = Event::StateUpdate {
            session_id: "abc".to_string(),
            new_state: SessionState::Executing,
        };
        assert_eq!(
            serde_json::to_string(&state).unwrap(),
            r#"{"type":"stateUpdate","data":{"sessionId":"abc","newState":"executing"}}"#
        );

        let hit = Event::BreakpointHit {
            session_id: "abc".to_string(),
            pid: 42,
            filename: "main.c".to_string(),
            line: 9,
            function: "main".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&hit).unwrap(),
            r#"{"type":"breakpointHit","data":{"sessionId":"abc","pid":42,"filename":"main.c","line":9,"function":"main"}}"#
        );

        let initial = Event::InitialBreakpoint {
            session_id: "abc".to_string(),
            pid: 42,
        };
        assert_eq!(
            serde_json::to_string(&initial).unwrap(),
            r#"{"type":"initialBreakpoint","data":{"sessionId":"abc","pid":42}}"#
        );
    }

    #[test]
    fn test_event_round_trip() {
        let event = Event::BreakpointHit {
            session_id: "s".to_string(),
            pid: 7,
            filename: "demo.c".to_string(),
            line: 3,
            function: "work".to_string(),
        };
        let frame = serde_json::to_string(&event).unwrap();
        assert_eq!(serde_json::from_str::<Event>(&frame).unwrap(), event);
    }

    #[test]
    fn test_command_envelope_decoding() {
        let raw = r#"{"type":"setBreakpoint","data":{"sessionId":"s","filename":"main.c","line":9}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, CMD_SET_BREAKPOINT);
        let cmd: SetBreakpointCmd = envelope.decode().unwrap();
        assert_eq!(
            cmd,
            SetBreakpointCmd {
                session_id: "s".to_string(),
                filename: "main.c".to_string(),
                line: 9
            }
        );
    }

    #[test]
    fn test_command_envelope_builder() {
        let envelope = Envelope::command(
            CMD_START_DEBUG,
            &StartDebugCmd {
                session_id: "s".to_string(),
                target_path: "./demo".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            serde_json::to_string(&envelope).unwrap(),
            r#"{"type":"startDebug","data":{"sessionId":"s","targetPath":"./demo"}}"#
        );
    }

    #[test]
    fn test_wrong_payload_shape_is_a_protocol_error() {
        let raw = r#"{"type":"setBreakpoint","data":{"sessionId":"s"}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            envelope.decode::<SetBreakpointCmd>(),
            Err(ProtocolError::MalformedPayload(_, _))
        ));

        let raw = r#"{"type":"continue"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert!(matches!(
            envelope.decode::<ContinueCmd>(),
            Err(ProtocolError::MissingPayload(_))
        ));
    }
}
