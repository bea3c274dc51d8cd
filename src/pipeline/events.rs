//! # Wire Events
//!
//! JSON messages exchanged over the WebSocket.
//!
//! ## Client → Server:
//! `{"type": "start" | "stop" | "reset" | "interrupt"}`
//!
//! ## Server → Client:
//! Every event carries `type` and `session_id`. Transcript events carry a per-session `seq`
//! that increases monotonically together with outbound audio chunks.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Control commands from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Start,
    Stop,
    Reset,
    Interrupt,
}

/// Parse a text frame into a control command.
///
/// Malformed JSON (or JSON without a string `type`) and unknown command names are
/// reported separately so the client gets a precise error.
pub fn parse_control(text: &str) -> Result<ControlMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or_else(|| ProtocolError::Malformed("missing string field 'type'".to_string()))?;

    match kind {
        "start" => Ok(ControlMessage::Start),
        "stop" => Ok(ControlMessage::Stop),
        "reset" => Ok(ControlMessage::Reset),
        "interrupt" => Ok(ControlMessage::Interrupt),
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

/// Values of the `status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Listening,
    Stopped,
}

/// Events sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    PartialTranscript {
        session_id: String,
        content: String,
        seq: u64,
    },
    FinalTranscript {
        session_id: String,
        content: String,
        seq: u64,
    },
    LlmStatus {
        session_id: String,
        status: String,
    },
    /// The reply so far; `is_complete: true` once the model has finished
    LlmResponse {
        session_id: String,
        content: String,
        is_complete: bool,
    },
    /// `is_complete: false` carries the reply so far, `true` one finished sentence
    Subtitle {
        session_id: String,
        content: String,
        is_complete: bool,
    },
    TtsStart {
        session_id: String,
        format: String,
        is_first: bool,
        text: String,
    },
    TtsEnd {
        session_id: String,
    },
    TtsStop {
        session_id: String,
    },
    Status {
        session_id: String,
        status: SessionStatus,
    },
    Error {
        session_id: String,
        message: String,
    },
    StopAcknowledged {
        session_id: String,
        message: String,
        queues_cleared: bool,
    },
    InterruptAcknowledged {
        session_id: String,
    },
}

impl ServerEvent {
    /// The `type` tag, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::PartialTranscript { .. } => "partial_transcript",
            ServerEvent::FinalTranscript { .. } => "final_transcript",
            ServerEvent::LlmStatus { .. } => "llm_status",
            ServerEvent::LlmResponse { .. } => "llm_response",
            ServerEvent::Subtitle { .. } => "subtitle",
            ServerEvent::TtsStart { .. } => "tts_start",
            ServerEvent::TtsEnd { .. } => "tts_end",
            ServerEvent::TtsStop { .. } => "tts_stop",
            ServerEvent::Status { .. } => "status",
            ServerEvent::Error { .. } => "error",
            ServerEvent::StopAcknowledged { .. } => "stop_acknowledged",
            ServerEvent::InterruptAcknowledged { .. } => "interrupt_acknowledged",
        }
    }

    pub fn to_json(&self) -> String {
        // Only strings, bools and integers, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_commands() {
        assert_eq!(parse_control(r#"{"type":"start"}"#), Ok(ControlMessage::Start));
        assert_eq!(parse_control(r#"{"type":"interrupt","extra":1}"#), Ok(ControlMessage::Interrupt));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(parse_control("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(parse_control(r#"{"kind":"start"}"#), Err(ProtocolError::Malformed(_))));
        assert_eq!(
            parse_control(r#"{"type":"dance"}"#),
            Err(ProtocolError::UnknownCommand("dance".into()))
        );
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ServerEvent::StopAcknowledged {
            session_id: "s1".into(),
            message: "All processing stopped".into(),
            queues_cleared: true,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "stop_acknowledged",
                "session_id": "s1",
                "message": "All processing stopped",
                "queues_cleared": true
            })
        );

        let status = ServerEvent::Status {
            session_id: "s1".into(),
            status: SessionStatus::Listening,
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({"type": "status", "session_id": "s1", "status": "listening"})
        );
    }

    #[test]
    fn test_kind_matches_tag() {
        let events = [
            ServerEvent::InterruptAcknowledged { session_id: "s".into() },
            ServerEvent::Subtitle {
                session_id: "s".into(),
                content: "Hello there.".into(),
                is_complete: true,
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.kind());
        }
    }
}
