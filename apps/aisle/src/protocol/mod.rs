use serde::{Deserialize, Serialize};

/// Video capture mode attached to outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoMode {
    Camera,
    Screen,
}

impl VideoMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoMode::Camera => "camera",
            VideoMode::Screen => "screen",
        }
    }
}

/// Messages the engine sends to the agent service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Text {
        data: String,
    },
    Audio {
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
    Video {
        data: String,
        mode: VideoMode,
        mime: String,
    },
    Control {
        action: ControlAction,
    },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Interrupt,
}

/// Messages the agent service sends back over the socket.
///
/// The service still emits the legacy `ready` tag alongside `agent_ready`;
/// both mark the handshake complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionId {
        data: String,
    },
    #[serde(alias = "ready")]
    AgentReady,
    UserInput {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
    Text {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
    Audio {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
    TurnComplete,
    Interrupted,
    Error {
        #[serde(default)]
        data: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_legacy_ready_tag() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert_eq!(msg, ServerMessage::AgentReady);
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"agent_ready"}"#).unwrap();
        assert_eq!(msg, ServerMessage::AgentReady);
    }

    #[test]
    fn decodes_text_delta_with_event_id() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"text","data":"Hel","event_id":"ev-1"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::Text {
                data: "Hel".into(),
                event_id: Some("ev-1".into()),
            }
        );
    }

    #[test]
    fn decodes_user_input_without_event_id() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"user_input","data":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::UserInput {
                data: "abc".into(),
                event_id: None,
            }
        );
    }

    #[test]
    fn encodes_ping_as_bare_type() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn encodes_interrupt_control() {
        let json = serde_json::to_string(&ClientMessage::Control {
            action: ControlAction::Interrupt,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"control","action":"interrupt"}"#);
    }

    #[test]
    fn encodes_video_frame_with_mode() {
        let json = serde_json::to_string(&ClientMessage::Video {
            data: "AAAA".into(),
            mode: VideoMode::Screen,
            mime: "image/jpeg".into(),
        })
        .unwrap();
        assert!(json.contains(r#""mode":"screen""#));
        assert!(json.contains(r#""mime":"image/jpeg""#));
    }
}
