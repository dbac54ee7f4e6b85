//! Channel protocol between the in-app runtime and the dev server.
//!
//! Messages travel as the dev server's custom-event envelope, JSON in a
//! text frame:
//!
//! ```text
//! {"type":"custom","event":"foundryvtt-compendium-sync:vtt-update","data":{...}}
//! ```

use crate::document::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Prefix shared by every event name of this protocol.
pub const EVENT_NAMESPACE: &str = "foundryvtt-compendium-sync";

/// Maximum frame size (50MB); larger frames are dropped.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

pub const VTT_UPDATE: &str = "vtt-update";
pub const VTT_DELETE: &str = "vtt-delete";
pub const VTT_UPDATE_RESPONSE: &str = "vtt-update:response";
pub const SYSTEM_UPDATE: &str = "system-update";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Not a custom event: {0}")]
    NotCustom(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid payload for {event}: {reason}")]
    InvalidPayload { event: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Update notification: a flattened root document and its pack directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub json: Record,
    pub dir: String,
}

/// Delete notification for a root document id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub id: String,
    pub dir: String,
}

/// Acknowledgment of a materialized update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub data: UpdatePayload,
}

/// A file changed on disk outside the running application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemUpdate {
    /// Serialized JSON content of the file
    pub json: String,
    /// Milliseconds since Unix epoch
    pub timestamp: u64,
    /// Project-relative path of the file, `/`-separated
    pub file: String,
}

/// Messages sent by the runtime to the dev server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Update(UpdatePayload),
    Delete(DeletePayload),
}

/// Messages sent by the dev server to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    UpdateResponse(UpdateResponse),
    SystemUpdate(SystemUpdate),
}

/// Wire envelope of a custom event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Wrap a payload under a namespaced event name.
    pub fn new(name: &str, data: Value) -> Self {
        Self {
            msg_type: "custom".to_string(),
            event: format!("{}:{}", EVENT_NAMESPACE, name),
            data,
        }
    }

    /// Event name with the namespace stripped, if it is ours.
    pub fn name(&self) -> Option<&str> {
        self.event
            .strip_prefix(EVENT_NAMESPACE)
            .and_then(|rest| rest.strip_prefix(':'))
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Envelope serialization should not fail")
    }

    /// Parse a frame into a custom-event envelope.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(data)
            .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
        if envelope.msg_type != "custom" {
            return Err(ProtocolError::NotCustom(envelope.msg_type));
        }
        Ok(envelope)
    }

    fn payload<T: for<'de> Deserialize<'de>>(self) -> Result<T> {
        serde_json::from_value(self.data).map_err(|e| ProtocolError::InvalidPayload {
            event: self.event,
            reason: e.to_string(),
        })
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).expect("payload serialization should not fail")
}

impl ClientMessage {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Self::Update(payload) => Envelope::new(VTT_UPDATE, to_value(payload)),
            Self::Delete(payload) => Envelope::new(VTT_DELETE, to_value(payload)),
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let name = envelope.name().map(str::to_string);
        match name.as_deref() {
            Some(VTT_UPDATE) => envelope.payload().map(Self::Update),
            Some(VTT_DELETE) => envelope.payload().map(Self::Delete),
            _ => Err(ProtocolError::UnknownEvent(envelope.event)),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_envelope().to_json()
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Self::from_envelope(Envelope::from_json(data)?)
    }
}

impl ServerMessage {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Self::UpdateResponse(payload) => Envelope::new(VTT_UPDATE_RESPONSE, to_value(payload)),
            Self::SystemUpdate(payload) => Envelope::new(SYSTEM_UPDATE, to_value(payload)),
        }
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self> {
        let name = envelope.name().map(str::to_string);
        match name.as_deref() {
            Some(VTT_UPDATE_RESPONSE) => envelope.payload().map(Self::UpdateResponse),
            Some(SYSTEM_UPDATE) => envelope.payload().map(Self::SystemUpdate),
            _ => Err(ProtocolError::UnknownEvent(envelope.event)),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_envelope().to_json()
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Self::from_envelope(Envelope::from_json(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_wire_format() {
        let json = json!({"_id": "abc123", "name": "Goblin"});
        let msg = ClientMessage::Update(UpdatePayload {
            json: json.as_object().unwrap().clone(),
            dir: "monsters".into(),
        });

        let wire: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(wire["type"], "custom");
        assert_eq!(wire["event"], "foundryvtt-compendium-sync:vtt-update");
        assert_eq!(wire["data"]["dir"], "monsters");
        assert_eq!(wire["data"]["json"]["_id"], "abc123");
    }

    #[test]
    fn test_delete_parses_from_wire() {
        let frame = br#"{"type":"custom","event":"foundryvtt-compendium-sync:vtt-delete","data":{"id":"abc123","dir":"monsters"}}"#;
        let msg = ClientMessage::from_json(frame).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Delete(DeletePayload {
                id: "abc123".into(),
                dir: "monsters".into()
            })
        );
    }

    #[test]
    fn test_system_update_wire_format() {
        let msg = ServerMessage::SystemUpdate(SystemUpdate {
            json: r#"{"_id":"abc123"}"#.into(),
            timestamp: 1700000000000,
            file: "data/monsters/Goblin_abc123.json".into(),
        });
        let wire: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(wire["event"], "foundryvtt-compendium-sync:system-update");
        assert_eq!(wire["data"]["timestamp"], 1700000000000u64);
        assert_eq!(ServerMessage::from_json(msg.to_json().as_bytes()).unwrap(), msg);
    }

    #[test]
    fn test_response_event_name() {
        let msg = ServerMessage::UpdateResponse(UpdateResponse {
            data: UpdatePayload {
                json: Record::new(),
                dir: "monsters".into(),
            },
        });
        assert_eq!(
            msg.to_envelope().event,
            "foundryvtt-compendium-sync:vtt-update:response"
        );
    }

    #[test]
    fn test_rejects_foreign_and_unknown_events() {
        let vite = br#"{"type":"update","updates":[]}"#;
        assert!(matches!(
            ClientMessage::from_json(vite),
            Err(ProtocolError::NotCustom(_))
        ));

        let other = br#"{"type":"custom","event":"other-plugin:thing","data":{}}"#;
        assert!(matches!(
            ClientMessage::from_json(other),
            Err(ProtocolError::UnknownEvent(_))
        ));

        assert!(matches!(
            ClientMessage::from_json(b"not json"),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_invalid_payload() {
        let frame = br#"{"type":"custom","event":"foundryvtt-compendium-sync:vtt-delete","data":{"dir":"monsters"}}"#;
        assert!(matches!(
            ClientMessage::from_json(frame),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }
}
