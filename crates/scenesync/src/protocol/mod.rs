//! Envelope protocol spoken between relay and clients.
//!
//! Every frame is a JSON object `{"cmd": ..., "val": ...}`. Both directions are
//! closed enums so dispatch happens once, at the transport boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier the relay assigns to a connected client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// World-space pose of a head or controller
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseRecord {
    pub pos: [f64; 3],
    pub quat: [f64; 4],
}

impl PoseRecord {
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Self {
            pos: [x, y, z],
            quat: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Default for PoseRecord {
    fn default() -> Self {
        Self::at(0.0, 0.0, 0.0)
    }
}

/// High-frequency, non-authoritative state of one client
///
/// Index 0 of `poses` is the head. Later entries are controllers; `None` means
/// that controller is inactive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatileState {
    pub poses: Vec<Option<PoseRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
}

impl VolatileState {
    pub fn head(&self) -> Option<&PoseRecord> {
        self.poses.first().and_then(|pose| pose.as_ref())
    }
}

impl Default for VolatileState {
    fn default() -> Self {
        Self {
            poses: vec![Some(PoseRecord::default())],
            scale: None,
        }
    }
}

/// Persistent per-user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    #[serde(rename = "displayName")]
    pub display_name: String,
    #[serde(rename = "colorTriplet")]
    pub color: [f32; 3],
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            display_name: "Anonymous".to_string(),
            color: [1.0, 1.0, 1.0],
        }
    }
}

/// Volatile state tagged with the member it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerVolatile {
    pub id: SessionId,
    #[serde(flatten)]
    pub state: VolatileState,
}

/// Everything a newly joined client needs to know about an existing member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub volatile: PeerVolatile,
    pub user: UserProfile,
}

/// Messages sent from client to relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "val", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Replace the sender's persistent profile
    User(UserProfile),
    /// Replace the sender's volatile state
    Pose(VolatileState),
    /// CRDT sync message toward the room document
    Sync(Vec<u8>),
}

/// Messages sent from relay to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "val", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Id assignment plus the members already in the room
    Handshake {
        id: SessionId,
        others: Vec<PeerSummary>,
    },
    /// Full snapshot of the room document
    Project(Vec<u8>),
    /// A member joined or changed its profile
    User { id: SessionId, user: UserProfile },
    /// Per-tick pose batch, one entry per other member
    Others(Vec<PeerVolatile>),
    /// A member left the room
    Exit(SessionId),
    /// Administrative forced reload
    Reload,
    /// CRDT sync message from the room document
    Sync(Vec<u8>),
}

impl ServerMessage {
    /// Short command name, for logging
    pub fn cmd(&self) -> &'static str {
        match self {
            ServerMessage::Handshake { .. } => "handshake",
            ServerMessage::Project(_) => "project",
            ServerMessage::User { .. } => "user",
            ServerMessage::Others(_) => "others",
            ServerMessage::Exit(_) => "exit",
            ServerMessage::Reload => "reload",
            ServerMessage::Sync(_) => "sync",
        }
    }
}

/// Serialize a message into a text frame
pub fn encode_message<T: Serialize>(message: &T) -> crate::SyncResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a text frame into a message
///
/// Unknown commands and shape mismatches surface as protocol errors.
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &str) -> crate::SyncResult<T> {
    serde_json::from_str(data).map_err(|e| crate::SyncError::Protocol {
        message: format!("Malformed envelope: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_user_message_uses_wire_field_names() {
        let raw = r#"{"cmd":"user","val":{"displayName":"Ann","colorTriplet":[1,0,0]}}"#;
        let message: ClientMessage = decode_message(raw).unwrap();

        assert_eq!(
            message,
            ClientMessage::User(UserProfile {
                display_name: "Ann".to_string(),
                color: [1.0, 0.0, 0.0],
            })
        );
    }

    #[test]
    fn test_pose_with_inactive_controller() {
        let raw = json!({
            "cmd": "pose",
            "val": {
                "poses": [
                    {"pos": [0, 1.6, 0], "quat": [0, 0, 0, 1]},
                    null,
                    {"pos": [0.2, 1.0, 0.1], "quat": [0, 0, 0, 1]}
                ]
            }
        })
        .to_string();

        let message: ClientMessage = decode_message(&raw).unwrap();
        let ClientMessage::Pose(state) = message else {
            panic!("Expected pose message");
        };

        assert_eq!(state.poses.len(), 3);
        assert!(state.poses[1].is_none());
        assert_eq!(state.head().unwrap().pos, [0.0, 1.6, 0.0]);
        assert_eq!(state.scale, None);
    }

    #[test]
    fn test_sync_payload_travels_as_byte_array() {
        let encoded = encode_message(&ClientMessage::Sync(vec![128, 255, 0])).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value, json!({"cmd": "sync", "val": [128, 255, 0]}));
    }

    #[test]
    fn test_unknown_command_is_protocol_error() {
        let result = decode_message::<ClientMessage>(r#"{"cmd":"dance","val":1}"#);
        assert!(matches!(result, Err(crate::SyncError::Protocol { .. })));

        let result = decode_message::<ClientMessage>("not json");
        assert!(matches!(result, Err(crate::SyncError::Protocol { .. })));
    }

    #[test]
    fn test_server_envelopes() {
        let others = ServerMessage::Others(vec![PeerVolatile {
            id: SessionId::from("u1"),
            state: VolatileState::default(),
        }]);
        let value = serde_json::to_value(&others).unwrap();
        assert_eq!(value["cmd"], "others");
        assert_eq!(value["val"][0]["id"], "u1");
        assert_eq!(value["val"][0]["poses"][0]["quat"], json!([0.0, 0.0, 0.0, 1.0]));

        let exit = serde_json::to_value(ServerMessage::Exit(SessionId::from("u2"))).unwrap();
        assert_eq!(exit, json!({"cmd": "exit", "val": "u2"}));

        let reload: ServerMessage = decode_message(r#"{"cmd":"reload"}"#).unwrap();
        assert_eq!(reload, ServerMessage::Reload);
        assert_eq!(reload.cmd(), "reload");
    }

    #[test]
    fn test_handshake_lists_peer_summaries() {
        let handshake = ServerMessage::Handshake {
            id: SessionId::from("u2"),
            others: vec![PeerSummary {
                volatile: PeerVolatile {
                    id: SessionId::from("u1"),
                    state: VolatileState::default(),
                },
                user: UserProfile::default(),
            }],
        };

        let value = serde_json::to_value(&handshake).unwrap();
        assert_eq!(value["val"]["id"], "u2");
        assert_eq!(value["val"]["others"][0]["volatile"]["id"], "u1");
        assert_eq!(value["val"]["others"][0]["user"]["displayName"], "Anonymous");
    }
}
