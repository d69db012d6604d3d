use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Audio constants ──

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: u16 = 1; // mono
pub const FRAME_SIZE: usize = 960; // 20ms at 48kHz

// ── Public STUN servers (no TURN relay) ──

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

// ── Role ──

/// What a participant may do on a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listen only. Never touches the microphone.
    Audience,
    Actor,
    /// Speaks like an actor and manages stages.
    Director,
}

impl Role {
    pub fn captures_audio(self) -> bool {
        !matches!(self, Role::Audience)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Audience => "audience",
            Role::Actor => "actor",
            Role::Director => "director",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audience" => Ok(Role::Audience),
            "actor" => Ok(Role::Actor),
            "director" => Ok(Role::Director),
            other => Err(format!(
                "unknown role '{other}' (expected audience, actor or director)"
            )),
        }
    }
}

// ── Identity ──

/// Identity the signaling server assigns once the channel is open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Session description / ICE payloads ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
    #[serde(
        rename = "profileType",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub profile_type: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

// ── Signaling protocol messages ──

/// A control message on the signaling channel.
///
/// On the wire every message is a JSON object `{type, from?, data?}`; the
/// shape of `data` depends on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub enum SignalMessage {
    ClientId(ClientId),
    Offer {
        from: Option<ClientId>,
        description: SessionDescription,
    },
    Answer {
        description: SessionDescription,
    },
    IceCandidate {
        from: Option<ClientId>,
        candidate: IceCandidate,
    },
    Disconnect {
        from: Option<ClientId>,
    },
    Error {
        message: String,
    },
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::ClientId(_) => "client-id",
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
            SignalMessage::Disconnect { .. } => "disconnect",
            SignalMessage::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<ClientId>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    data: serde_json::Value,
}

impl TryFrom<WireMessage> for SignalMessage {
    type Error = String;

    fn try_from(wire: WireMessage) -> Result<Self, String> {
        let WireMessage { kind, from, data } = wire;
        let parse_err = |e: serde_json::Error| format!("bad '{kind}' payload: {e}");
        let msg = match kind.as_str() {
            "client-id" => match data {
                serde_json::Value::String(id) => SignalMessage::ClientId(ClientId(id)),
                other => return Err(format!("bad 'client-id' payload: {other}")),
            },
            "offer" => SignalMessage::Offer {
                from,
                description: serde_json::from_value(data).map_err(parse_err)?,
            },
            "answer" => SignalMessage::Answer {
                description: serde_json::from_value(data).map_err(parse_err)?,
            },
            "ice-candidate" => SignalMessage::IceCandidate {
                from,
                candidate: serde_json::from_value(data).map_err(parse_err)?,
            },
            "disconnect" => SignalMessage::Disconnect { from },
            "error" => SignalMessage::Error {
                message: match data {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                },
            },
            other => return Err(format!("unknown signal type '{other}'")),
        };
        Ok(msg)
    }
}

impl From<SignalMessage> for WireMessage {
    fn from(msg: SignalMessage) -> Self {
        let kind = msg.kind().to_string();
        let (from, data) = match msg {
            SignalMessage::ClientId(id) => (None, serde_json::Value::String(id.0)),
            SignalMessage::Offer { from, description } => (from, to_value(&description)),
            SignalMessage::Answer { description } => (None, to_value(&description)),
            SignalMessage::IceCandidate { from, candidate } => (from, to_value(&candidate)),
            SignalMessage::Disconnect { from } => (from, serde_json::Value::Null),
            SignalMessage::Error { message } => (None, serde_json::Value::String(message)),
        };
        WireMessage { kind, from, data }
    }
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    // Plain structs with string keys always serialize.
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

// ── Peer connection state ──

/// Latest ICE connection state of the peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }

    /// States that end the session.
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Audio device info (for mic selector) ──

#[derive(Debug, Clone, Serialize)]
pub struct AudioDevice {
    pub name: String,
    pub is_default: bool,
}

// ── Encoded audio frame (mic → network) ──

#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
}

// ── Decoded audio frame (network → speaker) ──

#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub samples: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_client_id() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"client-id","data":"c1"}"#).unwrap();
        assert_eq!(msg, SignalMessage::ClientId(ClientId::from("c1")));
    }

    #[test]
    fn offer_wire_shape_carries_profile_type() {
        let msg = SignalMessage::Offer {
            from: Some(ClientId::from("c1")),
            description: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0".into(),
                profile_type: Some(Role::Actor),
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "offer",
                "from": "c1",
                "data": { "type": "offer", "sdp": "v=0", "profileType": "actor" }
            })
        );
    }

    #[test]
    fn parses_answer_without_from() {
        let msg: SignalMessage = serde_json::from_str(
            r#"{"type":"answer","data":{"type":"answer","sdp":"v=0\r\n"}}"#,
        )
        .unwrap();
        match msg {
            SignalMessage::Answer { description } => {
                assert_eq!(description.kind, SdpKind::Answer);
                assert_eq!(description.sdp, "v=0\r\n");
                assert_eq!(description.profile_type, None);
            }
            other => panic!("expected answer, got {other:?}"),
        }
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let msg = SignalMessage::IceCandidate {
            from: Some(ClientId::from("c1")),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["data"]["sdpMid"], "0");
        assert_eq!(value["data"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn ice_candidate_accepts_null_mid_and_index() {
        let msg: SignalMessage = serde_json::from_str(
            r#"{"type":"ice-candidate","data":{"candidate":"c","sdpMid":null,"sdpMLineIndex":null}}"#,
        )
        .unwrap();
        let SignalMessage::IceCandidate { from, candidate } = msg else {
            panic!("expected candidate");
        };
        assert_eq!(from, None);
        assert_eq!(candidate.sdp_mid, None);
        assert_eq!(candidate.sdp_mline_index, None);
    }

    #[test]
    fn disconnect_has_no_data_field() {
        let text = serde_json::to_string(&SignalMessage::Disconnect {
            from: Some(ClientId::from("c9")),
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"disconnect","from":"c9"}"#);
    }

    #[test]
    fn server_error_keeps_structured_payloads_as_text() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"error","data":{"code":404}}"#).unwrap();
        assert_eq!(
            msg,
            SignalMessage::Error {
                message: r#"{"code":404}"#.into()
            }
        );
    }

    #[test]
    fn rejects_unknown_type() {
        let err = serde_json::from_str::<SignalMessage>(r#"{"type":"kick"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown signal type"));
    }

    #[test]
    fn role_parsing_and_capture() {
        assert_eq!("Director".parse::<Role>().unwrap(), Role::Director);
        assert!("critic".parse::<Role>().is_err());
        assert!(!Role::Audience.captures_audio());
        assert!(Role::Actor.captures_audio());
    }

    #[test]
    fn only_connected_and_completed_count_as_connected() {
        use PeerConnectionState::*;
        for state in [New, Connecting, Disconnected, Failed, Closed] {
            assert!(!state.is_connected(), "{state}");
        }
        assert!(Connected.is_connected());
        assert!(Completed.is_connected());
    }
}
