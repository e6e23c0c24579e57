// =============================================================================
// Wire protocol — frames, control messages, handshake
// =============================================================================
//
// Server frames are `{type, sequence, data}` with
// `type ∈ {snapshot, delta, error, pong, ack}`. The same schema is emitted in
// both wire formats: JSON text frames or MessagePack binary frames
// (`rmp_serde::to_vec_named`, so field names and ordering match JSON).
//
// Client control messages are `{action, channels?, symbols?}` with
// `action ∈ {subscribe, unsubscribe, ping, pong}`.
// =============================================================================

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::differ::Change;
use crate::error::HubError;
use crate::projection::Projection;
use crate::types::{Channel, ClientKind, WireFormat};

// ── Error codes carried in error frames ──────────────────────────────────────

/// Malformed or unparseable control frame.
pub const ERR_BAD_CONTROL: u16 = 4400;
/// Inbound frame exceeded `ws.max_message_bytes`.
pub const ERR_OVERSIZED: u16 = 4413;

// =============================================================================
// Server → client
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u16,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AckBody {
    pub action: String,
}

/// One outbound frame. Every variant carries the state-store sequence at
/// which its payload was taken.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot { sequence: u64, data: Projection },
    Delta { sequence: u64, data: Vec<Change> },
    Error { sequence: u64, data: ErrorBody },
    Pong { sequence: u64 },
    Ack { sequence: u64, data: AckBody },
}

impl ServerMessage {
    pub fn error(sequence: u64, code: u16, message: impl Into<String>) -> Self {
        Self::Error {
            sequence,
            data: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn ack(sequence: u64, action: &str) -> Self {
        Self::Ack {
            sequence,
            data: AckBody {
                action: action.to_string(),
            },
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Self::Snapshot { sequence, .. }
            | Self::Delta { sequence, .. }
            | Self::Error { sequence, .. }
            | Self::Pong { sequence }
            | Self::Ack { sequence, .. } => *sequence,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Delta { .. } => "delta",
            Self::Error { .. } => "error",
            Self::Pong { .. } => "pong",
            Self::Ack { .. } => "ack",
        }
    }

    /// Encode for the session's negotiated wire format.
    pub fn encode(&self, format: WireFormat) -> Result<Message, HubError> {
        match format {
            WireFormat::Json => serde_json::to_string(self)
                .map(Message::Text)
                .map_err(|e| HubError::ClientProtocol(format!("json encode failed: {e}"))),
            WireFormat::CompactBinary => rmp_serde::to_vec_named(self)
                .map(Message::Binary)
                .map_err(|e| HubError::ClientProtocol(format!("msgpack encode failed: {e}"))),
        }
    }
}

// =============================================================================
// Client → server
// =============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default)]
        channels: Vec<Channel>,
        #[serde(default)]
        symbols: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        channels: Vec<Channel>,
    },
    Ping,
    Pong,
}

/// Parse a control frame from either wire format.
pub fn parse_client_message(format: WireFormat, payload: &[u8]) -> Result<ClientMessage, HubError> {
    match format {
        WireFormat::Json => serde_json::from_slice(payload)
            .map_err(|e| HubError::ClientProtocol(format!("bad control frame: {e}"))),
        WireFormat::CompactBinary => rmp_serde::from_slice(payload)
            .map_err(|e| HubError::ClientProtocol(format!("bad control frame: {e}"))),
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// Raw query parameters presented at upgrade time.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub format: Option<String>,
    pub key: Option<String>,
    pub user: Option<String>,
}

/// Validated handshake result.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub kind: ClientKind,
    pub format: WireFormat,
    pub user_tag: Option<String>,
}

/// Validate the handshake query. Absent parameters fall back to a web/json
/// session; present-but-unknown values are rejected.
pub fn parse_handshake(query: &HandshakeQuery) -> Result<Handshake, HubError> {
    let kind = match query.kind.as_deref() {
        None => ClientKind::Web,
        Some(raw) => ClientKind::parse(raw)
            .ok_or_else(|| HubError::ClientProtocol(format!("unknown client type {raw:?}")))?,
    };
    let format = match query.format.as_deref() {
        None => WireFormat::Json,
        Some(raw) => WireFormat::parse(raw)
            .ok_or_else(|| HubError::ClientProtocol(format!("unknown wire format {raw:?}")))?,
    };
    Ok(Handshake {
        kind,
        format,
        user_tag: query.user.clone(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_frame_shape() {
        let msg = ServerMessage::Snapshot {
            sequence: 42,
            data: Projection::default(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["sequence"], 42);
        assert!(json["data"]["market_data"].is_object());
    }

    #[test]
    fn error_frame_carries_code_and_message() {
        let msg = ServerMessage::error(7, ERR_BAD_CONTROL, "bad control frame");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], 4400);
        assert_eq!(json["data"]["message"], "bad control frame");
    }

    #[test]
    fn delta_frame_is_empty_array_when_no_changes() {
        let msg = ServerMessage::Delta {
            sequence: 3,
            data: vec![],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["data"], serde_json::json!([]));
    }

    #[test]
    fn subscribe_control_parses() {
        let raw = br#"{"action":"subscribe","channels":["orders","positions"],"symbols":["BTCUSDT"]}"#;
        let msg = parse_client_message(WireFormat::Json, raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                channels: vec![Channel::Orders, Channel::Positions],
                symbols: vec!["BTCUSDT".to_string()],
            }
        );
    }

    #[test]
    fn ping_control_parses_without_fields() {
        let msg = parse_client_message(WireFormat::Json, br#"{"action":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);
    }

    #[test]
    fn unknown_action_is_a_client_protocol_error() {
        let err = parse_client_message(WireFormat::Json, br#"{"action":"replay"}"#).unwrap_err();
        assert!(matches!(err, HubError::ClientProtocol(_)));
    }

    #[test]
    fn unknown_channel_is_a_client_protocol_error() {
        let raw = br#"{"action":"subscribe","channels":["trades"]}"#;
        assert!(parse_client_message(WireFormat::Json, raw).is_err());
    }

    #[test]
    fn handshake_defaults_to_web_json() {
        let hs = parse_handshake(&HandshakeQuery::default()).unwrap();
        assert_eq!(hs.kind, ClientKind::Web);
        assert_eq!(hs.format, WireFormat::Json);
        assert_eq!(hs.user_tag, None);
    }

    #[test]
    fn handshake_rejects_unknown_values() {
        let query = HandshakeQuery {
            kind: Some("desktop".to_string()),
            ..Default::default()
        };
        assert!(parse_handshake(&query).is_err());

        let query = HandshakeQuery {
            format: Some("protobuf".to_string()),
            ..Default::default()
        };
        assert!(parse_handshake(&query).is_err());
    }

    #[test]
    fn handshake_accepts_full_query() {
        let query = HandshakeQuery {
            kind: Some("tui".to_string()),
            format: Some("compact-binary".to_string()),
            key: Some("secret".to_string()),
            user: Some("ops-desk".to_string()),
        };
        let hs = parse_handshake(&query).unwrap();
        assert_eq!(hs.kind, ClientKind::Tui);
        assert_eq!(hs.format, WireFormat::CompactBinary);
        assert_eq!(hs.user_tag.as_deref(), Some("ops-desk"));
    }

    #[test]
    fn both_formats_encode_the_same_schema() {
        let msg = ServerMessage::Pong { sequence: 9 };

        let json = match msg.encode(WireFormat::Json).unwrap() {
            Message::Text(t) => serde_json::from_str::<serde_json::Value>(&t).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        };

        let packed = match msg.encode(WireFormat::CompactBinary).unwrap() {
            Message::Binary(b) => rmp_serde::from_slice::<serde_json::Value>(&b).unwrap(),
            other => panic!("expected binary frame, got {other:?}"),
        };

        assert_eq!(json, packed);
        assert_eq!(json["type"], "pong");
        assert_eq!(json["sequence"], 9);
    }
}
