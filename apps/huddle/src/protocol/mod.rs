//! Signaling envelope and the payload catalogue carried over the brokers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use time::OffsetDateTime;

use crate::transport::rtc::{IceCandidate, SessionDescription};

pub mod dedup;
pub mod messages;

pub use messages::{
    Announce, Empty, HandRaise, MediaState, MuteAllRequest, MuteAllResponse, RemoteMicRequest,
    RemoteMicResponse, RemoteMicSignal, RemoteMicStop, RoomLock, RoomLockedNotice,
};

pub const PROTOCOL_VERSION: u8 = 1;

/// Older clients announce a locked room with this bare type.
const LEGACY_ROOM_LOCKED: &str = "room-locked";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid envelope json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    #[serde(rename = "announce")]
    Announce(Announce),
    #[serde(rename = "offer")]
    Offer(SessionDescription),
    #[serde(rename = "answer")]
    Answer(SessionDescription),
    #[serde(rename = "ice-candidate")]
    IceCandidate(IceCandidate),
    #[serde(rename = "heartbeat")]
    Heartbeat(Empty),
    #[serde(rename = "leave")]
    Leave(Empty),
    #[serde(rename = "peer-state")]
    PeerState(MediaState),
    #[serde(rename = "mod_room_lock")]
    RoomLock(RoomLock),
    #[serde(rename = "mod_room_locked_notice")]
    RoomLockedNotice(RoomLockedNotice),
    #[serde(rename = "mod_mute_all_request")]
    MuteAllRequest(MuteAllRequest),
    #[serde(rename = "mod_mute_all_response")]
    MuteAllResponse(MuteAllResponse),
    #[serde(rename = "mod_hand_raise")]
    HandRaise(HandRaise),
    #[serde(rename = "rm_request")]
    RemoteMicRequest(RemoteMicRequest),
    #[serde(rename = "rm_response")]
    RemoteMicResponse(RemoteMicResponse),
    #[serde(rename = "rm_start")]
    RemoteMicStart(RemoteMicSignal),
    #[serde(rename = "rm_heartbeat")]
    RemoteMicHeartbeat(RemoteMicSignal),
    #[serde(rename = "rm_stop")]
    RemoteMicStop(RemoteMicStop),
}

impl Payload {
    pub const KINDS: &'static [&'static str] = &[
        "announce",
        "offer",
        "answer",
        "ice-candidate",
        "heartbeat",
        "leave",
        "peer-state",
        "mod_room_lock",
        "mod_room_locked_notice",
        "mod_mute_all_request",
        "mod_mute_all_response",
        "mod_hand_raise",
        "rm_request",
        "rm_response",
        "rm_start",
        "rm_heartbeat",
        "rm_stop",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Announce(_) => "announce",
            Payload::Offer(_) => "offer",
            Payload::Answer(_) => "answer",
            Payload::IceCandidate(_) => "ice-candidate",
            Payload::Heartbeat(_) => "heartbeat",
            Payload::Leave(_) => "leave",
            Payload::PeerState(_) => "peer-state",
            Payload::RoomLock(_) => "mod_room_lock",
            Payload::RoomLockedNotice(_) => "mod_room_locked_notice",
            Payload::MuteAllRequest(_) => "mod_mute_all_request",
            Payload::MuteAllResponse(_) => "mod_mute_all_response",
            Payload::HandRaise(_) => "mod_hand_raise",
            Payload::RemoteMicRequest(_) => "rm_request",
            Payload::RemoteMicResponse(_) => "rm_response",
            Payload::RemoteMicStart(_) => "rm_start",
            Payload::RemoteMicHeartbeat(_) => "rm_heartbeat",
            Payload::RemoteMicStop(_) => "rm_stop",
        }
    }

    fn from_parts(kind: &str, data: Value) -> Result<Self, ProtocolError> {
        let kind = if kind == LEGACY_ROOM_LOCKED {
            "mod_room_locked_notice"
        } else {
            kind
        };
        if !Self::KINDS.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }
        let data = match data {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        serde_json::from_value(json!({ "type": kind, "data": data })).map_err(|source| {
            ProtocolError::Malformed {
                kind: kind.to_string(),
                source,
            }
        })
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("data")
            .map(Value::take)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: u8,
    pub from: String,
    pub to: Option<String>,
    pub session_id: u32,
    pub msg_id: String,
    pub ts: Option<u64>,
    pub payload: Payload,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    v: u8,
    #[serde(rename = "type")]
    kind: String,
    from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    session_id: u32,
    msg_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ts: Option<u64>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        let wire = WireEnvelope {
            v: self.version,
            kind: self.payload.kind().to_string(),
            from: self.from.clone(),
            to: self.to.clone(),
            session_id: self.session_id,
            msg_id: self.msg_id.clone(),
            ts: self.ts,
            data: self.payload.data()?,
        };
        serde_json::to_vec(&wire).map(Bytes::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_slice(bytes)?;
        if wire.v != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(wire.v));
        }
        let payload = Payload::from_parts(&wire.kind, wire.data)?;
        Ok(Self {
            version: wire.v,
            from: wire.from,
            to: wire.to,
            session_id: wire.session_id,
            msg_id: wire.msg_id,
            ts: wire.ts,
            payload,
        })
    }

    /// Whether a receiver with `local_id` should process this envelope at all.
    pub fn is_for(&self, local_id: &str) -> bool {
        self.from != local_id && self.to.as_deref().is_none_or(|to| to == local_id)
    }
}

pub fn unix_millis() -> u64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(payload: Payload) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            from: "peer-b".into(),
            to: Some("peer-a".into()),
            session_id: 7,
            msg_id: "00000007-1".into(),
            ts: Some(1_700_000_000_000),
            payload,
        }
    }

    #[test]
    fn encodes_wire_field_names() {
        let bytes = envelope(Payload::RoomLock(RoomLock {
            locked: true,
            locked_by_peer_id: "peer-b".into(),
            ts: 5,
        }))
        .encode()
        .expect("encode");
        let value: Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["v"], 1);
        assert_eq!(value["type"], "mod_room_lock");
        assert_eq!(value["from"], "peer-b");
        assert_eq!(value["sessionId"], 7);
        assert_eq!(value["msgId"], "00000007-1");
        assert_eq!(value["data"]["lockedByPeerId"], "peer-b");
    }

    #[test]
    fn decodes_heartbeat_without_data() {
        let raw = br#"{"v":1,"type":"heartbeat","from":"x","sessionId":1,"msgId":"1-1"}"#;
        let decoded = Envelope::decode(raw).expect("decode");
        assert_eq!(decoded.payload, Payload::Heartbeat(Empty {}));
        assert_eq!(decoded.to, None);
    }

    #[test]
    fn legacy_room_locked_maps_to_notice() {
        let raw = br#"{"v":1,"type":"room-locked","from":"host","sessionId":1,"msgId":"1-2","data":{"lockedByPeerId":"host"}}"#;
        let decoded = Envelope::decode(raw).expect("decode");
        assert_eq!(
            decoded.payload,
            Payload::RoomLockedNotice(RoomLockedNotice {
                locked_by_peer_id: "host".into(),
                ts: None,
            })
        );
    }

    #[test]
    fn rejects_unknown_type_and_version() {
        let unknown = br#"{"v":1,"type":"teleport","from":"x","sessionId":1,"msgId":"1-1","data":{}}"#;
        assert!(matches!(
            Envelope::decode(unknown),
            Err(ProtocolError::UnknownType(kind)) if kind == "teleport"
        ));

        let future = br#"{"v":2,"type":"heartbeat","from":"x","sessionId":1,"msgId":"1-1"}"#;
        assert!(matches!(
            Envelope::decode(future),
            Err(ProtocolError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_malformed_payload() {
        let raw = br#"{"v":1,"type":"mod_hand_raise","from":"x","sessionId":1,"msgId":"1-1","data":{"raised":"yes"}}"#;
        assert!(matches!(
            Envelope::decode(raw),
            Err(ProtocolError::Malformed { kind, .. }) if kind == "mod_hand_raise"
        ));
        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn offer_survives_the_wire() {
        let original = envelope(Payload::Offer(SessionDescription::offer("v=0\r\n")));
        let decoded = Envelope::decode(&original.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn addressing_filters_self_and_other_targets() {
        let mut env = envelope(Payload::Heartbeat(Empty {}));
        assert!(env.is_for("peer-a"));
        assert!(!env.is_for("peer-c"));
        assert!(!env.is_for("peer-b"));
        env.to = None;
        assert!(env.is_for("peer-c"));
    }

    #[test]
    fn announce_reply_flag_is_optional() {
        let plain = Payload::Announce(Announce {
            name: "Ana".into(),
            platform: "linux".into(),
            reply: false,
        });
        let value: Value = serde_json::from_slice(&envelope(plain).encode().expect("encode"))
            .expect("json");
        assert!(value["data"].get("reply").is_none());

        let raw = br#"{"v":1,"type":"announce","from":"x","sessionId":1,"msgId":"1-1","data":{"name":"X","platform":"web"}}"#;
        let Payload::Announce(announce) = Envelope::decode(raw).expect("decode").payload else {
            panic!("expected announce");
        };
        assert!(!announce.reply);
    }

    #[test]
    fn kind_catalogue_matches_variants() {
        let sample = Payload::RemoteMicStop(RemoteMicStop {
            request_id: "r".into(),
            reason: "done".into(),
            ts: 1,
        });
        assert!(Payload::KINDS.contains(&sample.kind()));
        assert_eq!(Payload::KINDS.len(), 17);
    }
}
