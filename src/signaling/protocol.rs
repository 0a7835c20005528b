//! Wire protocol for the signaling channel
//!
//! Every frame is an [`Envelope`]; `payload` shapes for the recognized
//! message types are the typed structs below, decoded with
//! `serde_json::from_value` at the point of use.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message type tags exchanged with the signaling server
pub mod types {
    /// Request: enter the room named by the join token
    pub const JOIN_ROOM: &str = "join_room";
    /// Request: ask for an offer covering a feed set; reply is [`super::SubscribeReply`]
    pub const SUBSCRIBE: &str = "subscribe";
    /// Fire-and-forget: local answer to a subscribe offer
    pub const SUBSCRIBE_ANSWER: &str = "subscribe_answer";
    /// Request: publish the local offer; reply is [`super::PublishOfferReply`]
    pub const PUBLISH_OFFER: &str = "publish_offer";
    /// Fire-and-forget: locally gathered ICE candidate
    pub const TRICKLE_ICE: &str = "trickle_ice";
    /// Request: leave the room
    pub const LEAVE: &str = "leave";

    /// Event: a publisher's media became available
    pub const PUBLISHER_JOINED: &str = "publisher_joined";
    /// Event: a publisher's media went away
    pub const PUBLISHER_LEFT: &str = "publisher_left";
    /// Event: a member entered the room (publishing or not)
    pub const MEMBER_JOINED: &str = "member_joined";
    /// Event: a member left the room
    pub const MEMBER_LEFT: &str = "member_left";
    /// Event: remotely gathered ICE candidate
    pub const REMOTE_CANDIDATE: &str = "remote_candidate";
    /// Reserved error tag; as a correlated reply it rejects the request
    pub const ERROR: &str = "error";

    /// Handler registration tag matching every inbound message type
    pub const WILDCARD: &str = "*";
}

/// Wire unit of the signaling protocol
///
/// `request_id` is present only on correlated request/response pairs; it is
/// absent for fire-and-forget sends and server-pushed events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Event or fire-and-forget envelope (no correlation id)
    pub fn event(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id: None,
            payload,
        }
    }

    /// Correlated request/response envelope
    pub fn request(kind: impl Into<String>, request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            request_id: Some(request_id.into()),
            payload,
        }
    }
}

/// Payload of the reserved `error` tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
}

/// Reply to `subscribe`: server-issued offer covering the full feed set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeReply {
    pub sdp: String,
    #[serde(default)]
    pub feed_ids: Vec<String>,
}

/// Payload of `subscribe_answer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeAnswerParams {
    pub sdp: String,
}

/// Reply to `publish_offer`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOfferReply {
    pub sdp: String,
}

/// Payload of `trickle_ice`; `target` is `subscriber` or `publisher`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrickleIceParams {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
}

/// Payload of the `publisher_joined` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherJoinedEvent {
    pub feed_id: String,
    pub display: String,
    pub user_id: String,
}

/// Payload of the `publisher_left` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherLeftEvent {
    pub feed_id: String,
}

/// Payload of the `member_joined` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberJoinedEvent {
    pub user_id: String,
    pub display: String,
}

/// Payload of the `member_left` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberLeftEvent {
    pub user_id: String,
}

/// Payload of the `remote_candidate` event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCandidateEvent {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<String>,
}

/// Payload of `join_room`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRoomParams {
    pub room_id: String,
    pub user_id: String,
    pub display: String,
    pub token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_envelope_omits_request_id() {
        let env = Envelope::event(types::PUBLISHER_LEFT, json!({"feed_id": "f1"}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("request_id"));
        assert!(text.contains(r#""type":"publisher_left""#));
    }

    #[test]
    fn test_request_envelope_roundtrip() {
        let env = Envelope::request(types::SUBSCRIBE, "7", json!({"feed_ids": ["f1"]}));
        let parsed: Envelope = serde_json::from_str(&serde_json::to_string(&env).unwrap()).unwrap();
        assert_eq!(parsed.kind, types::SUBSCRIBE);
        assert_eq!(parsed.request_id.as_deref(), Some("7"));
    }

    #[test]
    fn test_error_payload_decode() {
        let env: Envelope = serde_json::from_str(
            r#"{"type":"error","request_id":"3","payload":{"code":426,"message":"no such room"}}"#,
        )
        .unwrap();
        let err: ErrorPayload = serde_json::from_value(env.payload).unwrap();
        assert_eq!(err.code, 426);
        assert_eq!(err.message, "no such room");
    }

    #[test]
    fn test_join_room_params_encode() {
        let params = JoinRoomParams {
            room_id: "lobby".to_string(),
            user_id: "u1".to_string(),
            display: "Ada".to_string(),
            token: "tok".to_string(),
        };
        let env = Envelope::request(types::JOIN_ROOM, "1", serde_json::to_value(&params).unwrap());
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains(r#""room_id":"lobby""#));
        assert!(text.contains(r#""request_id":"1""#));
    }

    #[test]
    fn test_envelope_without_payload_decodes_to_null() {
        let env: Envelope = serde_json::from_str(r#"{"type":"member_left"}"#).unwrap();
        assert!(env.payload.is_null());
        assert!(env.request_id.is_none());
    }
}
