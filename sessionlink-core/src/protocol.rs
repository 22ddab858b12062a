//! JSON wire protocol shared by the signaling server and its clients.
//!
//! Two shapes travel over the socket:
//! - correlated RPC: `{"id","method","args"}` answered by `{"id","result"}`
//!   or `{"id","error","details"}`
//! - uncorrelated events tagged by `type` (`videoCallSignal`,
//!   `videoCallParticipant`, `videoCall`, `pong`)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CallId, ConnectionId, VideoCall};

/// Method names served by the call membership surface
pub mod methods {
    pub const CREATE: &str = "videoCall.create";
    pub const JOIN: &str = "videoCall.join";
    pub const LEAVE: &str = "videoCall.leave";
    pub const MESSAGE: &str = "videoCall.message";
    pub const GET: &str = "videoCall.get";
}

/// Event type names used on the wire
pub mod event_types {
    pub const VIDEO_CALL_SIGNAL: &str = "videoCallSignal";
    pub const VIDEO_CALL_PARTICIPANT: &str = "videoCallParticipant";
    pub const VIDEO_CALL: &str = "videoCall";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Peer-to-peer and membership signals.
///
/// On the way out `connection_id` names the intended recipient; the server
/// rewrites it to the sender before delivery, so a receiver always reads the
/// id of the remote peer the signal concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Signal {
    Offer {
        connection_id: ConnectionId,
        sdp: SessionDescription,
    },
    Answer {
        connection_id: ConnectionId,
        sdp: SessionDescription,
    },
    IceCandidate {
        connection_id: ConnectionId,
        candidate: IceCandidate,
    },
    NewParticipant {
        #[serde(alias = "senderConnectionId")]
        connection_id: ConnectionId,
    },
    ParticipantLeft {
        connection_id: ConnectionId,
    },
}

impl Signal {
    #[must_use]
    pub const fn connection_id(&self) -> &ConnectionId {
        match self {
            Self::Offer { connection_id, .. }
            | Self::Answer { connection_id, .. }
            | Self::IceCandidate { connection_id, .. }
            | Self::NewParticipant { connection_id }
            | Self::ParticipantLeft { connection_id } => connection_id,
        }
    }

    /// Replace the peer id carried by the signal
    #[must_use]
    pub fn with_connection_id(mut self, id: ConnectionId) -> Self {
        match &mut self {
            Self::Offer { connection_id, .. }
            | Self::Answer { connection_id, .. }
            | Self::IceCandidate { connection_id, .. }
            | Self::NewParticipant { connection_id }
            | Self::ParticipantLeft { connection_id } => *connection_id = id,
        }
        self
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::NewParticipant { .. } => "new-participant",
            Self::ParticipantLeft { .. } => "participant-left",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantEvent {
    Joined,
    Left,
}

/// Membership change broadcast to every member of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    pub event: ParticipantEvent,
    pub connection_id: ConnectionId,
    pub total_participants: usize,
}

/// Application message relayed verbatim to the whole call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallBroadcast {
    pub id: CallId,
    pub message: CallMessage,
}

/// Server-pushed events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    Pong,
    VideoCallSignal(Signal),
    VideoCallParticipant(ParticipantUpdate),
    VideoCall(CallBroadcast),
}

impl ServerEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Pong => event_types::PONG,
            Self::VideoCallSignal(_) => event_types::VIDEO_CALL_SIGNAL,
            Self::VideoCallParticipant(_) => event_types::VIDEO_CALL_PARTICIPANT,
            Self::VideoCall(_) => event_types::VIDEO_CALL,
        }
    }
}

/// Correlated method call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Reply to an [`RpcRequest`]; `id` is absent only for frames that could not
/// be parsed at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl RpcResponse {
    #[must_use]
    pub const fn ok(id: Option<String>, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            details: None,
        }
    }

    pub fn err(id: Option<String>, error: impl Into<String>, details: Option<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.into()),
            details,
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Control frames sent by clients outside the RPC exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControlFrame {
    Ping,
}

/// Any frame a client may send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Request(RpcRequest),
    Control(ControlFrame),
}

/// `videoCall.message` parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallMessageParams {
    pub call_id: CallId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCallResult {
    pub video_call: VideoCall,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResult {
    pub video_call: VideoCall,
    pub active_connections: Vec<ConnectionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessResult {
    pub success: bool,
}

impl SuccessResult {
    pub const OK: Self = Self { success: true };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_signal_wire_shape() {
        let event = ServerEvent::VideoCallSignal(Signal::Offer {
            connection_id: "peer-a".into(),
            sdp: SessionDescription::offer("v=0"),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "videoCallSignal",
                "event": "offer",
                "connectionId": "peer-a",
                "sdp": { "type": "offer", "sdp": "v=0" }
            })
        );

        let back: ServerEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_new_participant_accepts_sender_alias() {
        let signal: Signal = serde_json::from_value(json!({
            "event": "new-participant",
            "senderConnectionId": "peer-b"
        }))
        .unwrap();

        assert_eq!(signal.connection_id(), &ConnectionId::from("peer-b"));
        assert_eq!(signal.kind(), "new-participant");
    }

    #[test]
    fn test_ice_candidate_field_names() {
        let signal = Signal::IceCandidate {
            connection_id: "x".into(),
            candidate: IceCandidate {
                candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };

        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["event"], "ice-candidate");
        assert_eq!(json["candidate"]["sdpMid"], "0");
        assert_eq!(json["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_with_connection_id_rewrites_peer() {
        let signal = Signal::Answer {
            connection_id: "target".into(),
            sdp: SessionDescription::answer("v=0"),
        }
        .with_connection_id("sender".into());

        assert_eq!(signal.connection_id().as_str(), "sender");
    }

    #[test]
    fn test_participant_update_shape() {
        let event = ServerEvent::VideoCallParticipant(ParticipantUpdate {
            event: ParticipantEvent::Joined,
            connection_id: "a".into(),
            total_participants: 2,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "videoCallParticipant",
                "event": "joined",
                "connectionId": "a",
                "totalParticipants": 2
            })
        );
        assert_eq!(event.event_type(), "videoCallParticipant");
    }

    #[test]
    fn test_client_frame_discrimination() {
        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, ClientFrame::Control(ControlFrame::Ping));

        let request: ClientFrame =
            serde_json::from_str(r#"{"id":"msg_1","method":"videoCall.get","args":["c1"]}"#)
                .unwrap();
        match request {
            ClientFrame::Request(req) => {
                assert_eq!(req.id.as_deref(), Some("msg_1"));
                assert_eq!(req.method, methods::GET);
                assert_eq!(req.args, vec![json!("c1")]);
            }
            ClientFrame::Control(_) => panic!("expected request"),
        }

        assert!(serde_json::from_str::<ClientFrame>(r#"{"hello":1}"#).is_err());
    }

    #[test]
    fn test_rpc_response_omits_empty_fields() {
        let ok = RpcResponse::ok(Some("1".into()), json!({"success": true}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"id": "1", "result": {"success": true}})
        );

        let err = RpcResponse::err(None, "Invalid message format", Some("eof".into()));
        assert!(err.is_error());
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"error": "Invalid message format", "details": "eof"})
        );
    }

    #[test]
    fn test_call_message_params() {
        let params: CallMessageParams = serde_json::from_value(json!({
            "callId": "call-1",
            "type": "signal",
            "data": {"event": "offer"}
        }))
        .unwrap();

        assert_eq!(params.call_id.as_str(), "call-1");
        assert_eq!(params.kind, "signal");
    }
}
