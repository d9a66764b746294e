//! Conclave signaling protocol
//!
//! Wire types shared between the signaling server and its clients.

pub mod messages;
pub mod rtp;
pub mod types;

pub use messages::{ClientMessage, ClientRequest, ErrorCode, ResponsePayload, ServerMessage};
pub use rtp::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_wire_shape() {
        let raw = json!({
            "request_id": 7,
            "type": "create_transport",
            "role": "send"
        });

        let msg: ClientMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(msg.request_id, 7);
        assert!(matches!(
            msg.request,
            ClientRequest::CreateTransport {
                role: TransportRole::Send
            }
        ));
    }

    #[test]
    fn test_unit_request_keeps_request_id() {
        let msg = ClientMessage::new(3, ClientRequest::Ping);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({ "request_id": 3, "type": "ping" }));
    }

    #[test]
    fn test_consumed_payload_does_not_clash_with_kind() {
        let producer_id = ProducerId::new();
        let msg = ServerMessage::Response {
            request_id: 1,
            payload: ResponsePayload::Consumed {
                consumer_id: ConsumerId::new(),
                producer_id,
                kind: MediaKind::Video,
                rtp_parameters: RtpParameters::default(),
            },
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "response");
        assert_eq!(value["payload"]["result"], "consumed");
        assert_eq!(value["payload"]["kind"], "video");
        assert_eq!(value["payload"]["producer_id"], producer_id.to_string());
    }

    #[test]
    fn test_error_code_serializes_like_as_str() {
        for code in [
            ErrorCode::DuplicateProducerTransport,
            ErrorCode::IncompatibleCapabilities,
            ErrorCode::ConsumerNotFound,
            ErrorCode::ConnectionGone,
        ] {
            let value = serde_json::to_value(code).unwrap();
            assert_eq!(value, code.as_str());
        }
    }

    #[test]
    fn test_room_id_validation() {
        assert_eq!(RoomId::parse("  r1 ").unwrap().as_str(), "r1");
        assert_eq!(RoomId::parse("   "), Err(RoomIdError::Empty));
        let long = "x".repeat(MAX_ROOM_ID_LEN + 1);
        assert_eq!(
            RoomId::parse(&long),
            Err(RoomIdError::TooLong(MAX_ROOM_ID_LEN + 1))
        );
    }

    #[test]
    fn test_codec_matching_ignores_case_and_video_channels() {
        let vp8 = RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: Some(101),
            clock_rate: 90000,
            channels: None,
            parameters: Default::default(),
            rtcp_feedback: vec![],
        };
        assert!(vp8.matches("video/vp8", 90000, None));
        assert!(!vp8.matches("video/VP8", 48000, None));

        let opus = RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: Some(100),
            clock_rate: 48000,
            channels: Some(2),
            parameters: Default::default(),
            rtcp_feedback: vec![],
        };
        assert!(opus.matches("audio/opus", 48000, Some(2)));
        assert!(!opus.matches("audio/opus", 48000, Some(1)));
    }
}
