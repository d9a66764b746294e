use serde::{Deserialize, Serialize};
use std::fmt;

use crate::rtp::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParams};
use crate::types::{ConnectionId, ConsumerId, MediaKind, ProducerId, RoomId, TransportId, TransportRole};

/// A client request. The server answers every request with exactly one
/// `Response` or `Error` carrying the same `request_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: ClientRequest,
}

impl ClientMessage {
    pub fn new(request_id: u64, request: ClientRequest) -> Self {
        Self {
            request_id,
            request,
        }
    }
}

/// Messages sent from client to server via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Join (creating if needed) a room
    JoinRoom { room_id: String },

    /// Fetch the room's codec capabilities
    GetRtpCapabilities,

    /// Create a send or receive transport
    CreateTransport { role: TransportRole },

    /// Complete the DTLS handshake parameters for a transport
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Publish a stream over the send transport
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// List producers of other connections in the room
    GetProducers,

    /// Subscribe to a remote producer over a receive transport
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    /// Start a paused consumer
    ResumeConsumer { consumer_id: ConsumerId },

    /// Keep the connection alive
    Ping,
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom { .. } => "join_room",
            ClientRequest::GetRtpCapabilities => "get_rtp_capabilities",
            ClientRequest::CreateTransport { .. } => "create_transport",
            ClientRequest::ConnectTransport { .. } => "connect_transport",
            ClientRequest::Produce { .. } => "produce",
            ClientRequest::GetProducers => "get_producers",
            ClientRequest::Consume { .. } => "consume",
            ClientRequest::ResumeConsumer { .. } => "resume_consumer",
            ClientRequest::Ping => "ping",
        }
    }
}

/// Messages sent from server to client via WebSocket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Connection admitted
    Welcome { connection_id: ConnectionId },

    /// Successful answer to a request
    Response {
        request_id: u64,
        payload: ResponsePayload,
    },

    /// Failed request, or a frame that could not be understood
    Error {
        request_id: Option<u64>,
        code: ErrorCode,
        message: String,
    },

    /// Another connection in the room started publishing
    NewProducer {
        producer_id: ProducerId,
        connection_id: ConnectionId,
        kind: MediaKind,
    },

    /// A producer in the room is gone. `consumer_id` is set when the
    /// recipient's consumer of it was closed as a consequence.
    ProducerClosed {
        producer_id: ProducerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        consumer_id: Option<ConsumerId>,
    },

    /// The engine closed one of the recipient's transports
    TransportClosed { transport_id: TransportId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResponsePayload {
    RoomJoined {
        room_id: RoomId,
        rtp_capabilities: RtpCapabilities,
        producer_ids: Vec<ProducerId>,
    },

    RtpCapabilities { rtp_capabilities: RtpCapabilities },

    TransportCreated { params: TransportParams },

    TransportConnected { transport_id: TransportId },

    Produced {
        producer_id: ProducerId,
        /// Other connections in the room already publish
        producers_exist: bool,
    },

    Producers { producer_ids: Vec<ProducerId> },

    Consumed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    ConsumerResumed { consumer_id: ConsumerId },

    Pong,
}

/// Machine-readable failure category carried by `ServerMessage::Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomJoin,
    RoomNotFound,
    NotInRoom,
    TransportNotFound,
    DuplicateProducerTransport,
    DuplicateProducer,
    TransportNotConnected,
    ProducerNotFound,
    IncompatibleCapabilities,
    ConsumerNotFound,
    Engine,
    InvalidMessage,
    ConnectionGone,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RoomJoin => "room_join",
            ErrorCode::RoomNotFound => "room_not_found",
            ErrorCode::NotInRoom => "not_in_room",
            ErrorCode::TransportNotFound => "transport_not_found",
            ErrorCode::DuplicateProducerTransport => "duplicate_producer_transport",
            ErrorCode::DuplicateProducer => "duplicate_producer",
            ErrorCode::TransportNotConnected => "transport_not_connected",
            ErrorCode::ProducerNotFound => "producer_not_found",
            ErrorCode::IncompatibleCapabilities => "incompatible_capabilities",
            ErrorCode::ConsumerNotFound => "consumer_not_found",
            ErrorCode::Engine => "engine",
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::ConnectionGone => "connection_gone",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
