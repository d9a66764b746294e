use crate::engine::EngineError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conclave_protocol::{
    ConsumerId, ErrorCode, MediaKind, ProducerId, RoomId, RoomIdError, ServerMessage, TransportId,
};
use serde_json::json;
use thiserror::Error;

/// Why a signaling request was refused. Always answered to the requesting
/// client; the connection stays open.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignalError {
    #[error("cannot join room: {0}")]
    RoomJoin(String),

    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("join a room first")]
    NotInRoom,

    #[error("transport {0} not found")]
    TransportNotFound(TransportId),

    #[error("a send transport is already open")]
    DuplicateProducerTransport,

    #[error("already producing {0}")]
    DuplicateProducer(MediaKind),

    #[error("transport {0} is not connected")]
    TransportNotConnected(TransportId),

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("capabilities cannot consume producer {0}")]
    IncompatibleCapabilities(ProducerId),

    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("connection is gone")]
    ConnectionGone,

    #[error("media engine: {0}")]
    Engine(#[from] EngineError),
}

impl SignalError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SignalError::RoomJoin(_) => ErrorCode::RoomJoin,
            SignalError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            SignalError::NotInRoom => ErrorCode::NotInRoom,
            SignalError::TransportNotFound(_) => ErrorCode::TransportNotFound,
            SignalError::DuplicateProducerTransport => ErrorCode::DuplicateProducerTransport,
            SignalError::DuplicateProducer(_) => ErrorCode::DuplicateProducer,
            SignalError::TransportNotConnected(_) => ErrorCode::TransportNotConnected,
            SignalError::ProducerNotFound(_) => ErrorCode::ProducerNotFound,
            SignalError::IncompatibleCapabilities(_) => ErrorCode::IncompatibleCapabilities,
            SignalError::ConsumerNotFound(_) => ErrorCode::ConsumerNotFound,
            SignalError::ConnectionGone => ErrorCode::ConnectionGone,
            SignalError::Engine(_) => ErrorCode::Engine,
        }
    }

    pub fn to_message(&self, request_id: u64) -> ServerMessage {
        ServerMessage::Error {
            request_id: Some(request_id),
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<RoomIdError> for SignalError {
    fn from(err: RoomIdError) -> Self {
        SignalError::RoomJoin(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Resource not found: {0}")]
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_frame_echoes_request_id() {
        let err = SignalError::DuplicateProducerTransport;
        match err.to_message(42) {
            ServerMessage::Error {
                request_id,
                code,
                message,
            } => {
                assert_eq!(request_id, Some(42));
                assert_eq!(code, ErrorCode::DuplicateProducerTransport);
                assert_eq!(message, "a send transport is already open");
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_engine_errors_map_to_engine_code() {
        let err: SignalError = EngineError::PortsExhausted { min: 1, max: 2 }.into();
        assert_eq!(err.code(), ErrorCode::Engine);

        let err: SignalError = RoomIdError::Empty.into();
        assert_eq!(err.code(), ErrorCode::RoomJoin);
    }

    #[test]
    fn test_connection_gone_has_its_own_code() {
        let err = SignalError::ConnectionGone;
        assert_eq!(err.code(), ErrorCode::ConnectionGone);
        assert_ne!(err.code(), SignalError::NotInRoom.code());
    }
}
