use conclave_protocol::{ConsumerId, MediaKind, ProducerId, TransportId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("no free RTC port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    #[error("transport options enable neither UDP nor TCP")]
    NoProtocolEnabled,

    #[error("transport {0} not found")]
    TransportNotFound(TransportId),

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("transport {0} is already connected")]
    AlreadyConnected(TransportId),

    #[error("invalid DTLS parameters: {0}")]
    InvalidDtlsParameters(String),

    #[error("unsupported codec {0}")]
    UnsupportedCodec(String),

    #[error("codec {mime_type} does not carry {kind}")]
    KindMismatch { kind: MediaKind, mime_type: String },

    #[error("RTP parameters contain no codecs")]
    NoCodecs,

    #[error("cannot consume producer {0} with the given capabilities")]
    CannotConsume(ProducerId),

    #[error("engine worker is closed")]
    Closed,
}

impl EngineError {
    /// The target was already gone, which is what a close wanted anyway
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::TransportNotFound(_)
                | EngineError::ProducerNotFound(_)
                | EngineError::ConsumerNotFound(_)
        )
    }
}
