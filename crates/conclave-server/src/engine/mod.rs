//! Media engine seam
//!
//! The forwarding unit that actually moves RTP is an external collaborator.
//! The signaling layer only talks to it through [`MediaEngine`]: create and
//! connect transports, produce, consume, resume, close. Lifecycle changes the
//! engine decides on its own are reported as [`EngineEvent`]s.

mod error;
pub mod local;

pub use error::EngineError;
pub use local::{EngineSettings, LocalEngine};

use async_trait::async_trait;
use conclave_protocol::{
    ConsumerId, DtlsParameters, DtlsState, MediaKind, ProducerId, RtpCapabilities, RtpParameters,
    TransportId, TransportParams,
};
use std::net::IpAddr;
use tokio::sync::broadcast;

/// Fixed configuration every WebRTC transport is created with
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    /// Address announced in ICE candidates, e.g. a public IP behind NAT
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::from([0, 0, 0, 0]),
            announced_ip: Some("127.0.0.1".to_string()),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// A consumer as created by the engine
#[derive(Debug, Clone)]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// DTLS state of a transport changed. `Closed` is authoritative: the
    /// transport is unusable and must be torn down.
    DtlsStateChanged {
        transport_id: TransportId,
        state: DtlsState,
    },

    /// The engine closed a producer on its own. Its consumers are gone too.
    ProducerClosed { producer_id: ProducerId },

    /// The engine worker is gone; nothing it created survives.
    WorkerDied { reason: String },
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codec capabilities of the engine's router
    fn rtp_capabilities(&self) -> RtpCapabilities;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError>;

    /// Whether a device with `rtp_capabilities` can receive the producer
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError>;

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    /// Close a transport together with every producer and consumer on it
    async fn close_transport(&self, transport_id: TransportId) -> Result<(), EngineError>;

    /// Close a producer together with every consumer of it
    async fn close_producer(&self, producer_id: ProducerId) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError>;

    /// DTLS state of a live transport, `None` once the engine dropped it
    fn transport_state(&self, transport_id: TransportId) -> Option<DtlsState>;

    fn has_producer(&self, producer_id: ProducerId) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}
