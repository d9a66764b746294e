//! Fixtures shared by the coordinator tests

use super::Coordinator;
use crate::engine::{ConsumerParams, EngineSettings, LocalEngine, MediaEngine, WebRtcTransportOptions};
use crate::ws::connections::ConnectionManager;
use conclave_protocol::{
    ConnectionId, DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, ProducerId,
    RtcpParameters, RtpCodecParameters, RtpEncodingParameters, RtpParameters, ServerMessage,
    TransportRole,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn vp8_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(22222222),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: Some("test".to_string()),
            reduced_size: true,
        },
        ..Default::default()
    }
}

pub fn opus_parameters() -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: BTreeMap::new(),
            rtcp_feedback: vec![],
        }],
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(11111111),
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF".to_string(),
        }],
    }
}

/// A registered connection and the frames pushed to it
pub struct TestConn {
    pub id: ConnectionId,
    rx: mpsc::UnboundedReceiver<String>,
}

impl TestConn {
    pub async fn next_push(&mut self) -> ServerMessage {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for push")
            .expect("push channel closed");
        serde_json::from_str(&frame).expect("push is not a server message")
    }

    pub fn try_push(&mut self) -> Option<ServerMessage> {
        let frame = self.rx.try_recv().ok()?;
        serde_json::from_str(&frame).ok()
    }

    pub fn drain(&mut self) -> Vec<ServerMessage> {
        std::iter::from_fn(|| self.try_push()).collect()
    }
}

pub struct Harness {
    pub engine: Arc<LocalEngine>,
    pub connections: Arc<ConnectionManager>,
    pub coordinator: Arc<Coordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_engine(Arc::new(LocalEngine::new(EngineSettings::default())))
    }

    pub fn with_engine(engine: Arc<LocalEngine>) -> Self {
        let connections = Arc::new(ConnectionManager::new());
        let coordinator = Arc::new(Coordinator::new(
            engine.clone(),
            WebRtcTransportOptions::default(),
            connections.clone(),
        ));
        Self {
            engine,
            connections,
            coordinator,
        }
    }

    pub async fn connect(&self) -> TestConn {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.add_connection(id, tx).await;
        self.coordinator.admit(id).await;
        TestConn { id, rx }
    }

    /// Open and connect a send transport, then produce `kind` on it
    pub async fn publish(&self, connection_id: ConnectionId, kind: MediaKind) -> ProducerId {
        let send = self
            .coordinator
            .create_transport(connection_id, TransportRole::Send)
            .await
            .unwrap();
        self.coordinator
            .connect_transport(connection_id, send.id, client_dtls())
            .await
            .unwrap();

        let rtp_parameters = match kind {
            MediaKind::Audio => opus_parameters(),
            MediaKind::Video => vp8_parameters(),
        };
        self.coordinator
            .produce(connection_id, send.id, kind, rtp_parameters)
            .await
            .unwrap()
            .producer_id
    }

    /// Open a receive transport and consume `producer_id` with the engine's own capabilities
    pub async fn subscribe(&self, connection_id: ConnectionId, producer_id: ProducerId) -> ConsumerParams {
        let recv = self
            .coordinator
            .create_transport(connection_id, TransportRole::Receive)
            .await
            .unwrap();
        self.coordinator
            .consume(connection_id, recv.id, producer_id, self.engine.rtp_capabilities())
            .await
            .unwrap()
    }
}
