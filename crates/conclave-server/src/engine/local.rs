//! In-process media engine
//!
//! Keeps the engine-side bookkeeping a forwarding worker would keep (ports,
//! ICE/DTLS parameters, producers and consumers with their cascades) without
//! moving any media. Used by the binary when no external worker is attached
//! and by every test.

use super::{ConsumerParams, EngineError, EngineEvent, MediaEngine, WebRtcTransportOptions};
use async_trait::async_trait;
use conclave_protocol::{
    ConsumerId, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, IceCandidate,
    IceCandidateType, IceParameters, IceProtocol, MediaKind, ProducerId, RtcpFeedback,
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpHeaderExtension, RtpHeaderExtensionParameters, RtpParameters,
    TransportId, TransportParams,
};
use rand::Rng;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::ice::rand::{generate_pwd, generate_ufrag};

/// First payload type handed out to codecs without a preferred one
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Type preference of host candidates (RFC 8445 5.1.2.2)
const HOST_TYPE_PREFERENCE: u32 = 126;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl EngineSettings {
    /// Opus for audio and VP8 for video
    pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
        let mut vp8_parameters = BTreeMap::new();
        vp8_parameters.insert("x-google-start-bitrate".to_string(), json!(1000));

        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: MIME_TYPE_OPUS.to_string(),
                preferred_payload_type: None,
                clock_rate: 48000,
                channels: Some(2),
                parameters: BTreeMap::new(),
                rtcp_feedback: vec![],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: MIME_TYPE_VP8.to_string(),
                preferred_payload_type: None,
                clock_rate: 90000,
                channels: None,
                parameters: vp8_parameters,
                rtcp_feedback: vec![],
            },
        ]
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            media_codecs: Self::default_media_codecs(),
        }
    }
}

struct LocalTransport {
    port: u16,
    dtls_state: DtlsState,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
    next_mid: u32,
}

struct LocalProducer {
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

struct LocalConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct Tables {
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
    ports_in_use: BTreeSet<u16>,
    closed: bool,
}

impl Tables {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    fn remove_consumer(&mut self, consumer_id: ConsumerId) -> Option<LocalConsumer> {
        let consumer = self.consumers.remove(&consumer_id)?;
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(&consumer_id);
        }
        Some(consumer)
    }

    fn remove_producer(&mut self, producer_id: ProducerId) -> Option<LocalProducer> {
        let producer = self.producers.remove(&producer_id)?;
        for consumer_id in &producer.consumers {
            if let Some(consumer) = self.consumers.remove(consumer_id) {
                if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
                    transport.consumers.remove(consumer_id);
                }
            }
        }
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(&producer_id);
        }
        Some(producer)
    }

    fn remove_transport(&mut self, transport_id: TransportId) -> Option<LocalTransport> {
        let transport = self.transports.remove(&transport_id)?;
        for producer_id in &transport.producers {
            self.remove_producer(*producer_id);
        }
        for consumer_id in &transport.consumers {
            self.remove_consumer(*consumer_id);
        }
        self.ports_in_use.remove(&transport.port);
        Some(transport)
    }
}

pub struct LocalEngine {
    settings: EngineSettings,
    capabilities: RtpCapabilities,
    tables: Mutex<Tables>,
    events: broadcast::Sender<EngineEvent>,
}

impl LocalEngine {
    pub fn new(settings: EngineSettings) -> Self {
        let capabilities = build_capabilities(&settings.media_codecs);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        tracing::info!(
            min_port = settings.rtc_min_port,
            max_port = settings.rtc_max_port,
            codecs = capabilities.codecs.len(),
            "Local media engine started"
        );

        Self {
            settings,
            capabilities,
            tables: Mutex::new(Tables::default()),
            events,
        }
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        // No receivers is fine, nobody is watching yet
        let _ = self.events.send(event);
    }

    /// The remote end closed the DTLS association of a transport.
    ///
    /// The transport stays allocated until someone closes it; the engine only
    /// reports the state change.
    pub fn close_dtls(&self, transport_id: TransportId) -> Result<(), EngineError> {
        {
            let mut tables = self.tables();
            let transport = tables
                .transports
                .get_mut(&transport_id)
                .ok_or(EngineError::TransportNotFound(transport_id))?;
            transport.dtls_state = DtlsState::Closed;
        }

        self.emit(EngineEvent::DtlsStateChanged {
            transport_id,
            state: DtlsState::Closed,
        });
        Ok(())
    }

    /// The engine dropped a producer without being asked, e.g. its RTP
    /// stream timed out. Consumers of it are closed with it.
    pub fn end_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        {
            let mut tables = self.tables();
            tables.ensure_open()?;
            tables
                .remove_producer(producer_id)
                .ok_or(EngineError::ProducerNotFound(producer_id))?;
        }

        tracing::debug!(%producer_id, "Engine producer ended");
        self.emit(EngineEvent::ProducerClosed { producer_id });
        Ok(())
    }

    /// Stop the worker. Everything it created is dropped and every later
    /// call fails with [`EngineError::Closed`].
    pub fn terminate(&self, reason: &str) {
        {
            let mut tables = self.tables();
            if tables.closed {
                return;
            }
            *tables = Tables {
                closed: true,
                ..Tables::default()
            };
        }

        tracing::error!(reason, "Local media engine terminated");
        self.emit(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
    }

    pub fn transport_count(&self) -> usize {
        self.tables().transports.len()
    }

    pub fn producer_count(&self) -> usize {
        self.tables().producers.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.tables().consumers.len()
    }

    pub fn is_consumer_paused(&self, consumer_id: ConsumerId) -> Option<bool> {
        self.tables().consumers.get(&consumer_id).map(|c| c.paused)
    }

    fn allocate_port(&self, tables: &mut Tables) -> Result<u16, EngineError> {
        let port = (self.settings.rtc_min_port..=self.settings.rtc_max_port)
            .find(|port| !tables.ports_in_use.contains(port))
            .ok_or(EngineError::PortsExhausted {
                min: self.settings.rtc_min_port,
                max: self.settings.rtc_max_port,
            })?;
        tables.ports_in_use.insert(port);
        Ok(port)
    }

    fn validate_codecs(&self, kind: MediaKind, rtp_parameters: &RtpParameters) -> Result<(), EngineError> {
        if rtp_parameters.codecs.iter().all(|c| c.is_rtx()) {
            return Err(EngineError::NoCodecs);
        }

        for codec in rtp_parameters.codecs.iter().filter(|c| !c.is_rtx()) {
            if MediaKind::from_mime_type(&codec.mime_type) != Some(kind) {
                return Err(EngineError::KindMismatch {
                    kind,
                    mime_type: codec.mime_type.clone(),
                });
            }
            if self.capabilities.find_codec(codec).is_none() {
                return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportParams, EngineError> {
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::NoProtocolEnabled);
        }

        let mut tables = self.tables();
        tables.ensure_open()?;
        let port = self.allocate_port(&mut tables)?;

        let id = TransportId::new();
        tables.transports.insert(
            id,
            LocalTransport {
                port,
                dtls_state: DtlsState::New,
                producers: HashSet::new(),
                consumers: HashSet::new(),
                next_mid: 0,
            },
        );
        drop(tables);

        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());

        let (udp_preference, tcp_preference) = if options.prefer_udp {
            (1000, 500)
        } else {
            (500, 1000)
        };

        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: candidate_priority(udp_preference),
                ip: ip.clone(),
                protocol: IceProtocol::Udp,
                port,
                candidate_type: IceCandidateType::Host,
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: candidate_priority(tcp_preference),
                ip,
                protocol: IceProtocol::Tcp,
                port,
                candidate_type: IceCandidateType::Host,
                tcp_type: Some("passive".to_string()),
            });
        }
        ice_candidates.sort_by(|a, b| b.priority.cmp(&a.priority));

        tracing::debug!(transport_id = %id, port, "Engine transport created");

        Ok(TransportParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: generate_ufrag(),
                password: generate_pwd(),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![random_fingerprint()],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidDtlsParameters(
                "at least one fingerprint is required".to_string(),
            ));
        }

        {
            let mut tables = self.tables();
            tables.ensure_open()?;
            let transport = tables
                .transports
                .get_mut(&transport_id)
                .ok_or(EngineError::TransportNotFound(transport_id))?;
            if transport.dtls_state != DtlsState::New {
                return Err(EngineError::AlreadyConnected(transport_id));
            }
            transport.dtls_state = DtlsState::Connected;
        }

        self.emit(EngineEvent::DtlsStateChanged {
            transport_id,
            state: DtlsState::Connected,
        });
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, EngineError> {
        self.validate_codecs(kind, &rtp_parameters)?;

        let mut tables = self.tables();
        tables.ensure_open()?;
        let transport = tables
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::TransportNotFound(transport_id))?;

        let id = ProducerId::new();
        transport.producers.insert(id);
        tables.producers.insert(
            id,
            LocalProducer {
                transport_id,
                kind,
                rtp_parameters,
                consumers: HashSet::new(),
            },
        );

        tracing::debug!(producer_id = %id, %transport_id, %kind, "Engine producer created");
        Ok(id)
    }

    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let tables = self.tables();
        let Some(producer) = tables.producers.get(&producer_id) else {
            return false;
        };

        producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .any(|codec| {
                rtp_capabilities
                    .find_codec(codec)
                    .is_some_and(|cap| cap.kind == producer.kind)
            })
    }

    async fn consume(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerParams, EngineError> {
        if !self.can_consume(producer_id, rtp_capabilities) {
            return Err(EngineError::CannotConsume(producer_id));
        }

        let mut tables = self.tables();
        tables.ensure_open()?;

        let (kind, producer_parameters) = {
            let producer = tables
                .producers
                .get(&producer_id)
                .ok_or(EngineError::ProducerNotFound(producer_id))?;
            (producer.kind, producer.rtp_parameters.clone())
        };

        let transport = tables
            .transports
            .get_mut(&transport_id)
            .ok_or(EngineError::TransportNotFound(transport_id))?;
        let mid = transport.next_mid;
        transport.next_mid += 1;

        let id = ConsumerId::new();
        transport.consumers.insert(id);

        let rtp_parameters = consumer_rtp_parameters(&producer_parameters, rtp_capabilities, kind, mid);

        if let Some(producer) = tables.producers.get_mut(&producer_id) {
            producer.consumers.insert(id);
        }
        tables.consumers.insert(
            id,
            LocalConsumer {
                transport_id,
                producer_id,
                paused,
            },
        );

        tracing::debug!(consumer_id = %id, %producer_id, %transport_id, paused, "Engine consumer created");

        Ok(ConsumerParams {
            id,
            producer_id,
            kind,
            rtp_parameters,
            paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        let mut tables = self.tables();
        tables.ensure_open()?;
        let consumer = tables
            .consumers
            .get_mut(&consumer_id)
            .ok_or(EngineError::ConsumerNotFound(consumer_id))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_transport(&self, transport_id: TransportId) -> Result<(), EngineError> {
        let mut tables = self.tables();
        tables.ensure_open()?;
        let transport = tables
            .remove_transport(transport_id)
            .ok_or(EngineError::TransportNotFound(transport_id))?;

        tracing::debug!(%transport_id, port = transport.port, "Engine transport closed");
        Ok(())
    }

    async fn close_producer(&self, producer_id: ProducerId) -> Result<(), EngineError> {
        let mut tables = self.tables();
        tables.ensure_open()?;
        tables
            .remove_producer(producer_id)
            .ok_or(EngineError::ProducerNotFound(producer_id))?;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), EngineError> {
        let mut tables = self.tables();
        tables.ensure_open()?;
        tables
            .remove_consumer(consumer_id)
            .ok_or(EngineError::ConsumerNotFound(consumer_id))?;
        Ok(())
    }

    fn transport_state(&self, transport_id: TransportId) -> Option<DtlsState> {
        self.tables()
            .transports
            .get(&transport_id)
            .map(|t| t.dtls_state)
    }

    fn has_producer(&self, producer_id: ProducerId) -> bool {
        self.tables().producers.contains_key(&producer_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Router capabilities: payload types assigned and default RTCP feedback
/// filled in for codecs that declare none.
fn build_capabilities(media_codecs: &[RtpCodecCapability]) -> RtpCapabilities {
    let mut next_payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
    let codecs = media_codecs
        .iter()
        .map(|codec| {
            let mut codec = codec.clone();
            if codec.preferred_payload_type.is_none() {
                codec.preferred_payload_type = Some(next_payload_type);
                next_payload_type = next_payload_type.saturating_add(1);
            }
            if codec.rtcp_feedback.is_empty() {
                codec.rtcp_feedback = default_rtcp_feedback(codec.kind);
            }
            codec
        })
        .collect();

    RtpCapabilities {
        codecs,
        header_extensions: vec![
            RtpHeaderExtension {
                kind: MediaKind::Audio,
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
                preferred_id: 1,
            },
            RtpHeaderExtension {
                kind: MediaKind::Video,
                uri: "urn:ietf:params:rtp-hdrext:sdes:mid".to_string(),
                preferred_id: 1,
            },
            RtpHeaderExtension {
                kind: MediaKind::Video,
                uri: "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time".to_string(),
                preferred_id: 4,
            },
            RtpHeaderExtension {
                kind: MediaKind::Audio,
                uri: "urn:ietf:params:rtp-hdrext:ssrc-audio-level".to_string(),
                preferred_id: 10,
            },
        ],
    }
}

fn default_rtcp_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

/// Producer parameters rewritten for one subscriber: only the codecs it
/// supports, its payload types and header extension ids, a fresh SSRC.
fn consumer_rtp_parameters(
    producer: &RtpParameters,
    capabilities: &RtpCapabilities,
    kind: MediaKind,
    mid: u32,
) -> RtpParameters {
    let codecs = producer
        .codecs
        .iter()
        .filter(|c| !c.is_rtx())
        .filter_map(|codec| {
            let cap = capabilities.find_codec(codec)?;
            Some(RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: cap.preferred_payload_type.unwrap_or(codec.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: cap.rtcp_feedback.clone(),
            })
        })
        .collect();

    let header_extensions = producer
        .header_extensions
        .iter()
        .filter_map(|ext| {
            let cap = capabilities
                .header_extensions
                .iter()
                .find(|h| h.kind == kind && h.uri == ext.uri)?;
            Some(RtpHeaderExtensionParameters {
                uri: ext.uri.clone(),
                id: cap.preferred_id,
                encrypt: ext.encrypt,
            })
        })
        .collect();

    RtpParameters {
        mid: Some(mid.to_string()),
        codecs,
        header_extensions,
        encodings: vec![RtpEncodingParameters {
            ssrc: Some(rand::thread_rng().r#gen()),
            ..Default::default()
        }],
        rtcp: RtcpParameters {
            cname: producer.rtcp.cname.clone(),
            reduced_size: true,
        },
    }
}

fn candidate_priority(local_preference: u32) -> u32 {
    // Component 1 (RTP)
    (HOST_TYPE_PREFERENCE << 24) | (local_preference << 8) | (256 - 1)
}

fn random_fingerprint() -> DtlsFingerprint {
    let bytes: [u8; 32] = rand::random();
    let value = bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");

    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}
