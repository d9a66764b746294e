//! Test server and WebSocket client shared by the integration tests

#![allow(dead_code)]

use conclave_protocol::{
    ClientMessage, ClientRequest, ConnectionId, ConsumerId, DtlsFingerprint, DtlsParameters,
    DtlsRole, ErrorCode, MediaKind, ProducerId, ResponsePayload, RtpCapabilities, RtpParameters,
    ServerMessage, TransportId, TransportParams, TransportRole,
};
use conclave_server::engine::LocalEngine;
use conclave_server::state::Config;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Test server wrapper
pub struct TestServer {
    pub addr: std::net::SocketAddr,
    pub engine: Arc<LocalEngine>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(Config::default()).await
    }

    pub async fn start_with(config: Config) -> Self {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            ..config
        };

        let engine = Arc::new(LocalEngine::new(config.engine_settings()));
        let (router, state) = conclave_server::create_app(config, engine.clone());
        state.coordinator.spawn_engine_events();

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().expect("listener has no address");

        // Create shutdown channel
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Self {
            addr,
            engine,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/mediasoup", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

pub type RequestResult = Result<ResponsePayload, (ErrorCode, String)>;

/// One signaling client. Pushes that arrive while waiting for a response
/// are buffered and handed out by [`TestClient::next_push`].
pub struct TestClient {
    pub connection_id: ConnectionId,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    next_request_id: u64,
    pushes: VecDeque<ServerMessage>,
}

impl TestClient {
    pub async fn connect(server: &TestServer) -> Self {
        let (ws, _) = connect_async(server.ws_url())
            .await
            .expect("Failed to connect WebSocket");

        let mut client = Self {
            connection_id: ConnectionId::new(),
            ws,
            next_request_id: 1,
            pushes: VecDeque::new(),
        };

        match client.recv().await {
            ServerMessage::Welcome { connection_id } => client.connection_id = connection_id,
            other => panic!("expected welcome, got {:?}", other),
        }
        client
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = timeout(FRAME_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");

            if let Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).expect("frame is not a server message");
            }
        }
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string().into()))
            .await
            .expect("Failed to send frame");
    }

    pub async fn request(&mut self, request: ClientRequest) -> RequestResult {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let text = serde_json::to_string(&ClientMessage::new(request_id, request)).unwrap();
        self.send_raw(&text).await;
        self.response_for(Some(request_id)).await
    }

    /// Wait for the answer to `request_id`, buffering pushes on the way
    pub async fn response_for(&mut self, request_id: Option<u64>) -> RequestResult {
        loop {
            match self.recv().await {
                ServerMessage::Response {
                    request_id: id,
                    payload,
                } if Some(id) == request_id => return Ok(payload),
                ServerMessage::Error {
                    request_id: id,
                    code,
                    message,
                } if id == request_id => return Err((code, message)),
                push => self.pushes.push_back(push),
            }
        }
    }

    pub async fn next_push(&mut self) -> ServerMessage {
        match self.pushes.pop_front() {
            Some(push) => push,
            None => self.recv().await,
        }
    }

    pub async fn close(mut self) {
        self.ws.close(None).await.ok();
    }

    /// True once the server closed the socket
    pub async fn wait_closed(&mut self, within: Duration) -> bool {
        let closed = async {
            loop {
                match self.ws.next().await {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        };
        timeout(within, closed).await.is_ok()
    }

    pub async fn join(&mut self, room_id: &str) -> (RtpCapabilities, Vec<ProducerId>) {
        match self
            .request(ClientRequest::JoinRoom {
                room_id: room_id.to_string(),
            })
            .await
        {
            Ok(ResponsePayload::RoomJoined {
                rtp_capabilities,
                producer_ids,
                ..
            }) => (rtp_capabilities, producer_ids),
            other => panic!("join failed: {:?}", other),
        }
    }

    pub async fn create_transport(&mut self, role: TransportRole) -> TransportParams {
        match self.request(ClientRequest::CreateTransport { role }).await {
            Ok(ResponsePayload::TransportCreated { params }) => params,
            other => panic!("create_transport failed: {:?}", other),
        }
    }

    pub async fn connect_transport(&mut self, transport_id: TransportId) -> RequestResult {
        self.request(ClientRequest::ConnectTransport {
            transport_id,
            dtls_parameters: client_dtls(),
        })
        .await
    }

    /// Send transport, DTLS connect, produce video
    pub async fn publish_video(&mut self) -> ProducerId {
        let send = self.create_transport(TransportRole::Send).await;
        self.connect_transport(send.id).await.expect("connect failed");

        match self
            .request(ClientRequest::Produce {
                transport_id: send.id,
                kind: MediaKind::Video,
                rtp_parameters: vp8_rtp_parameters(),
            })
            .await
        {
            Ok(ResponsePayload::Produced { producer_id, .. }) => producer_id,
            other => panic!("produce failed: {:?}", other),
        }
    }

    pub async fn consume(
        &mut self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> RequestResult {
        self.request(ClientRequest::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        })
        .await
    }

    pub async fn resume(&mut self, consumer_id: ConsumerId) -> RequestResult {
        self.request(ClientRequest::ResumeConsumer { consumer_id }).await
    }
}

pub fn client_dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "0A:1B:2C:3D".to_string(),
        }],
    }
}

/// VP8 parameters as a browser device would send them
pub fn vp8_rtp_parameters() -> RtpParameters {
    serde_json::from_value(json!({
        "mid": "0",
        "codecs": [{
            "mimeType": "video/VP8",
            "payloadType": 96,
            "clockRate": 90000,
            "rtcpFeedback": [{ "type": "nack" }, { "type": "nack", "parameter": "pli" }]
        }],
        "headerExtensions": [{
            "uri": "urn:ietf:params:rtp-hdrext:sdes:mid",
            "id": 4
        }],
        "encodings": [{ "ssrc": 4242 }],
        "rtcp": { "cname": "integration" }
    }))
    .expect("valid RTP parameters")
}

pub fn small_port_range(ports: u16) -> Config {
    Config {
        rtc_min_port: 46000,
        rtc_max_port: 46000 + ports - 1,
        ..Default::default()
    }
}
