//! Coordinator
//!
//! Single owner of the session registry, room store and transport table.
//! Every signaling operation is a method here. The registries sit behind one
//! async mutex which is never held across an engine call: each operation
//! validates, releases, calls the engine, then re-acquires and re-validates.
//! If the caller disappeared in between, the fresh engine object is closed
//! and the result dropped.

use super::events::{DomainEvent, Outbox};
use super::room::RoomStore;
use super::session::{ConsumerRecord, ConsumerState, SessionRegistry};
use super::transport::{TransportManager, TransportTable};
use crate::engine::{ConsumerParams, EngineError, EngineEvent, MediaEngine, WebRtcTransportOptions};
use crate::error::SignalError;
use crate::ws::connections::ConnectionManager;
use conclave_protocol::{
    ConnectionId, ConsumerId, DtlsParameters, DtlsState, MediaKind, ProducerId, RoomId,
    RoomSummary, RtpCapabilities, RtpParameters, ServerMessage, TransportId, TransportParams,
    TransportRole,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// All registries, guarded together by the coordinator
#[derive(Debug, Default)]
pub struct SfuState {
    pub(crate) sessions: SessionRegistry,
    pub(crate) rooms: RoomStore,
    pub(crate) transports: TransportTable,
}

/// Answer to a successful join
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub room_id: RoomId,
    pub rtp_capabilities: RtpCapabilities,
    /// Producers of the other members, oldest first
    pub producer_ids: Vec<ProducerId>,
}

#[derive(Debug, Clone, Copy)]
pub struct Produced {
    pub producer_id: ProducerId,
    /// Other members already publish
    pub producers_exist: bool,
}

/// Why the engine event loop stopped. Always fatal for the process.
#[derive(Debug, Clone)]
pub struct EngineFailure {
    pub reason: String,
}

pub struct Coordinator {
    engine: Arc<dyn MediaEngine>,
    transports: TransportManager,
    connections: Arc<ConnectionManager>,
    state: Mutex<SfuState>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        options: WebRtcTransportOptions,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            transports: TransportManager::new(engine.clone(), options),
            engine,
            connections,
            state: Mutex::new(SfuState::default()),
        }
    }

    pub async fn admit(&self, connection_id: ConnectionId) {
        self.state.lock().await.sessions.admit(connection_id);
        tracing::info!(%connection_id, "Connection admitted");
    }

    pub async fn join_room(&self, connection_id: ConnectionId, room_id: &str) -> Result<JoinedRoom, SignalError> {
        let room_id = RoomId::parse(room_id)?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let connection = state.sessions.require_mut(connection_id)?;
        if let Some(current) = connection.room_id.as_ref().filter(|current| **current != room_id) {
            return Err(SignalError::RoomJoin(format!("already in room {}", current)));
        }
        connection.room_id = Some(room_id.clone());

        let engine = &self.engine;
        let room = state
            .rooms
            .join(&room_id, connection_id, || engine.rtp_capabilities());
        let rtp_capabilities = room.rtp_capabilities.clone();
        let members = room.members.len();
        let producer_ids = state.rooms.list_producers(&room_id, connection_id);

        tracing::info!(
            %connection_id,
            %room_id,
            members,
            producers = producer_ids.len(),
            "Connection joined room"
        );

        Ok(JoinedRoom {
            room_id,
            rtp_capabilities,
            producer_ids,
        })
    }

    /// The joined room's capabilities, or the engine's before joining
    pub async fn rtp_capabilities(&self, connection_id: ConnectionId) -> Result<RtpCapabilities, SignalError> {
        let state = self.state.lock().await;
        let connection = state.sessions.require(connection_id)?;

        let room_caps = connection
            .room_id
            .as_ref()
            .and_then(|room_id| state.rooms.get(room_id))
            .map(|room| room.rtp_capabilities.clone());

        Ok(room_caps.unwrap_or_else(|| self.engine.rtp_capabilities()))
    }

    pub async fn create_transport(
        &self,
        connection_id: ConnectionId,
        role: TransportRole,
    ) -> Result<TransportParams, SignalError> {
        {
            let state = self.state.lock().await;
            Self::check_can_create(&state, connection_id, role)?;
        }

        let params = self.transports.create(connection_id, role).await?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if let Err(e) = Self::check_can_create(state, connection_id, role) {
            drop(guard);
            self.transports.close(params.id).await;
            return Err(e);
        }

        state.transports.register(params.id, role, connection_id);
        let connection = state.sessions.require_mut(connection_id)?;
        match role {
            TransportRole::Send => connection.send_transport = Some(params.id),
            TransportRole::Receive => connection.recv_transports.push(params.id),
        }

        Ok(params)
    }

    fn check_can_create(state: &SfuState, connection_id: ConnectionId, role: TransportRole) -> Result<(), SignalError> {
        let connection = state.sessions.require(connection_id)?;
        connection.joined_room()?;
        if role == TransportRole::Send && connection.send_transport.is_some() {
            return Err(SignalError::DuplicateProducerTransport);
        }
        Ok(())
    }

    pub async fn connect_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<TransportId, SignalError> {
        {
            let state = self.state.lock().await;
            state.transports.lookup(connection_id, transport_id)?;
        }

        self.transports.connect(transport_id, dtls_parameters).await?;

        let mut state = self.state.lock().await;
        let record = state.transports.lookup_mut(connection_id, transport_id)?;
        record.connected = true;
        if record.dtls_state == DtlsState::New {
            record.dtls_state = DtlsState::Connected;
        }
        Ok(transport_id)
    }

    pub async fn produce(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<Produced, SignalError> {
        let room_id = {
            let state = self.state.lock().await;
            Self::check_can_produce(&state, connection_id, transport_id, kind)?
        };

        let producer_id = self.engine.produce(transport_id, kind, rtp_parameters).await?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let revalidated = Self::check_can_produce(state, connection_id, transport_id, kind).and_then(|current| {
            if current == room_id {
                Ok(())
            } else {
                Err(SignalError::NotInRoom)
            }
        });
        if let Err(e) = revalidated.and_then(|()| state.rooms.add_producer(&room_id, producer_id, connection_id, kind)) {
            drop(guard);
            self.close_orphaned_producer(producer_id).await;
            return Err(e);
        }

        state
            .sessions
            .require_mut(connection_id)?
            .producers
            .insert(kind, producer_id);

        let producers_exist = !state.rooms.list_producers(&room_id, connection_id).is_empty();

        let mut outbox = Outbox::new();
        for member in state.rooms.members(&room_id) {
            if *member != connection_id {
                outbox.notify(
                    *member,
                    ServerMessage::NewProducer {
                        producer_id,
                        connection_id,
                        kind,
                    },
                );
            }
        }
        drop(guard);

        tracing::info!(
            %connection_id,
            %room_id,
            %producer_id,
            %kind,
            notified = outbox.notifications.len(),
            "Producer created"
        );
        self.flush(outbox).await;

        Ok(Produced {
            producer_id,
            producers_exist,
        })
    }

    /// Checks for `produce`, returning the room the producer will live in
    fn check_can_produce(
        state: &SfuState,
        connection_id: ConnectionId,
        transport_id: TransportId,
        kind: MediaKind,
    ) -> Result<RoomId, SignalError> {
        let connection = state.sessions.require(connection_id)?;
        let room_id = connection.joined_room()?.clone();

        let transport = state.transports.lookup(connection_id, transport_id)?;
        if transport.role != TransportRole::Send {
            return Err(SignalError::TransportNotFound(transport_id));
        }
        if !transport.connected {
            return Err(SignalError::TransportNotConnected(transport_id));
        }
        if connection.producers.contains_key(&kind) {
            return Err(SignalError::DuplicateProducer(kind));
        }
        Ok(room_id)
    }

    /// Producers of the other members of the caller's room
    pub async fn producers(&self, connection_id: ConnectionId) -> Result<Vec<ProducerId>, SignalError> {
        let state = self.state.lock().await;
        let connection = state.sessions.require(connection_id)?;
        let room_id = connection.joined_room()?;
        Ok(state.rooms.list_producers(room_id, connection_id))
    }

    pub async fn consume(
        &self,
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams, SignalError> {
        {
            let state = self.state.lock().await;
            Self::check_can_consume(&state, connection_id, transport_id, producer_id)?;
        }

        if !self.engine.can_consume(producer_id, &rtp_capabilities) {
            tracing::debug!(%connection_id, %producer_id, "Capabilities cannot consume producer");
            return Err(SignalError::IncompatibleCapabilities(producer_id));
        }

        let consumer = self
            .engine
            .consume(transport_id, producer_id, &rtp_capabilities, true)
            .await
            .map_err(|e| match e {
                EngineError::CannotConsume(id) => SignalError::IncompatibleCapabilities(id),
                EngineError::ProducerNotFound(id) => SignalError::ProducerNotFound(id),
                other => SignalError::Engine(other),
            })?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let registered = Self::check_can_consume(state, connection_id, transport_id, producer_id)
            .and_then(|()| state.rooms.add_consumer(producer_id, consumer.id, connection_id));
        if let Err(e) = registered {
            drop(guard);
            self.close_orphaned_consumer(consumer.id).await;
            return Err(e);
        }

        state.sessions.require_mut(connection_id)?.consumers.insert(
            consumer.id,
            ConsumerRecord {
                id: consumer.id,
                producer_id,
                transport_id,
                kind: consumer.kind,
                state: ConsumerState::Paused,
            },
        );
        drop(guard);

        tracing::info!(
            %connection_id,
            %producer_id,
            consumer_id = %consumer.id,
            kind = %consumer.kind,
            "Consumer created"
        );
        Ok(consumer)
    }

    fn check_can_consume(
        state: &SfuState,
        connection_id: ConnectionId,
        transport_id: TransportId,
        producer_id: ProducerId,
    ) -> Result<(), SignalError> {
        let connection = state.sessions.require(connection_id)?;
        let room_id = connection.joined_room()?;

        let transport = state.transports.lookup(connection_id, transport_id)?;
        if transport.role != TransportRole::Receive {
            return Err(SignalError::TransportNotFound(transport_id));
        }
        if state.rooms.producer_room(producer_id) != Some(room_id) {
            return Err(SignalError::ProducerNotFound(producer_id));
        }
        Ok(())
    }

    /// Resume one of the caller's own consumers
    pub async fn resume_consumer(
        &self,
        connection_id: ConnectionId,
        consumer_id: ConsumerId,
    ) -> Result<ConsumerId, SignalError> {
        {
            let state = self.state.lock().await;
            let connection = state.sessions.require(connection_id)?;
            if !connection.consumers.contains_key(&consumer_id) {
                return Err(SignalError::ConsumerNotFound(consumer_id));
            }
        }

        self.engine
            .resume_consumer(consumer_id)
            .await
            .map_err(|e| match e {
                EngineError::ConsumerNotFound(id) => SignalError::ConsumerNotFound(id),
                other => SignalError::Engine(other),
            })?;

        let mut state = self.state.lock().await;
        let record = state
            .sessions
            .require_mut(connection_id)?
            .consumers
            .get_mut(&consumer_id)
            .ok_or(SignalError::ConsumerNotFound(consumer_id))?;
        record.state = ConsumerState::Resumed;

        tracing::debug!(%connection_id, %consumer_id, "Consumer resumed");
        Ok(consumer_id)
    }

    /// Tear a connection down. Calling it again for the same id does nothing.
    pub async fn remove(&self, connection_id: ConnectionId) {
        self.dispatch(DomainEvent::ConnectionLost { connection_id }).await;
    }

    /// Single path for lifecycle events: registries and pushes change together
    pub async fn dispatch(&self, event: DomainEvent) {
        let outbox = {
            let mut state = self.state.lock().await;
            match &event {
                DomainEvent::TransportClosed { transport_id } => state.close_transport(*transport_id, true),
                DomainEvent::ProducerClosed { producer_id } => state.close_producer(*producer_id),
                DomainEvent::ConnectionLost { connection_id } => state.disconnect(*connection_id),
            }
        };

        if !outbox.is_empty() {
            tracing::debug!(?event, "Dispatching domain event");
        }
        self.flush(outbox).await;
    }

    /// Engine closes first, then pushes. Engine failures are logged and the
    /// rest of the work still happens.
    async fn flush(&self, outbox: Outbox) {
        for transport_id in outbox.close_transports {
            self.transports.close(transport_id).await;
        }
        for producer_id in outbox.close_producers {
            self.close_orphaned_producer(producer_id).await;
        }
        self.connections.deliver(outbox.notifications).await;
    }

    async fn close_orphaned_producer(&self, producer_id: ProducerId) {
        match self.engine.close_producer(producer_id).await {
            Ok(()) => tracing::debug!(%producer_id, "Engine producer closed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(%producer_id, error = %e, "Failed to close producer"),
        }
    }

    async fn close_orphaned_consumer(&self, consumer_id: ConsumerId) {
        match self.engine.close_consumer(consumer_id).await {
            Ok(()) => tracing::debug!(%consumer_id, "Engine consumer closed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(%consumer_id, error = %e, "Failed to close consumer"),
        }
    }

    /// Subscribe to engine events and consume them on a background task.
    /// The task only ends when the engine is gone.
    pub fn spawn_engine_events(self: &Arc<Self>) -> JoinHandle<EngineFailure> {
        let events = self.engine.subscribe();
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run_engine_events(events).await })
    }

    pub async fn run_engine_events(&self, mut events: broadcast::Receiver<EngineEvent>) -> EngineFailure {
        loop {
            match events.recv().await {
                Ok(EngineEvent::DtlsStateChanged { transport_id, state }) => {
                    tracing::debug!(%transport_id, ?state, "Transport DTLS state changed");
                    if state == DtlsState::Closed {
                        self.dispatch(DomainEvent::TransportClosed { transport_id }).await;
                    } else if let Some(record) = self.state.lock().await.transports.get_mut(transport_id) {
                        record.dtls_state = state;
                    }
                }
                Ok(EngineEvent::ProducerClosed { producer_id }) => {
                    tracing::debug!(%producer_id, "Engine closed producer");
                    self.dispatch(DomainEvent::ProducerClosed { producer_id }).await;
                }
                Ok(EngineEvent::WorkerDied { reason }) => {
                    tracing::error!(%reason, "Media engine worker died");
                    return EngineFailure { reason };
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Engine event receiver lagged, resyncing");
                    self.resync_with_engine().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::error!("Engine event channel closed");
                    return EngineFailure {
                        reason: "engine event channel closed".to_string(),
                    };
                }
            }
        }
    }

    /// Close every transport and producer the engine no longer has. Used
    /// when engine events were dropped.
    async fn resync_with_engine(&self) {
        let (transports, producers) = {
            let state = self.state.lock().await;
            let transports: Vec<TransportId> = state
                .transports
                .ids()
                .into_iter()
                .filter(|id| matches!(self.engine.transport_state(*id), None | Some(DtlsState::Closed)))
                .collect();
            let producers: Vec<ProducerId> = state
                .rooms
                .producer_ids()
                .into_iter()
                .filter(|id| !self.engine.has_producer(*id))
                .collect();
            (transports, producers)
        };

        tracing::info!(
            transports = transports.len(),
            producers = producers.len(),
            "Resynced with engine"
        );
        for transport_id in transports {
            self.dispatch(DomainEvent::TransportClosed { transport_id }).await;
        }
        for producer_id in producers {
            self.dispatch(DomainEvent::ProducerClosed { producer_id }).await;
        }
    }

    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        self.state.lock().await.rooms.summaries()
    }

    pub async fn room_summary(&self, room_id: &RoomId) -> Option<RoomSummary> {
        self.state.lock().await.rooms.summary(room_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }
}
