//! Session registry
//!
//! One record per signaling connection: which room it joined, which
//! transports it owns and which producers and consumers hang off them.

use crate::error::SignalError;
use chrono::{DateTime, Utc};
use conclave_protocol::{ConnectionId, ConsumerId, MediaKind, ProducerId, RoomId, TransportId};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Paused,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub state: ConsumerState,
}

#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// `None` until the connection joins a room
    pub room_id: Option<RoomId>,
    pub send_transport: Option<TransportId>,
    pub recv_transports: Vec<TransportId>,
    /// At most one producer per kind
    pub producers: BTreeMap<MediaKind, ProducerId>,
    pub consumers: HashMap<ConsumerId, ConsumerRecord>,
    pub admitted_at: DateTime<Utc>,
}

impl Connection {
    fn new(id: ConnectionId) -> Self {
        Self {
            id,
            room_id: None,
            send_transport: None,
            recv_transports: Vec::new(),
            producers: BTreeMap::new(),
            consumers: HashMap::new(),
            admitted_at: Utc::now(),
        }
    }

    /// Room the connection joined, or `NotInRoom`
    pub fn joined_room(&self) -> Result<&RoomId, SignalError> {
        self.room_id.as_ref().ok_or(SignalError::NotInRoom)
    }

    /// Forget a transport, returning whether it was the send transport
    pub fn forget_transport(&mut self, transport_id: TransportId) -> bool {
        if self.send_transport == Some(transport_id) {
            self.send_transport = None;
            return true;
        }
        self.recv_transports.retain(|id| *id != transport_id);
        false
    }

    pub fn forget_producer(&mut self, producer_id: ProducerId) {
        self.producers.retain(|_, id| *id != producer_id);
    }

    /// Drop every consumer carried by `transport_id`
    pub fn drain_consumers_on(&mut self, transport_id: TransportId) -> Vec<ConsumerRecord> {
        let ids: Vec<ConsumerId> = self
            .consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id)
            .collect();

        ids.iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: HashMap<ConnectionId, Connection>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unjoined record. Admitting a known id keeps the existing one.
    pub fn admit(&mut self, connection_id: ConnectionId) -> &mut Connection {
        self.connections
            .entry(connection_id)
            .or_insert_with(|| Connection::new(connection_id))
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&connection_id)
    }

    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&connection_id)
    }

    /// Like [`get`](Self::get), failing with `ConnectionGone` for unknown ids
    pub fn require(&self, connection_id: ConnectionId) -> Result<&Connection, SignalError> {
        self.get(connection_id).ok_or(SignalError::ConnectionGone)
    }

    pub fn require_mut(&mut self, connection_id: ConnectionId) -> Result<&mut Connection, SignalError> {
        self.get_mut(connection_id).ok_or(SignalError::ConnectionGone)
    }

    pub fn take(&mut self, connection_id: ConnectionId) -> Option<Connection> {
        self.connections.remove(&connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
