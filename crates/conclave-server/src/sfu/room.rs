//! Room store
//!
//! Rooms are created lazily on first join and evicted as soon as their last
//! member leaves. Each room keeps its members and producers in insertion
//! order, and every producer knows which consumers subscribe to it so that
//! closing it can cascade.

use crate::error::SignalError;
use chrono::{DateTime, Utc};
use conclave_protocol::{
    ConnectionId, ConsumerId, MediaKind, ProducerId, RoomId, RoomSummary, RtpCapabilities,
};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub id: ProducerId,
    pub owner: ConnectionId,
    pub kind: MediaKind,
    /// Consumers of this producer and the connections holding them
    pub consumers: Vec<(ConsumerId, ConnectionId)>,
}

#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub members: Vec<ConnectionId>,
    pub producers: Vec<ProducerEntry>,
    /// Captured once, when the room is created
    pub rtp_capabilities: RtpCapabilities,
    pub created_at: DateTime<Utc>,
}

impl Room {
    fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id.clone(),
            members: self.members.len(),
            producers: self.producers.len(),
            created_at: self.created_at,
        }
    }
}

/// What leaving a room took down with it
#[derive(Debug, Default)]
pub struct RoomDeparture {
    /// Producers the leaving connection owned, with their consumers
    pub removed_producers: Vec<ProducerEntry>,
    pub remaining_members: Vec<ConnectionId>,
    pub room_evicted: bool,
}

#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<RoomId, Room>,
    producer_rooms: HashMap<ProducerId, RoomId>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection_id` to the room, creating it with `capabilities` if
    /// absent. Joining twice is a no-op.
    pub fn join<F>(&mut self, room_id: &RoomId, connection_id: ConnectionId, capabilities: F) -> &Room
    where
        F: FnOnce() -> RtpCapabilities,
    {
        let room = self.rooms.entry(room_id.clone()).or_insert_with(|| {
            tracing::info!(%room_id, "Room created");
            Room {
                id: room_id.clone(),
                members: Vec::new(),
                producers: Vec::new(),
                rtp_capabilities: capabilities(),
                created_at: Utc::now(),
            }
        });

        if !room.members.contains(&connection_id) {
            room.members.push(connection_id);
        }
        room
    }

    pub fn get(&self, room_id: &RoomId) -> Option<&Room> {
        self.rooms.get(room_id)
    }

    pub fn members(&self, room_id: &RoomId) -> &[ConnectionId] {
        self.rooms
            .get(room_id)
            .map(|room| room.members.as_slice())
            .unwrap_or_default()
    }

    pub fn add_producer(
        &mut self,
        room_id: &RoomId,
        producer_id: ProducerId,
        owner: ConnectionId,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        let room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| SignalError::RoomNotFound(room_id.clone()))?;

        room.producers.push(ProducerEntry {
            id: producer_id,
            owner,
            kind,
            consumers: Vec::new(),
        });
        self.producer_rooms.insert(producer_id, room_id.clone());
        Ok(())
    }

    /// Producers owned by anyone but `excluding`, oldest first
    pub fn list_producers(&self, room_id: &RoomId, excluding: ConnectionId) -> Vec<ProducerId> {
        self.rooms
            .get(room_id)
            .map(|room| {
                room.producers
                    .iter()
                    .filter(|p| p.owner != excluding)
                    .map(|p| p.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn producer(&self, producer_id: ProducerId) -> Option<&ProducerEntry> {
        let room_id = self.producer_rooms.get(&producer_id)?;
        self.rooms
            .get(room_id)?
            .producers
            .iter()
            .find(|p| p.id == producer_id)
    }

    pub fn producer_room(&self, producer_id: ProducerId) -> Option<&RoomId> {
        self.producer_rooms.get(&producer_id)
    }

    fn producer_mut(&mut self, producer_id: ProducerId) -> Option<&mut ProducerEntry> {
        let room_id = self.producer_rooms.get(&producer_id)?;
        self.rooms
            .get_mut(room_id)?
            .producers
            .iter_mut()
            .find(|p| p.id == producer_id)
    }

    pub fn add_consumer(
        &mut self,
        producer_id: ProducerId,
        consumer_id: ConsumerId,
        subscriber: ConnectionId,
    ) -> Result<(), SignalError> {
        let producer = self
            .producer_mut(producer_id)
            .ok_or(SignalError::ProducerNotFound(producer_id))?;
        producer.consumers.push((consumer_id, subscriber));
        Ok(())
    }

    pub fn remove_consumer(&mut self, producer_id: ProducerId, consumer_id: ConsumerId) {
        if let Some(producer) = self.producer_mut(producer_id) {
            producer.consumers.retain(|(id, _)| *id != consumer_id);
        }
    }

    /// Delete a producer, handing back its consumers so the caller can close them
    pub fn remove_producer(&mut self, room_id: &RoomId, producer_id: ProducerId) -> Option<ProducerEntry> {
        let room = self.rooms.get_mut(room_id)?;
        let index = room.producers.iter().position(|p| p.id == producer_id)?;
        self.producer_rooms.remove(&producer_id);
        Some(room.producers.remove(index))
    }

    /// Drop a member together with its producers and its subscriptions to
    /// other members' producers. Evicts the room once it is empty.
    pub fn remove_connection(&mut self, room_id: &RoomId, connection_id: ConnectionId) -> RoomDeparture {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return RoomDeparture::default();
        };

        room.members.retain(|id| *id != connection_id);

        let (removed_producers, kept): (Vec<_>, Vec<_>) = room
            .producers
            .drain(..)
            .partition(|p| p.owner == connection_id);
        room.producers = kept;

        for producer in &mut room.producers {
            producer.consumers.retain(|(_, subscriber)| *subscriber != connection_id);
        }
        for producer in &removed_producers {
            self.producer_rooms.remove(&producer.id);
        }

        let remaining_members = room.members.clone();
        let room_evicted = remaining_members.is_empty();
        if room_evicted {
            self.rooms.remove(room_id);
            tracing::info!(%room_id, "Room evicted");
        }

        RoomDeparture {
            removed_producers,
            remaining_members,
            room_evicted,
        }
    }

    pub fn summary(&self, room_id: &RoomId) -> Option<RoomSummary> {
        self.rooms.get(room_id).map(Room::summary)
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.producer_rooms.keys().copied().collect()
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        let mut summaries: Vec<RoomSummary> = self.rooms.values().map(Room::summary).collect();
        summaries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        summaries
    }
}
