//! Disconnect reconciler
//!
//! Registry-side teardown. Each entry point runs inside the coordinator's
//! critical section, removes everything that hangs off the closed object and
//! returns an [`Outbox`] with the engine closes and pushes still to do.
//! Nothing here awaits, so a teardown is never observed half done.

use super::coordinator::SfuState;
use super::events::Outbox;
use super::room::ProducerEntry;
use chrono::Utc;
use conclave_protocol::{ConnectionId, ProducerId, RoomId, ServerMessage, TransportId, TransportRole};
use std::collections::HashSet;

impl SfuState {
    /// Tear down a connection and everything it owns. Unknown ids are a no-op.
    pub(crate) fn disconnect(&mut self, connection_id: ConnectionId) -> Outbox {
        let mut outbox = Outbox::new();

        let Some(connection) = self.sessions.take(connection_id) else {
            return outbox;
        };

        if let Some(room_id) = &connection.room_id {
            let departure = self.rooms.remove_connection(room_id, connection_id);
            for producer in departure.removed_producers {
                self.cascade_removed_producer(producer, &departure.remaining_members, false, &mut outbox);
            }
            tracing::info!(
                %connection_id,
                %room_id,
                remaining = departure.remaining_members.len(),
                evicted = departure.room_evicted,
                "Connection left room"
            );
        }

        // The connection record and the table should agree; sweep both anyway
        let mut transports: HashSet<TransportId> = connection.recv_transports.iter().copied().collect();
        transports.extend(connection.send_transport);
        transports.extend(self.transports.owned_by(connection_id));

        for transport_id in transports {
            self.transports.deregister(transport_id);
            outbox.close_transports.push(transport_id);
        }

        tracing::info!(
            %connection_id,
            producers = connection.producers.len(),
            consumers = connection.consumers.len(),
            transports = outbox.close_transports.len(),
            connected_secs = (Utc::now() - connection.admitted_at).num_seconds(),
            "Connection reconciled"
        );
        outbox
    }

    /// Remove a transport and whatever it carried. `notify_owner` pushes
    /// `transport_closed` to the owning connection.
    pub(crate) fn close_transport(&mut self, transport_id: TransportId, notify_owner: bool) -> Outbox {
        let mut outbox = Outbox::new();

        let Some(record) = self.transports.deregister(transport_id) else {
            return outbox;
        };
        outbox.close_transports.push(transport_id);

        let Some(connection) = self.sessions.get_mut(record.owner) else {
            return outbox;
        };
        connection.forget_transport(transport_id);
        let room_id = connection.room_id.clone();

        match record.role {
            TransportRole::Send => {
                let producers: Vec<ProducerId> = std::mem::take(&mut connection.producers)
                    .into_values()
                    .collect();
                if let Some(room_id) = &room_id {
                    for producer_id in producers {
                        self.remove_room_producer(room_id, producer_id, false, &mut outbox);
                    }
                }
            }
            TransportRole::Receive => {
                for consumer in connection.drain_consumers_on(transport_id) {
                    self.rooms.remove_consumer(consumer.producer_id, consumer.id);
                }
            }
        }

        if notify_owner {
            outbox.notify(record.owner, ServerMessage::TransportClosed { transport_id });
        }

        tracing::info!(
            %transport_id,
            connection_id = %record.owner,
            role = %record.role,
            "Transport torn down"
        );
        outbox
    }

    /// Remove a single producer, e.g. one the engine closed on its own. The
    /// owner is told as well since nothing else reports it.
    pub(crate) fn close_producer(&mut self, producer_id: ProducerId) -> Outbox {
        let mut outbox = Outbox::new();

        let Some(room_id) = self.rooms.producer_room(producer_id).cloned() else {
            return outbox;
        };
        if let Some(owner) = self.rooms.producer(producer_id).map(|p| p.owner) {
            if let Some(connection) = self.sessions.get_mut(owner) {
                connection.forget_producer(producer_id);
            }
        }

        self.remove_room_producer(&room_id, producer_id, true, &mut outbox);
        outbox.close_producers.push(producer_id);
        outbox
    }

    fn remove_room_producer(
        &mut self,
        room_id: &RoomId,
        producer_id: ProducerId,
        notify_owner: bool,
        outbox: &mut Outbox,
    ) {
        if let Some(entry) = self.rooms.remove_producer(room_id, producer_id) {
            let members = self.rooms.members(room_id).to_vec();
            self.cascade_removed_producer(entry, &members, notify_owner, outbox);
        }
    }

    /// Drop every consumer of a removed producer and tell the room. Holders of
    /// a consumer learn which of theirs went away; other members just learn
    /// the producer is gone. The owner only hears about it with `notify_owner`.
    fn cascade_removed_producer(
        &mut self,
        producer: ProducerEntry,
        members: &[ConnectionId],
        notify_owner: bool,
        outbox: &mut Outbox,
    ) {
        let mut notified = HashSet::new();

        for (consumer_id, subscriber) in &producer.consumers {
            let Some(connection) = self.sessions.get_mut(*subscriber) else {
                continue;
            };
            connection.consumers.remove(consumer_id);
            notified.insert(*subscriber);
            outbox.notify(
                *subscriber,
                ServerMessage::ProducerClosed {
                    producer_id: producer.id,
                    consumer_id: Some(*consumer_id),
                },
            );
        }

        for member in members {
            if (*member == producer.owner && !notify_owner) || notified.contains(member) {
                continue;
            }
            outbox.notify(
                *member,
                ServerMessage::ProducerClosed {
                    producer_id: producer.id,
                    consumer_id: None,
                },
            );
        }

        tracing::debug!(
            producer_id = %producer.id,
            consumers = producer.consumers.len(),
            "Producer removed"
        );
    }
}
