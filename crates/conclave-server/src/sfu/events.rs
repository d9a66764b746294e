use conclave_protocol::{ConnectionId, ProducerId, ServerMessage, TransportId};

/// Lifecycle facts that change the registries. Every one of them goes
/// through `Coordinator::dispatch`, which updates the registries and emits
/// the matching pushes in the same step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    /// A transport is gone, e.g. its DTLS association closed
    TransportClosed { transport_id: TransportId },

    /// A producer is gone
    ProducerClosed { producer_id: ProducerId },

    /// The signaling connection is gone
    ConnectionLost { connection_id: ConnectionId },
}

/// Work collected under the coordinator lock and carried out after it is
/// released: engine objects to close, then pushes to deliver.
///
/// Consumers are never listed; the engine closes them with their producer
/// or transport.
#[derive(Debug, Default)]
pub struct Outbox {
    pub close_transports: Vec<TransportId>,
    pub close_producers: Vec<ProducerId>,
    pub notifications: Vec<(ConnectionId, ServerMessage)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&mut self, connection_id: ConnectionId, message: ServerMessage) {
        self.notifications.push((connection_id, message));
    }

    pub fn is_empty(&self) -> bool {
        self.close_transports.is_empty()
            && self.close_producers.is_empty()
            && self.notifications.is_empty()
    }
}
