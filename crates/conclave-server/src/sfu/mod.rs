//! Signaling orchestration for the selective forwarding unit
//!
//! The media itself flows through the engine. This module keeps track of
//! who is in which room, which transports, producers and consumers exist,
//! and tears all of it down consistently when something goes away.

mod coordinator;
mod events;
mod reconciler;
mod room;
mod session;
mod transport;

#[cfg(test)]
mod testutil;

pub use coordinator::{Coordinator, EngineFailure, JoinedRoom, Produced, SfuState};
pub use events::{DomainEvent, Outbox};
pub use room::{ProducerEntry, Room, RoomDeparture, RoomStore};
pub use session::{Connection, ConsumerRecord, ConsumerState, SessionRegistry};
pub use transport::{TransportManager, TransportRecord, TransportTable};
