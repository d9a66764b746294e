//! Conclave signaling server
//!
//! Rooms, transports, producers and consumers for a selective forwarding
//! unit, negotiated with browser peers over a WebSocket. The library is what
//! the binary runs; it is exposed for testing and embedding.

pub mod api;
pub mod engine;
pub mod error;
pub mod sfu;
pub mod state;
pub mod ws;

use engine::MediaEngine;
use sfu::Coordinator;
use std::sync::Arc;
use ws::connections::ConnectionManager;

/// Wire a router around `engine`. The caller decides whether to run
/// [`Coordinator::spawn_engine_events`] on the returned state.
pub fn create_app(config: state::Config, engine: Arc<dyn MediaEngine>) -> (axum::Router, state::AppState) {
    let connections = Arc::new(ConnectionManager::new());
    let coordinator = Arc::new(Coordinator::new(
        engine,
        config.transport_options(),
        connections.clone(),
    ));
    let app_state = state::AppState::new(config, coordinator, connections);
    let router = api::create_router(app_state.clone());
    (router, app_state)
}
