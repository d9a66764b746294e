//! Transport lifecycle
//!
//! [`TransportTable`] is the bookkeeping half (which connection owns which
//! transport, in which role, and whether it was connected). [`TransportManager`]
//! is the engine half and never touches the table; the coordinator calls both.

use crate::engine::{EngineError, MediaEngine, WebRtcTransportOptions};
use crate::error::SignalError;
use conclave_protocol::{
    ConnectionId, DtlsParameters, DtlsState, TransportId, TransportParams, TransportRole,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub id: TransportId,
    pub role: TransportRole,
    pub owner: ConnectionId,
    pub dtls_state: DtlsState,
    /// Set once `connect_transport` succeeded; producing requires it
    pub connected: bool,
}

#[derive(Debug, Default)]
pub struct TransportTable {
    transports: HashMap<TransportId, TransportRecord>,
}

impl TransportTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: TransportId, role: TransportRole, owner: ConnectionId) {
        self.transports.insert(
            id,
            TransportRecord {
                id,
                role,
                owner,
                dtls_state: DtlsState::New,
                connected: false,
            },
        );
    }

    pub fn get_mut(&mut self, id: TransportId) -> Option<&mut TransportRecord> {
        self.transports.get_mut(&id)
    }

    /// Look up a transport on behalf of `owner`. Someone else's transport is
    /// reported exactly like an unknown one.
    pub fn lookup(&self, owner: ConnectionId, id: TransportId) -> Result<&TransportRecord, SignalError> {
        self.transports
            .get(&id)
            .filter(|t| t.owner == owner)
            .ok_or(SignalError::TransportNotFound(id))
    }

    pub fn lookup_mut(
        &mut self,
        owner: ConnectionId,
        id: TransportId,
    ) -> Result<&mut TransportRecord, SignalError> {
        self.transports
            .get_mut(&id)
            .filter(|t| t.owner == owner)
            .ok_or(SignalError::TransportNotFound(id))
    }

    pub fn deregister(&mut self, id: TransportId) -> Option<TransportRecord> {
        self.transports.remove(&id)
    }

    pub fn owned_by(&self, owner: ConnectionId) -> Vec<TransportId> {
        self.transports
            .values()
            .filter(|t| t.owner == owner)
            .map(|t| t.id)
            .collect()
    }

    pub fn ids(&self) -> Vec<TransportId> {
        self.transports.keys().copied().collect()
    }
}

/// Engine-facing side of transport creation, connection and teardown
pub struct TransportManager {
    engine: Arc<dyn MediaEngine>,
    options: WebRtcTransportOptions,
}

impl TransportManager {
    pub fn new(engine: Arc<dyn MediaEngine>, options: WebRtcTransportOptions) -> Self {
        Self { engine, options }
    }

    /// Create an engine transport with the fixed options. Exhaustion and
    /// other engine failures are returned as-is, never retried.
    pub async fn create(&self, owner: ConnectionId, role: TransportRole) -> Result<TransportParams, EngineError> {
        let params = self.engine.create_webrtc_transport(&self.options).await?;
        tracing::info!(
            connection_id = %owner,
            transport_id = %params.id,
            %role,
            "Transport created"
        );
        Ok(params)
    }

    pub async fn connect(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), EngineError> {
        self.engine.connect_transport(transport_id, dtls_parameters).await?;
        tracing::debug!(%transport_id, "Transport connected");
        Ok(())
    }

    /// Close a transport, logging instead of failing. A transport the engine
    /// no longer knows is already closed.
    pub async fn close(&self, transport_id: TransportId) {
        match self.engine.close_transport(transport_id).await {
            Ok(()) => tracing::debug!(%transport_id, "Transport closed"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(%transport_id, "Transport already gone in engine")
            }
            Err(e) => tracing::warn!(%transport_id, error = %e, "Failed to close transport"),
        }
    }
}
