use conclave_protocol::{ConnectionId, ServerMessage};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

/// Outbound frame channel of every open signaling socket
pub struct ConnectionManager {
    /// Map from connection ID to message sender channel
    senders: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<String>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(
        &self,
        connection_id: ConnectionId,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!(%connection_id, "Connection registered");
    }

    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        if self.senders.write().await.remove(&connection_id).is_some() {
            tracing::debug!(%connection_id, "Connection unregistered");
        }
    }

    pub async fn send_to_connection(&self, connection_id: ConnectionId, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!("Failed to serialize message: {}", e);
                return;
            }
        };

        let senders = self.senders.read().await;

        match senders.get(&connection_id) {
            Some(sender) => {
                if let Err(e) = sender.send(json) {
                    tracing::debug!("Failed to send message to {}: {}", connection_id, e);
                }
            }
            None => {
                tracing::debug!(%connection_id, "Dropping message for unknown connection");
            }
        }
    }

    /// Deliver a batch of pushes computed under the coordinator lock
    pub async fn deliver(&self, messages: Vec<(ConnectionId, ServerMessage)>) {
        for (connection_id, message) in messages {
            self.send_to_connection(connection_id, &message).await;
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
