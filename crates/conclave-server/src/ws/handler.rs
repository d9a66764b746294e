use crate::error::SignalError;
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use conclave_protocol::{
    ClientMessage, ClientRequest, ConnectionId, ErrorCode, ResponsePayload, ServerMessage,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let connection_id = ConnectionId::new();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    state.connections.add_connection(connection_id, tx).await;
    state.coordinator.admit(connection_id).await;
    state
        .connections
        .send_to_connection(connection_id, &ServerMessage::Welcome { connection_id })
        .await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let idle_timeout = state.config.idle_timeout();

    loop {
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(_) => {
                tracing::info!(%connection_id, ?idle_timeout, "Closing idle connection");
                break;
            }
        };

        match msg {
            Ok(Message::Text(text)) => {
                handle_text(&state, connection_id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                reject_frame(&state, connection_id, None, "binary frames are not supported").await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::warn!(%connection_id, "WebSocket error: {}", e);
                break;
            }
            // Ping/pong frames only keep the idle timer alive
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.coordinator.remove(connection_id).await;
    state.connections.remove_connection(connection_id).await;

    // Abort the send task
    send_task.abort();

    tracing::info!(%connection_id, "Connection closed");
}

async fn handle_text(state: &AppState, connection_id: ConnectionId, text: &str) {
    let message = match parse_client_message(text) {
        Ok(message) => message,
        Err((request_id, error)) => {
            tracing::warn!(%connection_id, "Invalid message: {}", error);
            reject_frame(state, connection_id, request_id, &error).await;
            return;
        }
    };

    let request_id = message.request_id;
    let request_name = message.request.name();
    tracing::debug!(%connection_id, request_id, request = request_name, "Handling request");

    let reply = match handle_request(state, connection_id, message.request).await {
        Ok(payload) => ServerMessage::Response {
            request_id,
            payload,
        },
        Err(e) => {
            match &e {
                SignalError::Engine(_) => {
                    tracing::warn!(%connection_id, request = request_name, "Request failed: {}", e)
                }
                _ => tracing::debug!(
                    %connection_id,
                    request = request_name,
                    code = %e.code(),
                    "Request rejected: {}",
                    e
                ),
            }
            e.to_message(request_id)
        }
    };

    state.connections.send_to_connection(connection_id, &reply).await;
}

async fn reject_frame(state: &AppState, connection_id: ConnectionId, request_id: Option<u64>, reason: &str) {
    let error = ServerMessage::Error {
        request_id,
        code: ErrorCode::InvalidMessage,
        message: reason.to_string(),
    };
    state.connections.send_to_connection(connection_id, &error).await;
}

/// Decode a request frame. On failure, returns the request id if the frame
/// carried a readable one, so the error can still be correlated.
fn parse_client_message(text: &str) -> Result<ClientMessage, (Option<u64>, String)> {
    let value: Value = serde_json::from_str(text).map_err(|e| (None, e.to_string()))?;
    let request_id = value.get("request_id").and_then(Value::as_u64);
    serde_json::from_value(value).map_err(|e| (request_id, e.to_string()))
}

async fn handle_request(
    state: &AppState,
    connection_id: ConnectionId,
    request: ClientRequest,
) -> Result<ResponsePayload, SignalError> {
    let coordinator = &state.coordinator;

    match request {
        ClientRequest::JoinRoom { room_id } => {
            let joined = coordinator.join_room(connection_id, &room_id).await?;
            Ok(ResponsePayload::RoomJoined {
                room_id: joined.room_id,
                rtp_capabilities: joined.rtp_capabilities,
                producer_ids: joined.producer_ids,
            })
        }
        ClientRequest::GetRtpCapabilities => {
            let rtp_capabilities = coordinator.rtp_capabilities(connection_id).await?;
            Ok(ResponsePayload::RtpCapabilities { rtp_capabilities })
        }
        ClientRequest::CreateTransport { role } => {
            let params = coordinator.create_transport(connection_id, role).await?;
            Ok(ResponsePayload::TransportCreated { params })
        }
        ClientRequest::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            let transport_id = coordinator
                .connect_transport(connection_id, transport_id, dtls_parameters)
                .await?;
            Ok(ResponsePayload::TransportConnected { transport_id })
        }
        ClientRequest::Produce {
            transport_id,
            kind,
            rtp_parameters,
        } => {
            let produced = coordinator
                .produce(connection_id, transport_id, kind, rtp_parameters)
                .await?;
            Ok(ResponsePayload::Produced {
                producer_id: produced.producer_id,
                producers_exist: produced.producers_exist,
            })
        }
        ClientRequest::GetProducers => {
            let producer_ids = coordinator.producers(connection_id).await?;
            Ok(ResponsePayload::Producers { producer_ids })
        }
        ClientRequest::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let consumer = coordinator
                .consume(connection_id, transport_id, producer_id, rtp_capabilities)
                .await?;
            Ok(ResponsePayload::Consumed {
                consumer_id: consumer.id,
                producer_id: consumer.producer_id,
                kind: consumer.kind,
                rtp_parameters: consumer.rtp_parameters,
            })
        }
        ClientRequest::ResumeConsumer { consumer_id } => {
            let consumer_id = coordinator.resume_consumer(connection_id, consumer_id).await?;
            Ok(ResponsePayload::ConsumerResumed { consumer_id })
        }
        ClientRequest::Ping => Ok(ResponsePayload::Pong),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_request() {
        let message = parse_client_message(r#"{"request_id":1,"type":"join_room","room_id":"r1"}"#).unwrap();
        assert_eq!(message.request_id, 1);
        assert!(matches!(message.request, ClientRequest::JoinRoom { room_id } if room_id == "r1"));
    }

    #[test]
    fn test_parse_keeps_request_id_of_unknown_request() {
        let (request_id, _) = parse_client_message(r#"{"request_id":9,"type":"teleport"}"#).unwrap_err();
        assert_eq!(request_id, Some(9));
    }

    #[test]
    fn test_parse_garbage() {
        let (request_id, _) = parse_client_message("not json").unwrap_err();
        assert_eq!(request_id, None);
    }
}
