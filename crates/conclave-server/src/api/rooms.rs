use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use conclave_protocol::{RoomId, RoomSummary};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RoomStats {
    pub connections: usize,
    pub rooms: Vec<RoomSummary>,
}

pub async fn list_rooms(State(state): State<AppState>) -> Json<RoomStats> {
    Json(RoomStats {
        connections: state.coordinator.connection_count().await,
        rooms: state.coordinator.room_summaries().await,
    })
}

pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomSummary>> {
    let not_found = || AppError::NotFound(format!("room {}", room_id));

    let room_id = RoomId::parse(&room_id).map_err(|_| not_found())?;
    state
        .coordinator
        .room_summary(&room_id)
        .await
        .map(Json)
        .ok_or_else(not_found)
}
