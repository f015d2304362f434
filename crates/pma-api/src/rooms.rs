//! Room routes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use pma_core::Room;
use pma_registries::RoomStats;
use pma_unified::RoomWithEntities;
use serde::Deserialize;

use crate::{ApiResponse, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    #[serde(default)]
    pub include_entities: bool,
}

/// GET /api/rooms
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
) -> Json<ApiResponse<Vec<RoomWithEntities>>> {
    let rooms = state.service.get_rooms(query.include_entities);
    let meta = serde_json::json!({ "count": rooms.len() });
    ApiResponse::ok_with_meta(rooms, meta)
}

/// GET /api/rooms/:id
pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RoomQuery>,
) -> ApiResult<Json<ApiResponse<RoomWithEntities>>> {
    Ok(ApiResponse::ok(
        state.service.get_room(&id, query.include_entities)?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct WriteRoomRequest {
    pub name: Option<String>,
    pub icon: Option<String>,
    pub description: Option<String>,
}

/// POST /api/rooms
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<WriteRoomRequest>,
) -> ApiResult<Json<ApiResponse<Room>>> {
    let name = body.name.unwrap_or_default();
    Ok(ApiResponse::ok(state.service.create_room(
        &name,
        body.icon,
        body.description,
    )?))
}

/// PUT /api/rooms/:id
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<WriteRoomRequest>,
) -> ApiResult<Json<ApiResponse<Room>>> {
    Ok(ApiResponse::ok(state.service.update_room(
        &id,
        body.name,
        body.icon,
        body.description,
    )?))
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteRoomQuery {
    pub reassign_to_room_id: Option<String>,
}

/// DELETE /api/rooms/:id?reassign_to_room_id=
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DeleteRoomQuery>,
) -> ApiResult<Json<ApiResponse<&'static str>>> {
    state
        .service
        .delete_room(&id, query.reassign_to_room_id.as_deref())?;
    Ok(ApiResponse::ok("deleted"))
}

/// GET /api/rooms/stats
pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<RoomStats>> {
    ApiResponse::ok(state.service.room_stats())
}
