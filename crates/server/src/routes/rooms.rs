//! Room directory routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use storetalk_shared::{ChatRoom, ProblemDetails, RoomId, RoomListPage, RoomPage};

use super::ApiProblem;
use crate::middleware::auth::Authorized;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: u32 = 20;
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
}

impl PageQuery {
    fn resolve(&self) -> (u32, u32) {
        let size = self.size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        (self.page.unwrap_or(0), size)
    }
}

/// List rooms, most recently active first
pub async fn list_rooms(
    _auth: Authorized,
    State(state): State<AppState>,
    Query(query): Query<PageQuery>,
) -> Json<RoomListPage> {
    let (page, size) = query.resolve();
    Json(state.list_rooms(page, size).await)
}

pub async fn get_room(
    _auth: Authorized,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<ChatRoom>, ApiProblem> {
    let id = RoomId::new(room_id);
    state
        .room(&id)
        .await
        .map(Json)
        .ok_or_else(|| ProblemDetails::not_found(format!("room {} does not exist", id)).into())
}

/// History page; page 0 is the newest
pub async fn list_messages(
    _auth: Authorized,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<RoomPage>, ApiProblem> {
    let id = RoomId::new(room_id);
    if state.room(&id).await.is_none() {
        return Err(ProblemDetails::not_found(format!("room {} does not exist", id)).into());
    }
    let (page, size) = query.resolve();
    Ok(Json(state.history_page(&id, page, size).await))
}

/// Connect handshake; creates the room on first inquiry
pub async fn connect_room(
    _auth: Authorized,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<ChatRoom>, ApiProblem> {
    let id = RoomId::new(room_id);
    if id.as_str().is_empty() {
        return Err(ProblemDetails::bad_request("room id must not be blank").into());
    }
    Ok(Json(state.ensure_room(&id).await))
}

pub async fn mark_read(
    _auth: Authorized,
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiProblem> {
    let id = RoomId::new(room_id);
    if state.mark_read(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProblemDetails::not_found(format!("room {} does not exist", id)).into())
    }
}
