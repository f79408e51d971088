use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use setlist_sync::RoomId;

use crate::registry::RoomStatus;
use crate::AppState;

#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    BadRequest(String),
    Unavailable(&'static str),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.to_string()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg.to_string())
            }
        };
        (
            status,
            Json(ApiErrorBody {
                error,
                message: Some(message),
            }),
        )
            .into_response()
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "rooms": state.registry.room_count(),
    }))
}

pub async fn room_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RoomStatus>, ApiError> {
    let room_id = RoomId::parse(&id).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    state
        .registry
        .status(&room_id)
        .map(Json)
        .ok_or(ApiError::NotFound("room not found"))
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateParams {
    #[serde(default)]
    pub words: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedRoomId {
    pub room_id: RoomId,
}

pub async fn generate_room_id(
    State(state): State<AppState>,
    Query(params): Query<GenerateParams>,
) -> Result<Json<GeneratedRoomId>, ApiError> {
    state
        .registry
        .unused_room_id(params.words)
        .map(|room_id| Json(GeneratedRoomId { room_id }))
        .map_err(|_| ApiError::Unavailable("no unused room id available"))
}

pub async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    state
        .metrics
        .as_ref()
        .map(|handle| handle.render())
        .ok_or(ApiError::NotFound("metrics recorder not installed"))
}
