use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::middleware::AuthUser;
use crate::error::ApiError;
use crate::gateway::events::is_identifier;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    pub username: String,
    pub display_name: String,
    pub last_seen: DateTime<Utc>,
    pub connections: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineResponse {
    pub board_id: String,
    pub count: usize,
    pub users: Vec<OnlineUser>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/boards/{board_id}/online", get(online_users))
}

/// GET /api/v1/boards/{board_id}/online
async fn online_users(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(board_id): Path<String>,
) -> Result<Json<OnlineResponse>, ApiError> {
    if !is_identifier(&board_id) {
        return Err(ApiError::bad_request("Invalid board id"));
    }
    if !state
        .boards
        .has_board_access(&identity.user_id, &board_id)
        .await?
    {
        return Err(ApiError::forbidden("You do not have access to this board"));
    }

    let users: Vec<OnlineUser> = state
        .hub
        .registry()
        .snapshot(&board_id)
        .into_iter()
        .map(|user| OnlineUser {
            user_id: user.user_id,
            username: user.username,
            display_name: user.display_name,
            last_seen: user.last_seen,
            connections: user.connections,
        })
        .collect();

    Ok(Json(OnlineResponse {
        board_id,
        count: users.len(),
        users,
    }))
}
