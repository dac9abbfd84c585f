use axum::{
    Extension, Json,
    extract::{Path, State},
};
use uuid::Uuid;

use murmur_chat::ChatError;
use murmur_types::api::Claims;
use murmur_types::models::User;

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

/// Public profile lookup: id, username and last-seen, used to find the
/// other side of a conversation. Never exposes the password hash or
/// refresh token.
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<Json<User>, ApiError> {
    let db = state.db.clone();
    let row = blocking(move || db.get_user_by_id(&user_id.to_string()))
        .await?
        .ok_or_else(|| ChatError::NotFound(format!("user {} not found", user_id)))?;

    Ok(Json(row.into_user()))
}
