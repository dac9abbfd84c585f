use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use murmur_chat::group_reactions;
use murmur_types::api::Claims;
use murmur_types::models::{ConversationSummary, Message};

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_page() -> u32 {
    1
}

fn default_limit() -> u32 {
    50
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();
    let rows = blocking(move || db.list_conversations(&uid)).await?;

    Ok(Json(rows.into_iter().map(|r| r.into_summary()).collect()))
}

/// One page of history. Page 1 is the most recent `limit` messages; rows
/// come back in chronological order for display. Reading a page advances
/// the caller's read watermark.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessagesQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    let limit = query.limit.min(200);
    let page = query.page;

    let (rows, reaction_rows) = blocking(move || {
        let rows = db.list_messages(&cid, &uid, page, limit)?;
        let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let reaction_rows = db.get_reactions_for_messages(&message_ids)?;
        Ok((rows, reaction_rows))
    })
    .await?;

    let mut reaction_map = group_reactions(reaction_rows);
    let messages: Vec<Message> = rows
        .into_iter()
        .map(|row| {
            let groups = reaction_map.remove(&row.id).unwrap_or_default();
            row.into_message(groups)
        })
        .collect();

    Ok(Json(messages))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let cid = conversation_id.to_string();
    let uid = claims.sub.to_string();
    blocking(move || db.mark_read(&cid, &uid)).await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Delete-for-everyone over REST. Emits the same direct
/// `conversation:deleted` notifications as the gateway command.
pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state.chat.clone();
    let actor = claims.sub;
    let plan = blocking(move || chat.delete_conversation(actor, conversation_id)).await?;

    state.dispatcher.deliver(plan).await;

    Ok(StatusCode::NO_CONTENT)
}
