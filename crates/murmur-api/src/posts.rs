use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use murmur_chat::ChatError;
use murmur_types::api::{Claims, CreateCommentRequest, CreatePostRequest};
use murmur_types::events::GatewayEvent;
use murmur_types::models::{Comment, Post};

use crate::auth::AppState;
use crate::blocking;
use crate::error::ApiError;

const MAX_POST_LEN: usize = 4000;

#[derive(Debug, Deserialize)]
pub struct FeedQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

pub async fn list_posts(
    State(state): State<AppState>,
    Query(query): Query<FeedQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<Json<Vec<Post>>, ApiError> {
    let db = state.db.clone();
    let limit = query.limit.min(200);
    let rows = blocking(move || db.list_posts(limit)).await?;

    Ok(Json(rows.into_iter().map(|r| r.into_post()).collect()))
}

/// Feed events fan out to every connected socket, with no per-room scoping.
pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ChatError::Validation("post content must not be empty".into()).into());
    }
    if content.chars().count() > MAX_POST_LEN {
        return Err(ChatError::Validation(format!(
            "post content exceeds {} characters",
            MAX_POST_LEN
        ))
        .into());
    }

    let db = state.db.clone();
    let post_id = Uuid::new_v4();
    let author = claims.sub.to_string();
    let row = blocking(move || db.insert_post(&post_id.to_string(), &author, &content)).await?;
    let post = row.into_post();

    state
        .dispatcher
        .broadcast(GatewayEvent::PostNew { post: post.clone() });

    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn delete_post(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let actor = claims.sub.to_string();
    blocking(move || db.delete_post(&post_id.to_string(), &actor)).await?;

    state
        .dispatcher
        .broadcast(GatewayEvent::PostRemoved { post_id });

    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_like(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let actor = claims.sub.to_string();
    let liked = blocking(move || db.toggle_post_like(&post_id.to_string(), &actor)).await?;

    state.dispatcher.broadcast(GatewayEvent::PostLiked {
        post_id,
        user_id: claims.sub,
        liked,
    });

    Ok(Json(serde_json::json!({ "liked": liked })))
}

pub async fn list_comments(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(_claims): Extension<Claims>,
) -> Result<Json<Vec<Comment>>, ApiError> {
    let db = state.db.clone();
    let rows = blocking(move || db.list_comments(&post_id.to_string())).await?;

    Ok(Json(rows.into_iter().map(|r| r.into_comment()).collect()))
}

pub async fn create_comment(
    State(state): State<AppState>,
    Path(post_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ChatError::Validation("comment content must not be empty".into()).into());
    }

    let db = state.db.clone();
    let comment_id = Uuid::new_v4();
    let author = claims.sub.to_string();
    let row = blocking(move || {
        db.insert_comment(
            &comment_id.to_string(),
            &post_id.to_string(),
            &author,
            &content,
        )
    })
    .await?;

    Ok((StatusCode::CREATED, Json(row.into_comment())))
}
