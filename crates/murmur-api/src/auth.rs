use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use rand::Rng;
use rand::distr::Alphanumeric;
use uuid::Uuid;

use murmur_chat::{ChatError, ChatService};
use murmur_db::Database;
use murmur_gateway::dispatcher::Dispatcher;
use murmur_types::api::{
    Claims, LoginRequest, LoginResponse, RefreshRequest, RefreshResponse, RegisterRequest,
    RegisterResponse,
};

use crate::blocking;
use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub chat: ChatService,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Validate input
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ChatError::Validation("username must be 3-32 characters".into()).into());
    }
    if req.password.len() < 8 {
        return Err(ChatError::Validation("password must be at least 8 characters".into()).into());
    }
    if !req.email.contains('@') {
        return Err(ChatError::Validation("invalid email address".into()).into());
    }

    // Check if username is taken
    let db = state.db.clone();
    let username = req.username.clone();
    if blocking(move || db.get_user_by_username(&username)).await?.is_some() {
        return Err(ChatError::Validation("username already taken".into()).into());
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let password_hash = argon2
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ChatError::Storage(format!("password hash failed: {}", e)))?
        .to_string();

    let user_id = Uuid::new_v4();
    let refresh_token = generate_refresh_token();

    let db = state.db.clone();
    let username = req.username.clone();
    let email = req.email.clone();
    let rt = refresh_token.clone();
    blocking(move || {
        db.create_user(&user_id.to_string(), &username, &email, &password_hash)?;
        db.set_refresh_token(&user_id.to_string(), Some(&rt))
    })
    .await?;

    let token = create_token(&state.jwt_secret, user_id, &req.username)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id,
            token,
            refresh_token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = blocking(move || db.get_user_by_username(&username))
        .await?
        .ok_or_else(|| ChatError::Unauthorized("invalid credentials".into()))?;

    // Verify password
    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| ChatError::Storage(format!("corrupt password hash: {}", e)))?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ChatError::Unauthorized("invalid credentials".into()))?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|_| ChatError::Storage("corrupt user id".into()))?;

    // Rotate the refresh token on every login
    let refresh_token = generate_refresh_token();
    let db = state.db.clone();
    let uid = user.id.clone();
    let rt = refresh_token.clone();
    blocking(move || db.set_refresh_token(&uid, Some(&rt))).await?;

    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        token,
        refresh_token,
    }))
}

/// Exchange a refresh token for a fresh access token. The refresh token
/// is rotated: the presented one stops working.
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let db = state.db.clone();
    let presented = req.refresh_token.clone();
    let user = blocking(move || db.get_user_by_refresh_token(&presented))
        .await?
        .ok_or_else(|| ChatError::Unauthorized("invalid refresh token".into()))?;

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|_| ChatError::Storage("corrupt user id".into()))?;

    let refresh_token = generate_refresh_token();
    let db = state.db.clone();
    let uid = user.id.clone();
    let rt = refresh_token.clone();
    blocking(move || db.set_refresh_token(&uid, Some(&rt))).await?;

    let token = create_token(&state.jwt_secret, user_id, &user.username)?;

    Ok(Json(RefreshResponse {
        token,
        refresh_token,
    }))
}

fn create_token(secret: &str, user_id: Uuid, username: &str) -> Result<String, ChatError> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(7)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ChatError::Storage(format!("token encoding failed: {}", e)))
}

/// Opaque 256-bit random token, rotated on every issue.
fn generate_refresh_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect()
}
