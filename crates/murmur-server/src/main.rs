use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use murmur_api::auth::{self, AppState, AppStateInner};
use murmur_api::conversations;
use murmur_api::middleware::require_auth;
use murmur_api::posts;
use murmur_api::users;
use murmur_chat::ChatService;
use murmur_gateway::connection;
use murmur_gateway::dispatcher::Dispatcher;
use murmur_types::api::Claims;

#[derive(Clone)]
struct ServerState {
    chat: ChatService,
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("MURMUR_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let db_path = std::env::var("MURMUR_DB_PATH").unwrap_or_else(|_| "murmur.db".into());
    let host = std::env::var("MURMUR_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("MURMUR_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    // Init database
    let db = Arc::new(murmur_db::Database::open(&PathBuf::from(&db_path))?);

    // Shared state: the dispatcher owns presence, the chat service owns
    // store orchestration; REST and the gateway share both.
    let dispatcher = Dispatcher::new();
    let chat = ChatService::new(db.clone());

    let app_state: AppState = Arc::new(AppStateInner {
        db,
        chat: chat.clone(),
        dispatcher: dispatcher.clone(),
        jwt_secret: jwt_secret.clone(),
    });

    let state = ServerState {
        chat,
        dispatcher,
        jwt_secret,
    };

    // Routes
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/users/{user_id}", get(users::get_user))
        .route("/conversations", get(conversations::list_conversations))
        .route(
            "/conversations/{conversation_id}/messages",
            get(conversations::get_messages),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::mark_read),
        )
        .route(
            "/conversations/{conversation_id}",
            delete(conversations::delete_conversation),
        )
        .route("/posts", get(posts::list_posts).post(posts::create_post))
        .route("/posts/{post_id}", delete(posts::delete_post))
        .route("/posts/{post_id}/like", post(posts::toggle_like))
        .route(
            "/posts/{post_id}/comments",
            get(posts::list_comments).post(posts::create_comment),
        )
        .layer(middleware::from_fn(require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(state);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Murmur server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// The credential rides the upgrade request as a query parameter; a bad
/// or missing token is rejected with 401 before any socket state exists.
async fn ws_upgrade(
    State(state): State<ServerState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = query.token else {
        return unauthorized("missing token");
    };

    let claims = match decode::<Claims>(
        &token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data.claims,
        Err(_) => return unauthorized("invalid or expired token"),
    };

    ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            state.dispatcher,
            state.chat,
            claims.sub,
            claims.username,
        )
    })
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
