pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{DefaultBodyLimit, Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use macfind_api::middleware::{decode_token, require_auth};
use macfind_api::storage::{self, Storage};
use macfind_api::vision::{GeminiClient, VisionClient};
use macfind_api::{AppState, AppStateInner, auth, items, messages, upload};
use macfind_db::Database;
use macfind_gateway::connection;
use macfind_gateway::dispatcher::Dispatcher;

use crate::config::Config;

/// Request bodies above this are rejected before any handler runs.
const MAX_BODY_SIZE: usize = 12 * 1024 * 1024;

/// Open the store and object storage and wire up shared state.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let db = Database::open(&config.db_path)?;
    let storage = Storage::new(config.storage_dir.clone(), &config.public_url).await?;

    let vision: Option<Arc<dyn VisionClient>> = match &config.gemini_api_key {
        Some(key) => Some(Arc::new(GeminiClient::new(key.clone(), config.gemini_model.clone()))),
        None => {
            warn!("GEMINI_API_KEY missing; vision uploads will fail");
            None
        }
    };

    Ok(Arc::new(AppStateInner {
        db,
        dispatcher: Dispatcher::new(),
        storage,
        vision,
        jwt_secret: config.jwt_secret.clone(),
        site_url: config.site_url.clone(),
        email_domain: config.email_domain.clone(),
    }))
}

pub fn app(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/magic-link", post(auth::magic_link))
        .route("/auth/verify", post(auth::verify))
        .route("/items", get(items::list_items))
        .route("/items/{item_id}", get(items::get_item))
        .route("/storage/{bucket}/{*path}", get(storage::serve_object))
        .route("/realtime", get(realtime))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/auth/session", get(auth::session))
        .route("/api/upload-item", post(upload::upload_item))
        .route("/items", post(items::post_found))
        .route("/items/{item_id}", axum::routing::delete(items::delete_item))
        .route("/items/{item_id}/status", patch(items::set_status))
        .route("/items/{item_id}/claim", post(items::claim_item))
        .route("/items/{item_id}/threads", get(items::list_threads))
        .route("/items/{item_id}/messages", get(messages::get_thread).post(messages::send_message))
        .route("/items/{item_id}/threads/{other_id}/read", post(messages::mark_thread_read))
        .route("/messages/unread", get(messages::unread))
        .route("/messages/{message_id}/read", post(messages::mark_message_read))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct RealtimeQuery {
    token: String,
}

/// GET /realtime?token= — the session token is checked before the upgrade.
async fn realtime(
    State(state): State<AppState>,
    Query(query): Query<RealtimeQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, StatusCode> {
    let claims = decode_token(&state.jwt_secret, &query.token).ok_or(StatusCode::UNAUTHORIZED)?;
    let dispatcher = state.dispatcher.clone();

    info!("Realtime upgrade for {}", claims.sub);
    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, claims.sub)))
}

pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

#[cfg(test)]
mod tests;
