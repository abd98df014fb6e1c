use axum::{
    Json, Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_gateway::connection;

use crate::auth::{self, AppState};
use crate::chats;
use crate::error::ApiError;
use crate::messages;
use crate::middleware::require_auth;
use crate::users;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// The full HTTP surface: auth, users, chats, messages, the WebSocket
/// gateway and a health check.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health));

    let protected_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/users/me", get(users::me).patch(users::update_me))
        .route("/users/search", get(users::search))
        .route("/users/{user_id}", get(users::get_user))
        .route("/chats", get(chats::list_chats).post(chats::create_chat))
        .route("/chats/{chat_id}", get(chats::get_chat).delete(chats::delete_chat))
        .route(
            "/chats/{chat_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/chats/{chat_id}/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// A `?token=` is checked before the upgrade so a bad token gets a plain
/// 401. Without one the socket opens and must `Identify` first.
async fn ws_upgrade(
    State(state): State<AppState>,
    WithRejection(Query(query), _): WithRejection<Query<GatewayQuery>, ApiError>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let claims = match query.token {
        Some(token) => Some(state.sessions.authenticate(&token).await?),
        None => None,
    };

    let sessions = state.sessions.clone();
    Ok(ws
        .on_upgrade(move |socket| connection::handle_connection(socket, sessions, claims))
        .into_response())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}
