use std::sync::Arc;

use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::WithRejection;

use parley_db::Store;
use parley_gateway::SessionManager;
use parley_types::api::{Claims, LoginRequest, RegisterRequest};

use crate::conversations::ConversationStore;
use crate::error::{ApiError, ApiResult};
use crate::identity::IdentityStore;
use crate::message_log::MessageLog;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub identity: IdentityStore,
    pub conversations: ConversationStore,
    pub messages: MessageLog,
    pub sessions: SessionManager,
}

impl AppStateInner {
    /// Wire the three stores around one storage handle and one session
    /// manager, sharing its per-conversation locks.
    pub fn new(store: Store, sessions: SessionManager) -> AppState {
        let locks = sessions.locks().clone();
        let dispatcher = sessions.dispatcher().clone();

        Arc::new(Self {
            identity: IdentityStore::new(store.clone(), sessions.clone(), locks.clone()),
            conversations: ConversationStore::new(store.clone(), dispatcher.clone(), locks.clone()),
            messages: MessageLog::new(store, dispatcher, locks),
            sessions,
        })
    }
}

pub async fn register(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<RegisterRequest>, ApiError>,
) -> ApiResult<impl IntoResponse> {
    let auth = state
        .identity
        .register(&req.email, &req.password, &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(auth)))
}

pub async fn login(
    State(state): State<AppState>,
    WithRejection(Json(req), _): WithRejection<Json<LoginRequest>, ApiError>,
) -> ApiResult<impl IntoResponse> {
    let auth = state.identity.authenticate(&req.email, &req.password).await?;
    Ok(Json(auth))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    state.identity.logout(&claims).await?;
    Ok(StatusCode::NO_CONTENT)
}
