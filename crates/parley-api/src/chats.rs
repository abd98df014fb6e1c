use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use parley_types::api::{Claims, CreateConversationRequest};
use parley_types::models::Conversation;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

pub async fn list_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Conversation>>> {
    Ok(Json(state.conversations.list_for(claims.sub).await?))
}

/// 201 when the conversation is new, 200 when the pair already had one.
pub async fn create_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<CreateConversationRequest>, ApiError>,
) -> ApiResult<impl IntoResponse> {
    let (conversation, created) = state
        .conversations
        .find_or_create(claims.sub, req.participant_id)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(conversation)))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Path(chat_id), _): WithRejection<Path<Uuid>, ApiError>,
) -> ApiResult<Json<Conversation>> {
    Ok(Json(state.conversations.get(claims.sub, chat_id).await?))
}

pub async fn delete_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Path(chat_id), _): WithRejection<Path<Uuid>, ApiError>,
) -> ApiResult<StatusCode> {
    state.conversations.delete(claims.sub, chat_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
