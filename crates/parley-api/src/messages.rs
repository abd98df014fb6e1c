use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;
use uuid::Uuid;

use parley_types::api::{Claims, EditMessageRequest, SendMessageRequest};
use parley_types::models::Message;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};
use crate::message_log::Page;

/// Cursor-based pagination over `seq`. `after` pages forward for catch-up,
/// `before` pages back into history; without either the newest page comes
/// back. Always ascending.
#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Path(chat_id), _): WithRejection<Path<Uuid>, ApiError>,
    WithRejection(Query(query), _): WithRejection<Query<MessageQuery>, ApiError>,
) -> ApiResult<Json<Vec<Message>>> {
    let page = Page {
        after: query.after,
        before: query.before,
        limit: query.limit,
    };
    Ok(Json(state.messages.list(claims.sub, chat_id, page).await?))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Path(chat_id), _): WithRejection<Path<Uuid>, ApiError>,
    WithRejection(Json(req), _): WithRejection<Json<SendMessageRequest>, ApiError>,
) -> ApiResult<impl IntoResponse> {
    let message = state.messages.append(chat_id, claims.sub, &req.text).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Path((chat_id, message_id)), _): WithRejection<Path<(Uuid, Uuid)>, ApiError>,
    WithRejection(Json(req), _): WithRejection<Json<EditMessageRequest>, ApiError>,
) -> ApiResult<Json<Message>> {
    let message = state
        .messages
        .edit(chat_id, message_id, claims.sub, &req.text)
        .await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Path((chat_id, message_id)), _): WithRejection<Path<(Uuid, Uuid)>, ApiError>,
) -> ApiResult<StatusCode> {
    state.messages.delete(chat_id, message_id, claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}
