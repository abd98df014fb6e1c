use axum::{
    Extension, Json,
    extract::{Path, Query, State},
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;
use uuid::Uuid;

use parley_types::api::{Claims, UpdateProfileRequest};
use parley_types::models::User;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.identity.get(claims.sub).await?))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Json(req), _): WithRejection<Json<UpdateProfileRequest>, ApiError>,
) -> ApiResult<Json<User>> {
    let user = state
        .identity
        .update_profile(claims.sub, &req.name, req.avatar)
        .await?;
    Ok(Json(user))
}

pub async fn search(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    WithRejection(Query(query), _): WithRejection<Query<SearchQuery>, ApiError>,
) -> ApiResult<Json<Vec<User>>> {
    Ok(Json(state.identity.search(claims.sub, &query.q).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    WithRejection(Path(user_id), _): WithRejection<Path<Uuid>, ApiError>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.identity.get(user_id).await?))
}
