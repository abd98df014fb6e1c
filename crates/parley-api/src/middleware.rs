use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};

use parley_types::ChatError;

use crate::auth::AppState;
use crate::error::ApiError;

/// Require `Authorization: Bearer <token>` naming a live session. The
/// verified claims are put in the request extensions for handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let TypedHeader(Authorization(bearer)) = bearer
        .map_err(|_| ChatError::Unauthenticated("missing bearer token".to_string()))?;

    let claims = state.sessions.authenticate(bearer.token()).await?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
