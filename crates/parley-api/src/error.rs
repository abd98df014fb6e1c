use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use tracing::error;

use parley_types::ChatError;
use parley_types::api::ErrorBody;

/// HTTP face of `ChatError`.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        Self(err)
    }
}

// Malformed bodies, paths and query strings answer with the same error
// envelope as every other bad argument.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ChatError::InvalidArgument(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(ChatError::InvalidArgument(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(ChatError::InvalidArgument(rejection.body_text()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ChatError::Unauthenticated(_) | ChatError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ChatError::Forbidden(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::DuplicateEmail => StatusCode::CONFLICT,
            ChatError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ChatError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ChatError::Internal(detail) = &self.0 {
            error!("Internal error: {}", detail);
        }

        let status = self.status();
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.public_message(),
        };

        let mut response = (status, Json(body)).into_response();
        if self.0.is_transient() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn internal_details_are_hidden() {
        let response = ApiError(ChatError::Internal("disk on fire".into())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json["error"], "internal");
        assert_eq!(json["message"], "internal error");
    }

    #[tokio::test]
    async fn transient_asks_for_retry() {
        let response = ApiError(ChatError::Transient("busy".into())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn statuses_follow_kind() {
        assert_eq!(ApiError(ChatError::DuplicateEmail).status(), StatusCode::CONFLICT);
        assert_eq!(ApiError(ChatError::InvalidCredentials).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError(ChatError::Forbidden("x".into())).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            ApiError(ChatError::InvalidArgument("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
    }
}
