use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use sparkie_types::api::ErrorResponse;
use thiserror::Error;
use tracing::error;

/// Every failure a handler can surface. Each variant maps to exactly one
/// status code and a JSON `{error, detail?}` body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("rate limit exceeded, retry in {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("invalid authentication credentials")]
    Unauthorized,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// `expose` controls whether `detail` reaches the client.
    #[error("upstream failure: {detail}")]
    Upstream { detail: String, expose: bool },

    #[error("internal error: {detail}")]
    Internal { detail: String, expose: bool },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorResponse {
        let (error, detail) = match self {
            ApiError::RateLimited { retry_after } => (
                "Rate limit exceeded".to_string(),
                Some(format!("Try again in {} seconds", retry_after)),
            ),
            ApiError::Unauthorized => ("Invalid authentication credentials".to_string(), None),
            ApiError::Validation(msg) => ("Validation error".to_string(), Some(msg.clone())),
            ApiError::BadRequest(msg) => ("Bad request".to_string(), Some(msg.clone())),
            ApiError::Conflict(msg) => ("Conflict".to_string(), Some(msg.clone())),
            ApiError::NotFound(msg) => ("Not found".to_string(), Some(msg.clone())),
            ApiError::Upstream { detail, expose } => (
                "Upstream service failure".to_string(),
                expose.then(|| detail.clone()),
            ),
            ApiError::Internal { detail, expose } => (
                "Internal server error".to_string(),
                expose.then(|| detail.clone()),
            ),
        };
        ErrorResponse { error, detail }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Upstream { detail, .. } => error!("Upstream error: {}", detail),
            ApiError::Internal { detail, .. } => error!("Internal error: {}", detail),
            _ => {}
        }

        let status = self.status();
        let mut response = (status, Json(self.body())).into_response();

        match &self {
            ApiError::RateLimited { retry_after } => {
                if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert(header::RETRY_AFTER, value);
                }
            }
            ApiError::Unauthorized => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_stable() {
        assert_eq!(ApiError::Validation("x".into()).status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::Upstream { detail: "x".into(), expose: false }.status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn hidden_detail_stays_hidden() {
        let hidden = ApiError::Internal { detail: "db path /secret".into(), expose: false };
        assert!(hidden.body().detail.is_none());

        let shown = ApiError::Internal { detail: "db path /secret".into(), expose: true };
        assert_eq!(shown.body().detail.as_deref(), Some("db path /secret"));
    }

    #[test]
    fn rate_limited_sets_retry_after() {
        let response = ApiError::RateLimited { retry_after: 7 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "7");
    }

    #[test]
    fn unauthorized_challenges_bearer() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }
}
