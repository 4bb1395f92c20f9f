use std::any::Any;

use axum::{
    Json, Router,
    http::{StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use tower_http::catch_panic::CatchPanicLayer;
use sparkie_types::api::ErrorResponse;

use crate::error::ApiError;
use crate::middleware::require_auth;
use crate::rate_limit::rate_limit;
use crate::state::AppState;
use crate::{auth, chat, health, images};

/// The full application router. Transport concerns (CORS, request tracing)
/// are layered on by the binary.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/generate/image/sizes", get(images::image_sizes));

    let protected = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/chat", post(chat::chat))
        .route("/chat/stream", post(chat::chat_stream))
        .route("/chat/conversations", get(chat::list_conversations))
        .route("/chat/conversations/{conversation_id}", delete(chat::delete_conversation))
        .route("/chat/conversations/{conversation_id}/messages", get(chat::get_messages))
        .route("/generate/image", post(images::generate_image))
        .route("/generate/image/status", get(images::image_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let api = public
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(health::health))
        .nest("/api/v1", api)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

async fn not_found(uri: Uri) -> Response {
    let body = ErrorResponse {
        error: "Not found".to_string(),
        detail: Some(format!("No route for {}", uri.path())),
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let detail = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic payload".to_string());

    // Logged by ApiError::into_response
    ApiError::Internal {
        detail: format!("handler panicked: {}", detail),
        expose: false,
    }
    .into_response()
}
