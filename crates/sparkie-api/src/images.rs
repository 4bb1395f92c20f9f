use axum::{Extension, Json, extract::State};
use serde_json::{Value, json};
use tracing::{info, warn};

use sparkie_llm::image::is_supported_size;
use sparkie_llm::{SUPPORTED_SIZES, UpstreamError};
use sparkie_types::api::{ImageGenerateRequest, ImageGenerateResponse};

use crate::error::ApiError;
use crate::middleware::CurrentUser;
use crate::state::AppState;

/// Seconds a caller is told to back off when the image provider throttles us.
const UPSTREAM_RETRY_AFTER: u64 = 60;

fn failure(message: &str, error: impl Into<String>) -> Json<ImageGenerateResponse> {
    Json(ImageGenerateResponse {
        success: false,
        url: None,
        data_url: None,
        message: message.to_string(),
        metadata: None,
        error: Some(error.into()),
    })
}

pub async fn generate_image(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<ImageGenerateRequest>,
) -> Result<Json<ImageGenerateResponse>, ApiError> {
    req.validate().map_err(ApiError::Validation)?;

    if !is_supported_size(&req.size) {
        let sizes: Vec<_> = SUPPORTED_SIZES.iter().map(|s| s.value).collect();
        return Err(ApiError::BadRequest(format!(
            "Invalid size. Must be one of: {}",
            sizes.join(", ")
        )));
    }

    info!(user_id = user.id, size = %req.size, "Image generation requested");

    let image = match state.images.generate(&req.prompt, &req.size, req.steps).await {
        Ok(image) => image,
        Err(UpstreamError::NotConfigured(_)) => {
            return Ok(failure("Image generation is not configured", "not_configured"));
        }
        Err(UpstreamError::RateLimited) => {
            return Err(ApiError::RateLimited {
                retry_after: UPSTREAM_RETRY_AFTER,
            });
        }
        Err(e) if e.is_timeout() => {
            warn!(user_id = user.id, "Image generation timed out");
            return Ok(failure("Image generation timed out. Please try again.", "timeout"));
        }
        Err(e @ UpstreamError::Unauthorized) => return Err(state.upstream_error(&e)),
        Err(e) => {
            warn!(user_id = user.id, "Image generation failed: {}", e);
            let error = if state.debug { e.to_string() } else { "generation_failed".to_string() };
            return Ok(failure("Image generation failed", error));
        }
    };

    // The image itself was produced, so a failed download still counts as success
    let data_url = match state.images.data_url(&image).await {
        Ok(data_url) => data_url,
        Err(e) => {
            warn!("Could not inline generated image: {}", e);
            None
        }
    };

    Ok(Json(ImageGenerateResponse {
        success: true,
        url: image.url,
        data_url,
        message: "Image generated successfully! 🐝✨".to_string(),
        metadata: Some(image.metadata),
        error: None,
    }))
}

pub async fn image_sizes() -> Json<Value> {
    Json(json!({
        "sizes": SUPPORTED_SIZES,
        "default": "1024x1024",
        "recommended": "1024x1024",
    }))
}

pub async fn image_status(State(state): State<AppState>) -> Json<Value> {
    let configured = state.images.is_configured();
    Json(json!({
        "service": "ModelScope Z-Image-Turbo",
        "status": if configured { "available" } else { "not_configured" },
        "api_key_configured": configured,
        "model": state.images.model(),
        "free_tier": true,
        "message": if configured {
            "Ready to generate beautiful images!"
        } else {
            "Set SPARKIE_IMAGE_API_KEY to enable image generation"
        },
    }))
}
