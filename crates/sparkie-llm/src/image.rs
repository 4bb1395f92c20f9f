use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Serialize;
use serde_json::Value;
use sparkie_types::api::ImageMetadata;
use tracing::{info, warn};

use crate::UPSTREAM_TIMEOUT;
use crate::error::{UpstreamError, check_status};

pub const DEFAULT_IMAGE_MODEL: &str = "Tongyi-MAI/Z-Image-Turbo";
const DEFAULT_STEPS: u32 = 9;

const THEME_KEYWORDS: &[&str] = &["bee", "queen", "honey", "sparkie", "polleneer", "hive"];

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ImageSize {
    pub value: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    #[serde(skip)]
    pub width: u32,
    #[serde(skip)]
    pub height: u32,
}

pub const SUPPORTED_SIZES: &[ImageSize] = &[
    ImageSize { value: "512x512", label: "Square (512x512)", description: "Standard square, good for avatars", width: 512, height: 512 },
    ImageSize { value: "768x768", label: "Square HD (768x768)", description: "Higher resolution square", width: 768, height: 768 },
    ImageSize { value: "1024x1024", label: "Square Ultra (1024x1024)", description: "High resolution, default", width: 1024, height: 1024 },
    ImageSize { value: "1024x768", label: "Landscape (1024x768)", description: "Widescreen format", width: 1024, height: 768 },
    ImageSize { value: "768x1024", label: "Portrait (768x1024)", description: "Vertical format", width: 768, height: 1024 },
];

pub fn is_supported_size(size: &str) -> bool {
    SUPPORTED_SIZES.iter().any(|s| s.value == size)
}

/// Resolve a `WIDTHxHEIGHT` string, falling back to 1024x1024.
pub fn parse_size(size: &str) -> (u32, u32) {
    if let Some(known) = SUPPORTED_SIZES.iter().find(|s| s.value == size) {
        return (known.width, known.height);
    }

    let parsed = size
        .to_ascii_lowercase()
        .split_once('x')
        .and_then(|(w, h)| Some((w.trim().parse().ok()?, h.trim().parse().ok()?)));

    parsed.unwrap_or_else(|| {
        warn!("Invalid image size '{}', using 1024x1024", size);
        (1024, 1024)
    })
}

/// Add the house style to prompts that don't already ask for it.
pub fn enhance_prompt(prompt: &str) -> String {
    let lower = prompt.to_lowercase();

    let mut enhanced = if THEME_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        prompt.to_string()
    } else {
        format!("{prompt}, in elegant artistic style reminiscent of a queen bee's golden kingdom")
    };

    if !lower.contains("high quality") && !lower.contains("photorealistic") {
        enhanced.push_str(", high quality, detailed");
    }

    enhanced
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub url: Option<String>,
    pub b64_json: Option<String>,
    pub metadata: ImageMetadata,
}

/// Client for a ModelScope-style text-to-image endpoint.
pub struct ImageClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl ImageClient {
    pub fn new(api_key: impl Into<String>, endpoint: impl Into<String>) -> Result<Self, UpstreamError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            warn!("Image API key not configured, image generation will be unavailable");
        }

        let http = reqwest::Client::builder().timeout(UPSTREAM_TIMEOUT).build()?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key,
            model: DEFAULT_IMAGE_MODEL.to_string(),
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate(&self, prompt: &str, size: &str, steps: u32) -> Result<GeneratedImage, UpstreamError> {
        if !self.is_configured() {
            return Err(UpstreamError::NotConfigured("image API key is not set".into()));
        }

        let (width, height) = parse_size(size);
        let steps = if (1..=50).contains(&steps) { steps } else { DEFAULT_STEPS };
        let enhanced_prompt = enhance_prompt(prompt);

        let payload = serde_json::json!({
            "model": self.model,
            "prompt": enhanced_prompt,
            "width": width,
            "height": height,
            "num_inference_steps": steps,
            "guidance_scale": 0.0,
        });

        info!("Generating image: {}x{}, steps={}", width, height, steps);

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let body: Value = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        let (url, b64_json) = first_image(&body)?;

        Ok(GeneratedImage {
            url,
            b64_json,
            metadata: ImageMetadata {
                size: format!("{width}x{height}"),
                steps,
                model: self.model.clone(),
                original_prompt: prompt.to_string(),
                enhanced_prompt,
            },
        })
    }

    /// `data:` URL for the image, downloading it when only a URL was returned.
    pub async fn data_url(&self, image: &GeneratedImage) -> Result<Option<String>, UpstreamError> {
        if let Some(b64) = &image.b64_json {
            return Ok(Some(format!("data:image/png;base64,{b64}")));
        }

        let Some(url) = &image.url else {
            return Ok(None);
        };

        let bytes = check_status(self.http.get(url).send().await?).await?.bytes().await?;
        Ok(Some(format!("data:image/png;base64,{}", B64.encode(&bytes))))
    }
}

/// Pull `(url, b64_json)` out of the first image entry. Accepts a bare list
/// or an object wrapping the list under `images` or `data`.
fn first_image(body: &Value) -> Result<(Option<String>, Option<String>), UpstreamError> {
    let list = match body {
        Value::Array(items) => Some(items),
        Value::Object(map) => map
            .get("images")
            .or_else(|| map.get("data"))
            .and_then(Value::as_array),
        _ => None,
    };

    let entry = list
        .and_then(|items| items.first())
        .ok_or_else(|| UpstreamError::Decode("image response contained no images".into()))?;

    let field = |name: &str| entry.get(name).and_then(Value::as_str).map(str::to_string);
    let (url, b64) = (field("url"), field("b64_json"));

    if url.is_none() && b64.is_none() {
        return Err(UpstreamError::Decode("image entry has neither url nor b64_json".into()));
    }

    Ok((url, b64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn enhancement_respects_existing_theme() {
        assert_eq!(
            enhance_prompt("a castle"),
            "a castle, in elegant artistic style reminiscent of a queen bee's golden kingdom, high quality, detailed"
        );
        assert_eq!(
            enhance_prompt("Queen of the hive, photorealistic"),
            "Queen of the hive, photorealistic"
        );
        assert_eq!(enhance_prompt("honey jar"), "honey jar, high quality, detailed");
    }

    #[test]
    fn sizes_resolve_with_fallback() {
        assert_eq!(parse_size("1024x768"), (1024, 768));
        assert_eq!(parse_size("640X480"), (640, 480));
        assert_eq!(parse_size("huge"), (1024, 1024));
        assert!(is_supported_size("768x1024"));
        assert!(!is_supported_size("640x480"));
    }

    #[test]
    fn first_image_accepts_known_shapes() {
        let bare = json!([{ "url": "https://img/1.png" }]);
        assert_eq!(first_image(&bare).unwrap().0.as_deref(), Some("https://img/1.png"));

        let wrapped = json!({ "images": [{ "b64_json": "AAAA" }] });
        assert_eq!(first_image(&wrapped).unwrap().1.as_deref(), Some("AAAA"));

        assert!(first_image(&json!([])).is_err());
        assert!(first_image(&json!({ "images": [{}] })).is_err());
        assert!(first_image(&json!("nope")).is_err());
    }

    #[tokio::test]
    async fn unconfigured_client_fails_without_network() {
        let client = ImageClient::new("", "http://127.0.0.1:9/never").unwrap();
        assert!(!client.is_configured());
        let err = client.generate("bee", "512x512", 9).await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn inline_base64_becomes_data_url() {
        let client = ImageClient::new("key", "http://127.0.0.1:9/never").unwrap();
        let image = GeneratedImage {
            url: None,
            b64_json: Some("AAAA".into()),
            metadata: ImageMetadata {
                size: "512x512".into(),
                steps: 9,
                model: DEFAULT_IMAGE_MODEL.into(),
                original_prompt: "bee".into(),
                enhanced_prompt: "bee".into(),
            },
        };
        assert_eq!(
            client.data_url(&image).await.unwrap().as_deref(),
            Some("data:image/png;base64,AAAA")
        );
    }
}
