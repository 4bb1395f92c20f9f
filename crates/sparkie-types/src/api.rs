use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Role;

pub const MAX_MESSAGE_CHARS: usize = 10_000;
pub const MAX_PROMPT_CHARS: usize = 1_000;

// -- JWT Claims --

/// Access token claims. `sub` carries the numeric user id as a string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), String> {
        let name_len = self.username.chars().count();
        if !(3..=50).contains(&name_len) {
            return Err("username must be between 3 and 50 characters".into());
        }
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => {}
            _ => return Err("email address is not valid".into()),
        }
        if self.password.chars().count() < 8 {
            return Err("password must be at least 8 characters".into());
        }
        Ok(())
    }
}

/// OAuth2 password-grant form body.
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// -- Chat --

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), String> {
        let len = self.message.chars().count();
        if len == 0 || len > MAX_MESSAGE_CHARS {
            return Err(format!(
                "message must be between 1 and {} characters",
                MAX_MESSAGE_CHARS
            ));
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("temperature ({t}) must be between 0 and 2"));
            }
        }
        if let Some(m) = self.max_tokens {
            if !(1..=4096).contains(&m) {
                return Err(format!("max_tokens ({m}) must be between 1 and 4096"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: i64,
    pub message: String,
}

/// One `data:` frame of the streaming chat response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub chunk: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamFrame {
    pub fn chunk(chunk: impl Into<String>) -> Self {
        Self {
            chunk: chunk.into(),
            done: false,
            conversation_id: None,
            error: None,
        }
    }

    pub fn done(conversation_id: i64) -> Self {
        Self {
            chunk: String::new(),
            done: true,
            conversation_id: Some(conversation_id),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            chunk: String::new(),
            done: true,
            conversation_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// -- Images --

fn default_size() -> String {
    "1024x1024".to_string()
}

fn default_steps() -> u32 {
    9
}

#[derive(Debug, Deserialize)]
pub struct ImageGenerateRequest {
    pub prompt: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_steps")]
    pub steps: u32,
}

impl ImageGenerateRequest {
    pub fn validate(&self) -> Result<(), String> {
        let len = self.prompt.chars().count();
        if len == 0 || len > MAX_PROMPT_CHARS {
            return Err(format!(
                "prompt must be between 1 and {} characters",
                MAX_PROMPT_CHARS
            ));
        }
        if !(1..=50).contains(&self.steps) {
            return Err("steps must be between 1 and 50".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub size: String,
    pub steps: u32,
    pub model: String,
    pub original_prompt: String,
    pub enhanced_prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageGenerateResponse {
    pub success: bool,
    pub url: Option<String>,
    pub data_url: Option<String>,
    pub message: String,
    pub metadata: Option<ImageMetadata>,
    pub error: Option<String>,
}

// -- Misc --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
    pub database: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(message: &str) -> ChatRequest {
        serde_json::from_value(serde_json::json!({ "message": message })).unwrap()
    }

    #[test]
    fn chat_request_defaults_to_streaming() {
        let req = chat("hi");
        assert!(req.stream);
        assert!(req.conversation_id.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn chat_request_bounds() {
        assert!(chat("").validate().is_err());
        assert!(chat(&"x".repeat(MAX_MESSAGE_CHARS)).validate().is_ok());
        assert!(chat(&"x".repeat(MAX_MESSAGE_CHARS + 1)).validate().is_err());

        let mut req = chat("hi");
        req.temperature = Some(2.5);
        assert!(req.validate().is_err());
        req.temperature = Some(0.0);
        req.max_tokens = Some(0);
        assert!(req.validate().is_err());
        req.max_tokens = Some(4096);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn stream_frames_match_wire_shape() {
        let chunk = serde_json::to_value(StreamFrame::chunk("Hi")).unwrap();
        assert_eq!(chunk, serde_json::json!({ "chunk": "Hi", "done": false }));

        let done = serde_json::to_value(StreamFrame::done(7)).unwrap();
        assert_eq!(
            done,
            serde_json::json!({ "chunk": "", "done": true, "conversation_id": 7 })
        );
    }

    #[test]
    fn register_validation() {
        let ok = RegisterRequest {
            username: "bee".into(),
            email: "bee@hive.io".into(),
            password: "honeycomb".into(),
        };
        assert!(ok.validate().is_ok());

        let bad_email = RegisterRequest { email: "nobody".into(), ..ok };
        assert!(bad_email.validate().is_err());
    }
}
