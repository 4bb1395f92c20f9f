use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sparkie_types::models::ChatMessage;
use tracing::{debug, info};

use crate::UPSTREAM_TIMEOUT;
use crate::error::{UpstreamError, check_status};
use crate::sse::parse_sse_stream;

/// Forward-only, non-restartable sequence of response fragments. The
/// concatenation of every `Ok` item is the complete reply.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, UpstreamError>> + Send>>;

/// Per-call overrides. `None` leaves the provider default in place.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A chat-completion backend.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Buffered completion: resolves once the whole reply is available.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<String, UpstreamError>;

    /// Streaming completion.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<TextStream, UpstreamError>;
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Client for any endpoint speaking the OpenAI chat-completions protocol
/// (MiniMax by default). Plain HTTP, no SDK.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(
        api_key: &str,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, UpstreamError> {
        Self::with_timeout(api_key, endpoint, model, UPSTREAM_TIMEOUT)
    }

    /// `timeout` bounds connecting and every gap between reads. Buffered
    /// completions are additionally capped at `timeout` overall; streams are
    /// not, so a long reply keeps flowing as long as the upstream does.
    pub fn with_timeout(
        api_key: &str,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        if api_key.is_empty() {
            return Err(UpstreamError::NotConfigured("chat API key is empty".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", api_key))
                .map_err(|_| UpstreamError::NotConfigured("chat API key is not a valid header".into()))?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;

        let model = model.into();
        info!("Chat client initialized with model {}", model);

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            model,
            timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        options: ChatOptions,
        stream: bool,
    ) -> CompletionRequest<'a> {
        CompletionRequest {
            model: &self.model,
            messages,
            stream,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        }
    }

    async fn send(&self, body: &CompletionRequest<'_>) -> Result<reqwest::Response, UpstreamError> {
        debug!(
            model = %self.model,
            messages = body.messages.len(),
            stream = body.stream,
            "sending chat completion request"
        );
        let mut request = self.http.post(&self.endpoint).json(body);
        if !body.stream {
            request = request.timeout(self.timeout);
        }
        let response = request.send().await?;
        check_status(response).await
    }
}

#[async_trait]
impl ChatClient for OpenAiCompatClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<String, UpstreamError> {
        let response = self.send(&self.request(messages, options, false)).await?;
        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Decode("response contained no choices".into()))?;

        Ok(choice.message.content.unwrap_or_default())
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: ChatOptions,
    ) -> Result<TextStream, UpstreamError> {
        let response = self.send(&self.request(messages, options, true)).await?;
        Ok(parse_sse_stream(response.bytes_stream()))
    }
}
