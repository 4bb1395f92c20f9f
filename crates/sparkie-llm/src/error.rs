use thiserror::Error;

/// Failure talking to a remote model service.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream service is not configured: {0}")]
    NotConfigured(String),

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream rejected the API key")]
    Unauthorized,

    #[error("upstream rate limit exceeded")]
    RateLimited,

    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected upstream payload: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, UpstreamError::Transport(e) if e.is_timeout())
    }
}

/// Turn a non-2xx response into an error; successful responses pass through.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status.as_u16() {
        401 => Err(UpstreamError::Unauthorized),
        429 => Err(UpstreamError::RateLimited),
        code => {
            let body = response.text().await.unwrap_or_default();
            Err(UpstreamError::Status {
                status: code,
                body: body.chars().take(200).collect(),
            })
        }
    }
}
