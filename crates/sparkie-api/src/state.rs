use std::fmt::Display;
use std::sync::Arc;

use sparkie_db::Database;
use sparkie_llm::{ImageClient, UpstreamError};

use crate::error::ApiError;
use crate::rate_limit::RateLimiter;
use crate::relay::{ChatRelay, RelayError};
use crate::store;

pub type AppState = Arc<AppStateInner>;

/// Token signing settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
}

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub auth: AuthSettings,
    pub rate_limiter: RateLimiter,
    pub relay: ChatRelay,
    pub images: ImageClient,
    /// Include internal and upstream error detail in responses.
    pub debug: bool,
}

impl AppStateInner {
    /// Run a query on the blocking pool, mapping failures to a 500.
    pub async fn with_db<F, T>(&self, f: F) -> Result<T, ApiError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        store::blocking(&self.db, f)
            .await
            .map_err(|e| self.internal_error(format!("{:#}", e)))
    }

    pub fn internal_error(&self, detail: impl Display) -> ApiError {
        ApiError::Internal {
            detail: detail.to_string(),
            expose: self.debug,
        }
    }

    pub fn upstream_error(&self, err: &UpstreamError) -> ApiError {
        match err {
            UpstreamError::NotConfigured(_) => self.internal_error(err),
            _ => ApiError::Upstream {
                detail: err.to_string(),
                expose: self.debug,
            },
        }
    }

    pub fn relay_error(&self, err: RelayError) -> ApiError {
        match err {
            RelayError::ConversationNotFound(_) => ApiError::NotFound("Conversation not found".into()),
            RelayError::Store(e) => self.internal_error(format!("{:#}", e)),
            RelayError::Upstream(e) => self.upstream_error(&e),
        }
    }
}
