use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

/// JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "your-secret-key-change-in-production",
];

/// Process configuration, read once at startup from `SPARKIE_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub jwt_expire_minutes: i64,
    pub chat_api_key: String,
    pub chat_api_url: String,
    pub chat_model: String,
    pub image_api_key: String,
    pub image_api_url: String,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
    pub allowed_origins: Vec<String>,
    pub privileged_username: String,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset and empty values fall
    /// back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let jwt_secret = var("SPARKIE_JWT_SECRET", "");
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("SPARKIE_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let chat_api_key = var("SPARKIE_CHAT_API_KEY", "");
        if chat_api_key.is_empty() {
            bail!("SPARKIE_CHAT_API_KEY is required");
        }

        let jwt_expire_minutes: i64 = parse(&var("SPARKIE_JWT_EXPIRE_MINUTES", "30"), "SPARKIE_JWT_EXPIRE_MINUTES")?;
        if jwt_expire_minutes <= 0 {
            bail!("SPARKIE_JWT_EXPIRE_MINUTES must be positive");
        }

        let rate_limit_requests: u32 = parse(&var("SPARKIE_RATE_LIMIT_REQUESTS", "100"), "SPARKIE_RATE_LIMIT_REQUESTS")?;
        let rate_limit_window: u64 = parse(&var("SPARKIE_RATE_LIMIT_WINDOW", "60"), "SPARKIE_RATE_LIMIT_WINDOW")?;
        if rate_limit_requests == 0 || rate_limit_window == 0 {
            bail!("rate limit requests and window must both be greater than zero");
        }

        let allowed_origins = var("SPARKIE_ALLOWED_ORIGINS", "http://localhost:3000")
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();

        let debug = matches!(
            var("SPARKIE_DEBUG", "false").to_ascii_lowercase().as_str(),
            "1" | "true" | "yes"
        );

        Ok(Self {
            host: var("SPARKIE_HOST", "0.0.0.0"),
            port: parse(&var("SPARKIE_PORT", "8000"), "SPARKIE_PORT")?,
            db_path: var("SPARKIE_DB_PATH", "sparkie_hive.db").into(),
            jwt_secret,
            jwt_expire_minutes,
            chat_api_key,
            chat_api_url: var(
                "SPARKIE_CHAT_API_URL",
                "https://api.minimax.chat/v1/text/chatcompletion_v2",
            ),
            chat_model: var("SPARKIE_CHAT_MODEL", "abab6.5s-chat"),
            image_api_key: var("SPARKIE_IMAGE_API_KEY", ""),
            image_api_url: var(
                "SPARKIE_IMAGE_API_URL",
                "https://api-inference.modelscope.cn/v1/images/generations",
            ),
            rate_limit_requests,
            rate_limit_window: Duration::from_secs(rate_limit_window),
            allowed_origins,
            privileged_username: var("SPARKIE_PRIVILEGED_USERNAME", "WeGotHeaven"),
            debug,
        })
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse<T>(raw: &str, key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("{} has an invalid value '{}'", key, raw))
}
