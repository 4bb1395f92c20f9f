use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Sliding-window limiter: at most `limit` admitted requests per key within
/// any trailing `window`. Denied requests are not recorded.
pub struct RateLimiter {
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Returns `(limited, remaining)` and records the request when admitted.
    pub fn check(&self, key: &str) -> (bool, u32) {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&self, key: &str, now: Instant) -> (bool, u32) {
        let mut hits = self.lock();
        let window = hits.entry(key.to_string()).or_default();
        self.prune(window, now);

        let used = u32::try_from(window.len()).unwrap_or(u32::MAX);
        if used >= self.limit {
            return (true, 0);
        }

        window.push_back(now);
        (false, self.limit - used - 1)
    }

    /// Whole seconds until the oldest admitted request leaves the window.
    pub fn reset_time(&self, key: &str) -> u64 {
        self.reset_time_at(key, Instant::now())
    }

    pub fn reset_time_at(&self, key: &str, now: Instant) -> u64 {
        let hits = self.lock();
        let Some(oldest) = hits.get(key).and_then(|w| w.front()) else {
            return 0;
        };

        let left = (*oldest + self.window).saturating_duration_since(now);
        left.as_secs() + u64::from(left.subsec_nanos() > 0)
    }

    /// Drop keys with no requests left in the window.
    pub fn purge_idle(&self) -> usize {
        self.purge_idle_at(Instant::now())
    }

    pub fn purge_idle_at(&self, now: Instant) -> usize {
        let mut hits = self.lock();
        let before = hits.len();
        hits.retain(|_, window| {
            self.prune(window, now);
            !window.is_empty()
        });
        before - hits.len()
    }

    fn prune(&self, window: &mut VecDeque<Instant>, now: Instant) {
        while window
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= self.window)
        {
            window.pop_front();
        }
    }

    // A panic while holding the lock leaves the map consistent, so keep going
    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        self.hits.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rejects over-limit callers with 429 and annotates admitted responses with
/// the remaining budget.
pub async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Result<Response, ApiError> {
    let key = extract_client_ip(&req)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let (limited, remaining) = state.rate_limiter.check(&key);
    if limited {
        let retry_after = state.rate_limiter.reset_time(&key);
        warn!(client = %key, retry_after, "Rate limit exceeded");
        return Err(ApiError::RateLimited { retry_after });
    }

    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(state.rate_limiter.limit()));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    Ok(response)
}

/// Try ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
pub fn extract_client_ip<B>(req: &axum::http::Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    let header_ip = |name: &str, first_of_list: bool| {
        let value = req.headers().get(name)?.to_str().ok()?;
        let candidate = if first_of_list { value.split(',').next()? } else { value };
        candidate.trim().parse::<IpAddr>().ok()
    };

    header_ip("x-forwarded-for", true).or_else(|| header_ip("x-real-ip", false))
}
