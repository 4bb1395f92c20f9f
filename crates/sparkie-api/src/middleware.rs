use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use chrono::{DateTime, Utc};
use tracing::warn;

use sparkie_db::models::{UserRow, parse_timestamp};
use sparkie_types::api::UserResponse;

use crate::auth::decode_token;
use crate::error::ApiError;
use crate::relay::Caller;
use crate::state::AppState;

/// The authenticated, active user behind a request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl CurrentUser {
    pub fn caller(&self) -> Caller {
        Caller {
            user_id: self.id,
            username: self.username.clone(),
        }
    }
}

impl From<UserRow> for CurrentUser {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            username: row.username,
            email: row.email,
            is_active: row.is_active,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

impl From<CurrentUser> for UserResponse {
    fn from(user: CurrentUser) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            is_active: user.is_active,
            created_at: user.created_at,
        }
    }
}

/// Validate the bearer token and load its user. The user must still exist,
/// be active, and carry the username the token was issued for.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let claims = decode_token(&state.auth, token).map_err(|e| {
        warn!("JWT validation error: {}", e);
        ApiError::Unauthorized
    })?;

    let user_id: i64 = claims.sub.parse().map_err(|_| {
        warn!("JWT subject is not a user id: {}", claims.sub);
        ApiError::Unauthorized
    })?;

    let user = state
        .with_db(move |db| db.get_user_by_id(user_id))
        .await?
        .ok_or_else(|| {
            warn!(user_id, "Token for unknown user");
            ApiError::Unauthorized
        })?;

    if !user.is_active || user.username != claims.username {
        warn!(user_id, "Token rejected for inactive or renamed user");
        return Err(ApiError::Unauthorized);
    }

    req.extensions_mut().insert(CurrentUser::from(user));
    Ok(next.run(req).await)
}
