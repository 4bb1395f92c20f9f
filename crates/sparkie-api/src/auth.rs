use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{Extension, Form, Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use std::sync::LazyLock;
use tracing::{info, warn};

use sparkie_types::api::{Claims, LoginForm, RegisterRequest, TokenResponse, UserResponse};

use crate::error::ApiError;
use crate::middleware::CurrentUser;
use crate::state::{AppState, AuthSettings};

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate().map_err(ApiError::Validation)?;

    let username = req.username.clone();
    if state.with_db(move |db| db.get_user_by_username(&username)).await?.is_some() {
        return Err(ApiError::Conflict("Username already registered".into()));
    }

    let email = req.email.clone();
    if state.with_db(move |db| db.get_user_by_email(&email)).await?.is_some() {
        return Err(ApiError::Conflict("Email already registered".into()));
    }

    let password_hash = hash_password(&req.password).map_err(|e| state.internal_error(e))?;

    // A concurrent registration can slip past the lookups above; the UNIQUE
    // constraints settle it.
    let RegisterRequest { username, email, .. } = req;
    let user = state
        .with_db(move |db| match db.create_user(&username, &email, &password_hash) {
            Ok(id) => db.get_user_by_id(id),
            Err(e) if sparkie_db::is_constraint_violation(&e) => Ok(None),
            Err(e) => Err(e),
        })
        .await?
        .ok_or_else(|| {
            warn!("Registration lost a race on a unique field");
            ApiError::Conflict("Username or email already registered".into())
        })?;

    info!(user_id = user.id, "Registered user {}", user.username);
    Ok((StatusCode::CREATED, Json(UserResponse::from(CurrentUser::from(user)))))
}

/// OAuth2 password grant. Unknown user and wrong password are
/// indistinguishable to the caller.
pub async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Json<TokenResponse>, ApiError> {
    let username = form.username.clone();
    let user = state
        .with_db(move |db| db.get_user_by_username(&username))
        .await?
        .ok_or_else(|| {
            // Burn the same Argon2 work a real check would.
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                verify_password(&form.password, dummy);
            }
            warn!("Login failed for unknown user {}", form.username);
            ApiError::Unauthorized
        })?;

    if !verify_password(&form.password, &user.password_hash) {
        warn!(user_id = user.id, "Login failed: bad password");
        return Err(ApiError::Unauthorized);
    }

    if !user.is_active {
        warn!(user_id = user.id, "Login refused for inactive user");
        return Err(ApiError::Unauthorized);
    }

    let token = create_token(&state.auth, user.id, &user.username).map_err(|e| state.internal_error(e))?;

    info!(user_id = user.id, "User logged in");
    Ok(Json(TokenResponse {
        access_token: token,
        token_type: "bearer".into(),
        expires_in: state.auth.token_ttl.num_seconds(),
    }))
}

pub async fn me(Extension(user): Extension<CurrentUser>) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
        .to_string();
    Ok(hash)
}

/// Verified against when the username is unknown, so a miss costs as much as
/// a wrong password.
static DUMMY_HASH: LazyLock<Option<String>> = LazyLock::new(|| hash_password("sparkie-no-such-user").ok());

/// False for a wrong password and for a corrupt stored hash alike.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        warn!("Stored password hash is unparseable");
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

pub fn create_token(settings: &AuthSettings, user_id: i64, username: &str) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        exp: (chrono::Utc::now() + settings.token_ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
    )?;

    Ok(token)
}

/// Checks signature and expiry.
pub fn decode_token(settings: &AuthSettings, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AuthSettings {
        AuthSettings {
            jwt_secret: "test-secret".into(),
            token_ttl: chrono::Duration::minutes(30),
        }
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("honeycomb").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("honeycomb", &hash));
        assert!(!verify_password("waxcomb", &hash));
        assert!(!verify_password("honeycomb", "not-a-hash"));
    }

    #[test]
    fn unknown_user_check_runs_real_argon2() {
        let dummy = DUMMY_HASH.as_deref().expect("dummy hash is computed");
        assert!(PasswordHash::new(dummy).is_ok());
        assert!(dummy.starts_with("$argon2"));
        assert!(verify_password("sparkie-no-such-user", dummy));
        assert!(!verify_password("honeycomb", dummy));
    }

    #[test]
    fn token_carries_user_identity() {
        let token = create_token(&settings(), 42, "pollinator").unwrap();
        let claims = decode_token(&settings(), &token).unwrap();
        assert_eq!(claims.sub, "42");
        assert_eq!(claims.username, "pollinator");
    }

    #[test]
    fn token_from_another_secret_is_rejected() {
        let token = create_token(&settings(), 42, "pollinator").unwrap();
        let other = AuthSettings {
            jwt_secret: "other-secret".into(),
            ..settings()
        };
        assert!(decode_token(&other, &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let expired = AuthSettings {
            token_ttl: chrono::Duration::minutes(-10),
            ..settings()
        };
        let token = create_token(&expired, 42, "pollinator").unwrap();
        assert!(decode_token(&settings(), &token).is_err());
    }
}
