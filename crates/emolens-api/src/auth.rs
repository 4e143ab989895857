use std::sync::{Arc, LazyLock};

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::{SaltString, rand_core::OsRng}};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::FixedOffset;
use jsonwebtoken::{EncodingKey, Header, encode};
use tracing::{info, warn};
use uuid::Uuid;

use emolens_analysis::EmotionAnalyzer;
use emolens_db::Database;
use emolens_types::api::{
    Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, SuccessResponse,
};

use crate::error::ApiError;
use crate::run_blocking;
use crate::storage::ImageStore;

/// Name of the session cookie holding the JWT.
pub const AUTH_COOKIE: &str = "emolens_session";

const MIN_USERNAME_LEN: usize = 3;
const MAX_USERNAME_LEN: usize = 32;
const MIN_PASSWORD_LEN: usize = 6;

/// Verified against when the username is unknown, so that path costs the same
/// Argon2 work as a wrong password.
static DUMMY_HASH: LazyLock<String> = LazyLock::new(|| {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(b"emolens-unknown-user", &salt)
        .map(|hash| hash.to_string())
        .unwrap_or_default()
});

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Database,
    pub store: ImageStore,
    pub analyzer: Arc<dyn EmotionAnalyzer>,
    pub jwt_secret: String,
    pub token_ttl: chrono::Duration,
    pub secure_cookies: bool,
    /// Offset used for `local_time` in history listings.
    pub display_offset: FixedOffset,
    pub max_upload_bytes: usize,
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;
    validate_registration(&req)?;

    // Check if username is taken
    let db = state.clone();
    let username = req.username.clone();
    if run_blocking(move || db.db.get_user_by_username(&username))
        .await?
        .is_some()
    {
        return Err(ApiError::UserAlreadyExists);
    }

    let db = state.clone();
    let username = req.username.clone();
    let password = req.password;
    let user_id = run_blocking(move || Ok(create_account(&db.db, &username, &password))).await??;

    info!("Registered user {} ({})", req.username, user_id);

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id,
            username: req.username,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(req) = payload?;

    let db = state.clone();
    let username = req.username.clone();
    let user = run_blocking(move || db.db.get_user_by_username(&username)).await?;

    // Unknown users still pay for a verify
    let stored_hash = match &user {
        Some(user) => user.password.clone(),
        None => DUMMY_HASH.clone(),
    };
    let password = req.password;
    let verified = run_blocking(move || Ok(verify_password(&password, &stored_hash))).await?;

    let user = match user {
        Some(user) if verified => user,
        _ => return Err(ApiError::WrongCredentials),
    };

    let user_id: Uuid = user
        .id
        .parse()
        .map_err(|e| anyhow::anyhow!("user id {} is not a UUID: {e}", user.id))?;

    let token = create_token(&state.jwt_secret, user_id, &user.username, state.token_ttl)?;

    let cookie = Cookie::build((AUTH_COOKIE, token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(state.secure_cookies);

    info!("User {} logged in", user.username);

    Ok((
        jar.add(cookie),
        Json(LoginResponse {
            user_id,
            username: user.username,
            token,
        }),
    ))
}

/// Sessions are stateless JWTs, so logging out only clears the cookie.
pub async fn logout(jar: CookieJar) -> impl IntoResponse {
    (
        jar.remove(Cookie::build(AUTH_COOKIE).path("/")),
        Json(SuccessResponse { success: true }),
    )
}

/// Hash the password with Argon2id and insert the user.
fn create_account(db: &Database, username: &str, password: &str) -> Result<Uuid, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {e}"))?
        .to_string();

    let user_id = Uuid::new_v4();
    match db.create_user(&user_id.to_string(), username, &password_hash) {
        Ok(()) => Ok(user_id),
        // Lost a race with a concurrent registration
        Err(e) if emolens_db::is_unique_violation(&e) => Err(ApiError::UserAlreadyExists),
        Err(e) => Err(ApiError::Internal(e)),
    }
}

fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Stored password hash is malformed: {}", e);
            false
        }
    }
}

fn validate_registration(req: &RegisterRequest) -> Result<(), ApiError> {
    if req.username.is_empty() || req.password.is_empty() || req.confirm_password.is_empty() {
        return Err(ApiError::BadRequest("All fields are required".into()));
    }

    let name_len = req.username.chars().count();
    if !(MIN_USERNAME_LEN..=MAX_USERNAME_LEN).contains(&name_len) {
        return Err(ApiError::BadRequest(format!(
            "Username must be {MIN_USERNAME_LEN}-{MAX_USERNAME_LEN} characters long"
        )));
    }

    if !password_is_strong(&req.password) {
        return Err(ApiError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters and contain letters and digits"
        )));
    }

    if req.password != req.confirm_password {
        return Err(ApiError::BadRequest("Passwords do not match".into()));
    }

    Ok(())
}

fn password_is_strong(password: &str) -> bool {
    password.chars().count() >= MIN_PASSWORD_LEN
        && password.chars().any(|c| c.is_ascii_digit())
        && password.chars().any(char::is_alphabetic)
}

pub(crate) fn create_token(
    secret: &str,
    user_id: Uuid,
    username: &str,
    ttl: chrono::Duration,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}
