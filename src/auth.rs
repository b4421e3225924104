// src/auth.rs
use crate::error::AppError;
use crate::models::UserId;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use warp::{Filter, Rejection};

pub const SESSION_COOKIE: &str = "session";
pub const FLASH_COOKIE: &str = "flash";

/// A flash outlives the redirect that sets it by this much at most.
const FLASH_TTL: Duration = Duration::from_secs(60);

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

#[derive(Serialize, Deserialize)]
struct FlashClaims {
    msg: String,
    exp: usize,
}

fn expires_after(ttl: Duration) -> usize {
    (Utc::now().timestamp().max(0) as u64 + ttl.as_secs()) as usize
}

/// Signs a session token for `user_id` that expires after `ttl`.
pub fn create_token(
    user_id: UserId,
    secret: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: expires_after(ttl),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Returns the user a token was issued to, or `None` if it is invalid or expired.
pub fn verify_token(token: &str, secret: &str) -> Option<UserId> {
    match decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => data.claims.sub.parse().ok(),
        Err(e) => {
            warn!("Rejected session token: {}", e);
            None
        }
    }
}

/// Signs a one-shot confirmation message so it can travel in a cookie.
pub fn create_flash(message: &str, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = FlashClaims {
        msg: message.to_string(),
        exp: expires_after(FLASH_TTL),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// The message carried by a flash cookie, if it is genuine and recent.
pub fn read_flash(token: &str, secret: &str) -> Option<String> {
    match decode::<FlashClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    ) {
        Ok(data) => Some(data.claims.msg),
        Err(e) => {
            warn!("Discarded flash cookie: {}", e);
            None
        }
    }
}

pub fn hash_password(password: &str, cost: u32) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, cost)
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or_else(|e| {
        error!("Stored password hash is unusable: {}", e);
        false
    })
}

pub fn session_cookie(token: &str, ttl: Duration) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        token,
        ttl.as_secs()
    )
}

pub fn clear_session_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
}

pub fn flash_cookie(token: &str) -> String {
    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        FLASH_COOKIE,
        token,
        FLASH_TTL.as_secs()
    )
}

pub fn clear_flash_cookie() -> String {
    format!("{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0", FLASH_COOKIE)
}

/// Extracts the logged-in user from the session cookie, rejecting with
/// [`AppError::LoginRequired`] when there is none.
pub fn with_user(
    secret: Arc<String>,
) -> impl Filter<Extract = (UserId,), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE).and_then(move |token: Option<String>| {
        let secret = secret.clone();
        async move {
            token
                .and_then(|token| verify_token(&token, &secret))
                .ok_or_else(|| warp::reject::custom(AppError::LoginRequired))
        }
    })
}
