use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use unionhub_types::api::{
    AuthResponse, LoginRequest, MessageResponse, PasswordResetRequest, RegisterDirectorRequest,
    ResetPasswordRequest, VerifyOtpRequest, VerifyOtpResponse,
};
use unionhub_types::content::Role;

use crate::AppState;
use crate::middleware::create_token;

const MAX_OTP_ATTEMPTS: i64 = 5;

/// Bootstrap route: creates the very first director account. Refused once any
/// director exists.
pub async fn register_director(
    State(state): State<AppState>,
    Json(req): Json<RegisterDirectorRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.email.is_empty() || req.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let email = req.email.to_lowercase();
    let password_hash = hash_password(&req.password)?;

    let db = state.clone();
    let name = req.name.clone();
    let user = tokio::task::spawn_blocking(move || {
        let directors = db.db.director_count().map_err(internal)?;
        if directors > 0 {
            return Err(StatusCode::FORBIDDEN);
        }
        if db.db.email_taken(&email, None).map_err(internal)? {
            return Err(StatusCode::CONFLICT);
        }
        db.db
            .create_user(&email, &password_hash, "director", name.as_deref(), None)
            .map_err(internal)
    })
    .await
    .map_err(join_error)??;

    let token = create_token(&state.jwt_secret, &user).map_err(internal)?;
    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

/// Role-scoped login: the role comes from the path, and credentials only match
/// a user holding exactly that role.
pub async fn login(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let role = Role::parse(&role).ok_or(StatusCode::NOT_FOUND)?;
    if req.email.is_empty() || req.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let email = req.email.to_lowercase();
    let db = state.clone();
    let user = tokio::task::spawn_blocking(move || {
        db.db.get_user_by_email_role(&email, role.as_str())
    })
    .await
    .map_err(join_error)?
    .map_err(internal)?
    .ok_or(StatusCode::UNAUTHORIZED)?;

    verify_password(&req.password, &user.password_hash)?;

    let token = create_token(&state.jwt_secret, &user).map_err(internal)?;
    Ok(Json(AuthResponse {
        token,
        user: user.into(),
    }))
}

/// Start the OTP password-reset flow. A fresh 6-digit OTP replaces any prior
/// reset state for the user; the OTP is only ever stored hashed.
pub async fn password_reset_request(
    State(state): State<AppState>,
    Json(req): Json<PasswordResetRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.email.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let email = req.email.to_lowercase();

    let otp = generate_otp();
    let otp_for_db = otp.clone();
    let db = state.clone();
    let lookup_email = email.clone();
    tokio::task::spawn_blocking(move || {
        let user = db
            .db
            .get_user_by_email(&lookup_email)
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)?;

        let otp_hash = sha256_hex(&format!("{}:{}", user.id, otp_for_db));
        let expires_at = (chrono::Utc::now() + chrono::Duration::minutes(10))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        db.db
            .upsert_password_reset_otp(user.id, &otp_hash, &expires_at)
            .map_err(internal)
    })
    .await
    .map_err(join_error)??;

    // The OTP row is already saved; a transport failure only means the user
    // retries the request.
    if let Err(e) = state.mailer.send_otp(&email, &otp).await {
        warn!("Failed to send OTP email to {}: {}", email, e);
    }

    Ok(Json(MessageResponse {
        message: "OTP sent",
    }))
}

/// Exchange a valid OTP for a single-use reset token.
pub async fn password_reset_verify_otp(
    State(state): State<AppState>,
    Json(req): Json<VerifyOtpRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.email.is_empty() || req.otp.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let email = req.email.to_lowercase();
    let otp = req.otp.clone();

    let reset_token = generate_reset_token();
    let token_hash = sha256_hex(&reset_token);

    let db = state.clone();
    tokio::task::spawn_blocking(move || {
        let user = db
            .db
            .get_user_by_email(&email)
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)?;

        let entry = db
            .db
            .get_password_reset(user.id)
            .map_err(internal)?
            .ok_or(StatusCode::BAD_REQUEST)?;
        let (Some(otp_hash), Some(expires_at)) = (entry.otp_hash, entry.otp_expires_at) else {
            return Err(StatusCode::BAD_REQUEST);
        };

        let expired = chrono::DateTime::parse_from_rfc3339(&expires_at)
            .map(|t| t.with_timezone(&chrono::Utc) <= chrono::Utc::now())
            .unwrap_or(true);
        if expired {
            return Err(StatusCode::BAD_REQUEST);
        }

        if entry.otp_attempts >= MAX_OTP_ATTEMPTS {
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }

        if sha256_hex(&format!("{}:{}", user.id, otp)) != otp_hash {
            db.db.increment_otp_attempts(user.id).map_err(internal)?;
            return Err(StatusCode::UNAUTHORIZED);
        }

        let token_expires_at = (chrono::Utc::now() + chrono::Duration::minutes(15))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        db.db
            .set_reset_token(user.id, &token_hash, &token_expires_at)
            .map_err(internal)?;
        Ok(())
    })
    .await
    .map_err(join_error)??;

    Ok(Json(VerifyOtpResponse { reset_token }))
}

/// Consume the reset token and set the new password.
pub async fn password_reset_reset(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.reset_token.is_empty() || req.new_password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.new_password.len() < 6 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let password_hash = hash_password(&req.new_password)?;
    let token_hash = sha256_hex(&req.reset_token);

    let db = state.clone();
    tokio::task::spawn_blocking(move || {
        let user_id = db
            .db
            .consume_reset_token(&token_hash)
            .map_err(internal)?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        db.db
            .update_user_account(user_id, None, None, Some(&password_hash))
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)?;
        Ok::<(), StatusCode>(())
    })
    .await
    .map_err(join_error)??;

    Ok(Json(MessageResponse {
        message: "Password updated",
    }))
}

// -- helpers shared with the users routes --

pub(crate) fn hash_password(password: &str) -> Result<String, StatusCode> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

pub(crate) fn verify_password(password: &str, stored_hash: &str) -> Result<(), StatusCode> {
    let parsed = PasswordHash::new(stored_hash).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

pub(crate) fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    error!("Request failed: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

pub(crate) fn join_error(e: tokio::task::JoinError) -> StatusCode {
    error!("spawn_blocking join error: {}", e);
    StatusCode::INTERNAL_SERVER_ERROR
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

fn generate_otp() -> String {
    rand::rng().random_range(100_000..1_000_000).to_string()
}

fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("s3cret-pass").unwrap();
        assert!(verify_password("s3cret-pass", &hash).is_ok());
        assert_eq!(
            verify_password("wrong", &hash),
            Err(StatusCode::UNAUTHORIZED)
        );
    }

    #[test]
    fn otp_is_six_digits() {
        for _ in 0..20 {
            let otp = generate_otp();
            assert_eq!(otp.len(), 6);
            assert!(otp.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn reset_token_is_64_hex_chars() {
        let token = generate_reset_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
