use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};

use unionhub_db::models::UserRow;
use unionhub_types::api::Claims;
use unionhub_types::content::Role;

use crate::AppState;

/// Extract and validate the Bearer JWT, stashing the claims in request
/// extensions for the handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| StatusCode::UNAUTHORIZED)?;

    req.extensions_mut().insert(token_data.claims);
    Ok(next.run(req).await)
}

/// Role-set membership gate.
pub fn require_role(claims: &Claims, allowed: &[Role]) -> Result<(), StatusCode> {
    if allowed.contains(&claims.role) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

/// Sign a 7-day token for the user.
pub fn create_token(secret: &str, user: &UserRow) -> anyhow::Result<String> {
    let role = Role::parse(&user.role)
        .ok_or_else(|| anyhow::anyhow!("Unknown role on user {}: {}", user.id, user.role))?;

    let claims = Claims {
        sub: user.id,
        role,
        email: user.email.clone(),
        exp: (chrono::Utc::now() + chrono::Duration::days(7)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserRow {
        UserRow {
            id: 42,
            email: "d@union.test".to_string(),
            password_hash: "hash".to_string(),
            role: "director".to_string(),
            name: None,
            created_by: None,
            created_at: "2025-01-01T00:00:00.000Z".to_string(),
            updated_at: None,
        }
    }

    #[test]
    fn token_round_trips() {
        let token = create_token("secret", &user()).unwrap();
        let data = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret"),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(data.claims.sub, 42);
        assert_eq!(data.claims.role, Role::Director);
        assert_eq!(data.claims.email, "d@union.test");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = create_token("secret", &user()).unwrap();
        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"other"),
            &Validation::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_stored_role_fails_token_issue() {
        let mut bad = user();
        bad.role = "janitor".to_string();
        assert!(create_token("secret", &bad).is_err());
    }

    #[test]
    fn role_gate() {
        let claims = Claims {
            sub: 1,
            role: Role::Principal,
            email: "p@union.test".to_string(),
            exp: 0,
        };
        assert!(require_role(&claims, &[Role::Director, Role::Principal]).is_ok());
        assert_eq!(
            require_role(&claims, &[Role::Director]),
            Err(StatusCode::FORBIDDEN)
        );
    }
}
