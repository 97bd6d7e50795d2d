use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use unionhub_types::api::{
    AuthResponse, Claims, CreateUserRequest, UpdateAccountRequest, UpdateUserRequest,
    UserResponse, UsersResponse,
};
use unionhub_types::content::Role;

use crate::AppState;
use crate::auth::{hash_password, internal, join_error, verify_password};
use crate::middleware::{create_token, require_role};

/// Which roles an actor may hand out (and manage).
fn can_manage_role(actor: Role, target: Role) -> bool {
    match actor {
        Role::Director => Role::ASSIGNABLE.contains(&target),
        Role::Principal => matches!(
            target,
            Role::Teacher | Role::VicePrincipal | Role::TechStaff
        ),
        _ => false,
    }
}

pub async fn list_users(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    require_role(
        &claims,
        &[Role::Director, Role::Principal, Role::VicePrincipal],
    )?;

    let db = state.clone();
    let users = tokio::task::spawn_blocking(move || db.db.list_assigned_users())
        .await
        .map_err(join_error)?
        .map_err(internal)?;

    Ok(Json(UsersResponse {
        users: users.into_iter().map(Into::into).collect(),
    }))
}

pub async fn create_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateUserRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    require_role(&claims, &[Role::Director, Role::Principal])?;

    let role = Role::parse(&req.role).ok_or(StatusCode::BAD_REQUEST)?;
    if req.email.is_empty() || req.password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !can_manage_role(claims.role, role) {
        return Err(StatusCode::FORBIDDEN);
    }

    let email = req.email.to_lowercase();
    let password_hash = hash_password(&req.password)?;
    let name = req.name;
    let created_by = claims.sub;

    let db = state.clone();
    let user = tokio::task::spawn_blocking(move || {
        if db.db.email_taken(&email, None).map_err(internal)? {
            return Err(StatusCode::CONFLICT);
        }
        db.db
            .create_user(
                &email,
                &password_hash,
                role.as_str(),
                name.as_deref(),
                Some(created_by),
            )
            .map_err(internal)
    })
    .await
    .map_err(join_error)??;

    Ok((
        StatusCode::CREATED,
        Json(UserResponse { user: user.into() }),
    ))
}

/// Self-service account update, gated on the old password. Only directors may
/// change their own email. A fresh token is returned since the claims may
/// have changed.
pub async fn update_account(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateAccountRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.old_password.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.name.is_none() && req.email.is_none() && req.new_password.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.clone();
    let user_id = claims.sub;
    let current = tokio::task::spawn_blocking(move || db.db.get_user_by_id(user_id))
        .await
        .map_err(join_error)?
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    verify_password(&req.old_password, &current.password_hash)?;

    let email = match &req.email {
        Some(email) if email.to_lowercase() != current.email => {
            if claims.role != Role::Director {
                return Err(StatusCode::FORBIDDEN);
            }
            Some(email.to_lowercase())
        }
        _ => None,
    };
    let password_hash = match &req.new_password {
        Some(password) if !password.is_empty() => Some(hash_password(password)?),
        _ => None,
    };
    let name = req.name;

    let db = state.clone();
    let updated = tokio::task::spawn_blocking(move || {
        if let Some(email) = &email {
            if db.db.email_taken(email, Some(user_id)).map_err(internal)? {
                return Err(StatusCode::CONFLICT);
            }
        }
        db.db
            .update_user_account(
                user_id,
                email.as_deref(),
                name.as_deref(),
                password_hash.as_deref(),
            )
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)
    })
    .await
    .map_err(join_error)??;

    let token = create_token(&state.jwt_secret, &updated).map_err(internal)?;
    Ok(Json(AuthResponse {
        token,
        user: updated.into(),
    }))
}

pub async fn update_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    require_role(&claims, &[Role::Director, Role::Principal])?;

    let next_role = match &req.role {
        Some(role) => Some(Role::parse(role).ok_or(StatusCode::BAD_REQUEST)?),
        None => None,
    };
    if req.email.is_none() && next_role.is_none() && req.password.is_none() && req.name.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let password_hash = match &req.password {
        Some(password) if !password.is_empty() => Some(hash_password(password)?),
        _ => None,
    };
    let email = req.email.map(|e| e.to_lowercase());
    let name = req.name;
    let actor = claims.role;

    let db = state.clone();
    let updated = tokio::task::spawn_blocking(move || {
        let current = db
            .db
            .get_user_by_id(id)
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)?;
        let current_role = Role::parse(&current.role).ok_or(StatusCode::FORBIDDEN)?;
        if !can_manage_role(actor, current_role) {
            return Err(StatusCode::FORBIDDEN);
        }

        if let Some(email) = &email {
            if db.db.email_taken(email, Some(id)).map_err(internal)? {
                return Err(StatusCode::CONFLICT);
            }
        }

        db.db
            .update_assigned_user(
                id,
                email.as_deref(),
                next_role.map(|r| r.as_str()),
                name.as_deref(),
                password_hash.as_deref(),
            )
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(UserResponse {
        user: updated.into(),
    }))
}

pub async fn delete_user(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, StatusCode> {
    let actor = claims.role;
    let db = state.clone();
    tokio::task::spawn_blocking(move || {
        let current = db
            .db
            .get_user_by_id(id)
            .map_err(internal)?
            .ok_or(StatusCode::NOT_FOUND)?;
        let current_role = Role::parse(&current.role).ok_or(StatusCode::FORBIDDEN)?;
        if !can_manage_role(actor, current_role) {
            return Err(StatusCode::FORBIDDEN);
        }

        if db.db.delete_user(id).map_err(internal)? {
            Ok(())
        } else {
            Err(StatusCode::NOT_FOUND)
        }
    })
    .await
    .map_err(join_error)??;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directors_manage_all_assignable_roles() {
        for role in Role::ASSIGNABLE {
            assert!(can_manage_role(Role::Director, role));
        }
        assert!(!can_manage_role(Role::Director, Role::Director));
    }

    #[test]
    fn principals_manage_a_subset() {
        assert!(can_manage_role(Role::Principal, Role::Teacher));
        assert!(can_manage_role(Role::Principal, Role::VicePrincipal));
        assert!(can_manage_role(Role::Principal, Role::TechStaff));
        assert!(!can_manage_role(Role::Principal, Role::Principal));
        assert!(!can_manage_role(Role::Principal, Role::Employee));
    }

    #[test]
    fn other_roles_manage_nobody() {
        for actor in [Role::Teacher, Role::Employee, Role::VicePrincipal, Role::TechStaff] {
            for target in Role::ASSIGNABLE {
                assert!(!can_manage_role(actor, target));
            }
        }
    }
}
