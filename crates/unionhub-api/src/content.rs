use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::Value;
use tracing::{error, info};

use unionhub_db::queries::VoteOutcome;
use unionhub_types::api::{
    CastVoteRequest, CastVoteResponse, Claims, ItemResponse, ItemsResponse, Payload,
};
use unionhub_types::content::{ContentItem, ContentType, Role};

use crate::AppState;
use crate::auth::{internal, join_error};
use crate::email::BroadcastMailer;

/// Kinds whose creation is announced to every registered user.
const ANNOUNCED: [ContentType; 5] = [
    ContentType::Meetings,
    ContentType::Votes,
    ContentType::News,
    ContentType::Benefits,
    ContentType::Faqs,
];

fn can_manage(kind: ContentType, role: Role) -> bool {
    match role {
        Role::Director => true,
        Role::Principal | Role::VicePrincipal => !matches!(
            kind,
            ContentType::Officials | ContentType::Contracts
        ),
        _ => false,
    }
}

fn parse_kind(raw: &str) -> Result<ContentType, StatusCode> {
    ContentType::parse(raw).ok_or(StatusCode::NOT_FOUND)
}

fn content_title(data: &Payload) -> String {
    for key in ["title", "pollName", "name", "kind"] {
        if let Some(value) = data.get(key).and_then(Value::as_str) {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    "Item".to_string()
}

/// Record a ballot. The tally update is atomic in the store, so concurrent
/// requests cannot double-vote or lose an increment.
pub async fn cast_vote(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i64>,
    Json(req): Json<CastVoteRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.clone();
    let user_id = claims.sub;
    let outcome =
        tokio::task::spawn_blocking(move || db.db.cast_vote(id, user_id, req.candidate_index))
            .await
            .map_err(join_error)?
            .map_err(internal)?;

    match outcome {
        VoteOutcome::Cast {
            candidates,
            voted_users,
        } => Ok(Json(CastVoteResponse {
            success: true,
            candidates,
            voted_users,
        })),
        VoteOutcome::NotFound => Err(StatusCode::NOT_FOUND),
        VoteOutcome::AlreadyVoted | VoteOutcome::InvalidCandidate => Err(StatusCode::BAD_REQUEST),
    }
}

pub async fn list_items(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(kind): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let kind = parse_kind(&kind)?;

    let db = state.clone();
    let items = tokio::task::spawn_blocking(move || db.db.list_content(kind))
        .await
        .map_err(join_error)?
        .map_err(internal)?;

    let items = if kind == ContentType::Notifications {
        items
            .into_iter()
            .filter(|item| notification_visible(item, &claims))
            .collect()
    } else {
        items
    };

    Ok(Json(ItemsResponse { items }))
}

/// Targeted notifications are only listed for their recipients; everything
/// else is visible to all authenticated users.
fn notification_visible(item: &ContentItem, claims: &Claims) -> bool {
    let data = &item.data;
    if data.get("broadcast") == Some(&Value::Bool(true)) {
        return true;
    }

    if let Some(Value::Array(emails)) = data.get("recipientsEmails") {
        if !emails.is_empty() {
            return emails.iter().any(|e| e.as_str() == Some(&claims.email));
        }
    }

    if let Some(Value::Array(roles)) = data.get("recipientsRoles") {
        if !roles.is_empty() {
            return roles.iter().any(|r| r.as_str() == Some(claims.role.as_str()));
        }
    }

    true
}

pub async fn get_item(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, StatusCode> {
    let kind = parse_kind(&kind)?;

    let db = state.clone();
    let item = tokio::task::spawn_blocking(move || db.db.get_content(kind, id))
        .await
        .map_err(join_error)?
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(ItemResponse { item }))
}

pub async fn create_item(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(kind): Path<String>,
    Json(payload): Json<Payload>,
) -> Result<impl IntoResponse, StatusCode> {
    let kind = parse_kind(&kind)?;
    if !can_manage(kind, claims.role) {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.clone();
    let created_by = claims.sub;
    let body = payload.clone();
    let item = tokio::task::spawn_blocking(move || db.db.create_content(kind, body, Some(created_by)))
        .await
        .map_err(join_error)?
        .map_err(internal)?;

    notify_directors(&state, "Created", kind, &payload, &claims);

    if ANNOUNCED.contains(&kind) {
        let title = content_title(&payload);
        let subject = format!("New {} added: {}", kind.label(), title);
        let html = format!(
            "<div style=\"font-family: Arial, sans-serif;\">\
             <p>Hello,</p>\
             <p>A new <strong>{}</strong> has been added to Union Hub.</p>\
             <h3 style=\"color: #007bff;\">{}</h3>\
             <p>Please log in to the application to view more details.</p>\
             <br/>\
             <p>Best regards,</p>\
             <p>Union Hub Team</p>\
             </div>",
            kind.label(),
            title,
        );
        broadcast_to_all(&state, kind, subject, html);
    }

    Ok((StatusCode::CREATED, Json(ItemResponse { item })))
}

pub async fn update_item(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((kind, id)): Path<(String, i64)>,
    Json(mut payload): Json<Payload>,
) -> Result<impl IntoResponse, StatusCode> {
    let kind = parse_kind(&kind)?;
    if !can_manage(kind, claims.role) {
        return Err(StatusCode::FORBIDDEN);
    }

    // Editing a meeting that is not completed re-arms its reminder.
    let rearmed = kind == ContentType::Meetings
        && payload.get("status").and_then(Value::as_str) != Some("completed");
    if rearmed {
        payload.insert("reminderSent".to_string(), Value::Bool(false));
    }

    let db = state.clone();
    let patch = payload.clone();
    let item = tokio::task::spawn_blocking(move || db.db.update_content(kind, id, patch))
        .await
        .map_err(join_error)?
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;

    notify_directors(&state, "Updated", kind, &item.data, &claims);

    if rearmed {
        let title = content_title(&item.data);
        let subject = format!("Meeting Update: {}", title);
        let html = format!(
            "<div style=\"font-family: Arial, sans-serif;\">\
             <p>Hello,</p>\
             <p>The meeting <strong>{}</strong> has been updated/rescheduled.</p>\
             <p>Please log in to Union Hub to view the new details.</p>\
             <br/>\
             <p>Best regards,</p>\
             <p>Union Hub Team</p>\
             </div>",
            title,
        );
        broadcast_to_all(&state, kind, subject, html);
    }

    Ok(Json(ItemResponse { item }))
}

pub async fn delete_item(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path((kind, id)): Path<(String, i64)>,
) -> Result<impl IntoResponse, StatusCode> {
    let kind = parse_kind(&kind)?;
    if !can_manage(kind, claims.role) {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.clone();
    let existing = tokio::task::spawn_blocking(move || {
        let existing = db.db.get_content(kind, id).map_err(internal)?;
        if !db.db.delete_content(kind, id).map_err(internal)? {
            return Err(StatusCode::NOT_FOUND);
        }
        Ok(existing)
    })
    .await
    .map_err(join_error)??;

    if let Some(existing) = existing {
        notify_directors(&state, "Deleted", kind, &existing.data, &claims);
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Alert directors when a principal or vice principal changes content.
/// Fire-and-forget: failures are logged and never fail the request.
fn notify_directors(state: &AppState, action: &'static str, kind: ContentType, data: &Payload, claims: &Claims) {
    if !matches!(claims.role, Role::Principal | Role::VicePrincipal) {
        return;
    }

    let state = state.clone();
    let title = content_title(data);
    let actor = claims.email.clone();
    let actor_role = claims.role;

    tokio::spawn(async move {
        let db = state.clone();
        let emails = match tokio::task::spawn_blocking(move || db.db.director_emails()).await {
            Ok(Ok(emails)) => emails,
            Ok(Err(e)) => {
                error!("Failed to load director emails: {}", e);
                return;
            }
            Err(e) => {
                error!("spawn_blocking join error: {}", e);
                return;
            }
        };
        if emails.is_empty() {
            return;
        }

        let subject = format!("Director Alert: {} {}", kind.label(), action);
        let html = format!(
            "<div style=\"font-family: Arial, sans-serif;\">\
             <p>Hello Director,</p>\
             <p>The following action was performed by <strong>{}</strong> ({}):</p>\
             <ul>\
             <li><strong>Action:</strong> {}</li>\
             <li><strong>Type:</strong> {}</li>\
             <li><strong>Title:</strong> {}</li>\
             </ul>\
             <p>Please log in to Union Hub to review.</p>\
             </div>",
            actor,
            actor_role.as_str(),
            action,
            kind.label(),
            title,
        );

        match state.mailer.send_broadcast(&emails, &subject, &html).await {
            Ok(()) => info!("Director notification sent for {} {}", action, kind.as_str()),
            Err(e) => error!("Failed to notify directors: {}", e),
        }
    });
}

/// Broadcast an announcement to every registered user in the background.
fn broadcast_to_all(state: &AppState, kind: ContentType, subject: String, html: String) {
    let state = state.clone();
    tokio::spawn(async move {
        let db = state.clone();
        let emails = match tokio::task::spawn_blocking(move || db.db.all_user_emails()).await {
            Ok(Ok(emails)) => emails,
            Ok(Err(e)) => {
                error!("Failed to load user emails: {}", e);
                return;
            }
            Err(e) => {
                error!("spawn_blocking join error: {}", e);
                return;
            }
        };
        if emails.is_empty() {
            return;
        }

        if let Err(e) = state.mailer.send_broadcast(&emails, &subject, &html).await {
            error!("Failed to send broadcast email for {}: {}", kind.as_str(), e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(role: Role, email: &str) -> Claims {
        Claims {
            sub: 1,
            role,
            email: email.to_string(),
            exp: 0,
        }
    }

    fn notification(data: serde_json::Value) -> ContentItem {
        let Value::Object(map) = data else {
            panic!("payload must be an object");
        };
        ContentItem {
            id: 1,
            kind: ContentType::Notifications,
            data: map,
            created_by: None,
            creator_email: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn manage_matrix() {
        assert!(can_manage(ContentType::Contracts, Role::Director));
        assert!(can_manage(ContentType::Meetings, Role::Principal));
        assert!(can_manage(ContentType::Employees, Role::VicePrincipal));
        assert!(!can_manage(ContentType::Contracts, Role::Principal));
        assert!(!can_manage(ContentType::Officials, Role::VicePrincipal));
        assert!(!can_manage(ContentType::News, Role::Teacher));
    }

    #[test]
    fn broadcast_notifications_are_visible_to_everyone() {
        let item = notification(json!({"broadcast": true, "recipientsEmails": ["x@y.z"]}));
        assert!(notification_visible(&item, &claims(Role::Teacher, "a@b.c")));
    }

    #[test]
    fn email_targeted_notifications_check_the_caller() {
        let item = notification(json!({"recipientsEmails": ["a@b.c"]}));
        assert!(notification_visible(&item, &claims(Role::Teacher, "a@b.c")));
        assert!(!notification_visible(&item, &claims(Role::Teacher, "other@b.c")));
    }

    #[test]
    fn role_targeted_notifications_check_the_role() {
        let item = notification(json!({"recipientsRoles": ["teacher", "employee"]}));
        assert!(notification_visible(&item, &claims(Role::Teacher, "a@b.c")));
        assert!(!notification_visible(&item, &claims(Role::Director, "d@b.c")));
    }

    #[test]
    fn untargeted_notifications_default_to_visible() {
        let item = notification(json!({"title": "hi", "recipientsEmails": []}));
        assert!(notification_visible(&item, &claims(Role::Employee, "a@b.c")));
    }

    #[test]
    fn title_fallback_order() {
        let data = match json!({"pollName": "Chair", "name": "ignored"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        assert_eq!(content_title(&data), "Chair");
        assert_eq!(content_title(&Payload::new()), "Item");
    }
}
