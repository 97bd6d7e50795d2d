use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::content::{ContentItem, Role};

// -- JWT Claims --

/// JWT claims shared between the REST middleware and token issuance.
/// Canonical definition lives here in unionhub-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub role: Role,
    pub email: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
pub struct RegisterDirectorRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserPublic,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyOtpRequest {
    pub email: String,
    pub otp: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyOtpResponse {
    #[serde(rename = "resetToken")]
    pub reset_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    #[serde(rename = "resetToken")]
    pub reset_token: String,
    #[serde(rename = "newPassword")]
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: &'static str,
}

// -- Users --

/// A user as exposed over the API. The password hash never leaves the db layer.
#[derive(Debug, Clone, Serialize)]
pub struct UserPublic {
    pub id: i64,
    pub email: String,
    pub role: String,
    pub name: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub password: String,
    pub role: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "oldPassword")]
    pub old_password: String,
    #[serde(default, rename = "newPassword")]
    pub new_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UsersResponse {
    pub users: Vec<UserPublic>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: UserPublic,
}

// -- Content --

#[derive(Debug, Deserialize)]
pub struct CastVoteRequest {
    #[serde(rename = "candidateIndex")]
    pub candidate_index: usize,
}

#[derive(Debug, Serialize)]
pub struct CastVoteResponse {
    pub success: bool,
    pub candidates: Vec<Value>,
    #[serde(rename = "votedUsers")]
    pub voted_users: Vec<Value>,
}

#[derive(Debug, Serialize)]
pub struct ItemsResponse {
    pub items: Vec<ContentItem>,
}

#[derive(Debug, Serialize)]
pub struct ItemResponse {
    pub item: ContentItem,
}

/// Freeform payload body for content create/update.
pub type Payload = Map<String, Value>;
