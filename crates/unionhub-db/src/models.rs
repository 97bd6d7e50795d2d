//! Database row types — these map directly to SQLite rows.
//! Distinct from unionhub-types API models to keep the DB layer independent.

use unionhub_types::api::UserPublic;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub name: Option<String>,
    pub created_by: Option<i64>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl From<UserRow> for UserPublic {
    fn from(row: UserRow) -> Self {
        UserPublic {
            id: row.id,
            email: row.email,
            role: row.role,
            name: row.name,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PasswordResetRow {
    pub id: i64,
    pub user_id: i64,
    pub otp_hash: Option<String>,
    pub otp_expires_at: Option<String>,
    pub otp_attempts: i64,
    pub reset_token_hash: Option<String>,
    pub reset_token_expires_at: Option<String>,
    pub verified_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}
