pub mod auth;
pub mod content;
pub mod email;
pub mod middleware;
pub mod scheduler;
pub mod users;

use std::sync::Arc;

use unionhub_db::Database;

use crate::email::Mailer;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub mailer: Arc<Mailer>,
    pub jwt_secret: String,
}
