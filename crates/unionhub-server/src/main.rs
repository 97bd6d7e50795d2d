use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::{
    Json, Router, middleware,
    routing::{get, post, put},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use unionhub_api::email::Mailer;
use unionhub_api::middleware::require_auth;
use unionhub_api::{AppState, AppStateInner, auth, content, scheduler, users};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "unionhub=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret = std::env::var("UNIONHUB_JWT_SECRET").unwrap_or_else(|_| {
        warn!("UNIONHUB_JWT_SECRET unset; using dev secret");
        "dev-jwt-secret".into()
    });
    let db_path = std::env::var("UNIONHUB_DB_PATH").unwrap_or_else(|_| "unionhub.db".into());
    let host = std::env::var("UNIONHUB_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("UNIONHUB_PORT")
        .unwrap_or_else(|_| "4000".into())
        .parse()?;
    let cors_origin =
        std::env::var("UNIONHUB_CORS_ORIGIN").unwrap_or_else(|_| "http://localhost:5173".into());
    let reminder_interval: u64 = std::env::var("UNIONHUB_REMINDER_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    // Init database and mailer
    let db = Arc::new(unionhub_db::Database::open(&PathBuf::from(&db_path))?);
    let mailer = Arc::new(Mailer::from_env());

    let state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        mailer: mailer.clone(),
        jwt_secret,
    });

    // Background reminder scheduler: one immediate run, then every interval
    tokio::spawn(scheduler::run_reminder_loop(db, mailer, reminder_interval));

    // Routes
    let public_routes = Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/director/register", post(auth::register_director))
        .route("/api/auth/{role}/login", post(auth::login))
        .route(
            "/api/auth/password-reset/request",
            post(auth::password_reset_request),
        )
        .route(
            "/api/auth/password-reset/verify-otp",
            post(auth::password_reset_verify_otp),
        )
        .route(
            "/api/auth/password-reset/reset",
            post(auth::password_reset_reset),
        )
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route(
            "/api/director/users",
            get(users::list_users).post(users::create_user),
        )
        .route("/api/director/users/account", put(users::update_account))
        .route(
            "/api/director/users/{id}",
            put(users::update_user).delete(users::delete_user),
        )
        .route("/api/content/votes/{id}/vote", post(content::cast_vote))
        .route(
            "/api/content/{kind}",
            get(content::list_items).post(content::create_item),
        )
        .route(
            "/api/content/{kind}/{id}",
            get(content::get_item)
                .put(content::update_item)
                .delete(content::delete_item),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .with_state(state);

    let cors = CorsLayer::new()
        .allow_origin(cors_origin.parse::<HeaderValue>()?)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .allow_credentials(true);

    let app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Union Hub backend listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}
