use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS counters (
            namespace   TEXT PRIMARY KEY,
            value       INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY,
            email           TEXT NOT NULL UNIQUE,
            password_hash   TEXT NOT NULL,
            role            TEXT NOT NULL,
            name            TEXT,
            created_by      INTEGER,
            created_at      TEXT NOT NULL,
            updated_at      TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_users_role
            ON users(role);

        CREATE TABLE IF NOT EXISTS password_resets (
            id                      INTEGER PRIMARY KEY,
            user_id                 INTEGER NOT NULL,
            otp_hash                TEXT,
            otp_expires_at          TEXT,
            otp_attempts            INTEGER NOT NULL DEFAULT 0,
            reset_token_hash        TEXT,
            reset_token_expires_at  TEXT,
            verified_at             TEXT,
            created_at              TEXT NOT NULL,
            updated_at              TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_password_resets_user
            ON password_resets(user_id);

        CREATE TABLE IF NOT EXISTS content (
            kind        TEXT NOT NULL,
            id          INTEGER NOT NULL,
            created_by  INTEGER,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            payload     TEXT NOT NULL,
            PRIMARY KEY (kind, id)
        );

        -- Single authoritative row; written through whenever a notifications
        -- item with payload kind 'reminder_settings' is saved.
        CREATE TABLE IF NOT EXISTS reminder_settings (
            id              INTEGER PRIMARY KEY CHECK (id = 1),
            enabled         INTEGER NOT NULL,
            selected_time   TEXT NOT NULL,
            source_id       INTEGER,
            updated_at      TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
