use crate::models::{PasswordResetRow, UserRow};
use crate::{Database, now_iso};
use anyhow::Result;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::warn;
use unionhub_types::content::{ContentItem, ContentType, ReminderSettings};

/// Outcome of a ballot cast. The whole read-check-write runs in one
/// transaction under the connection lock, so two concurrent ballots can
/// neither lose an increment nor double-vote.
#[derive(Debug)]
pub enum VoteOutcome {
    Cast {
        candidates: Vec<Value>,
        voted_users: Vec<Value>,
    },
    NotFound,
    AlreadyVoted,
    InvalidCandidate,
}

impl Database {
    // -- Sequence allocator --

    /// Next value for a counter namespace. Initializes to 1 on first use;
    /// strictly increasing, values are never reused.
    pub fn next_id(&self, namespace: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let value = conn.query_row(
                "INSERT INTO counters (namespace, value) VALUES (?1, 1)
                 ON CONFLICT(namespace) DO UPDATE SET value = value + 1
                 RETURNING value",
                [namespace],
                |row| row.get(0),
            )?;
            Ok(value)
        })
    }

    // -- Users --

    pub fn create_user(
        &self,
        email: &str,
        password_hash: &str,
        role: &str,
        name: Option<&str>,
        created_by: Option<i64>,
    ) -> Result<UserRow> {
        let id = self.next_id("users")?;
        let created_at = now_iso();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, email, password_hash, role, name, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![id, email, password_hash, role, name, created_by, created_at],
            )?;
            Ok(())
        })?;
        Ok(UserRow {
            id,
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role: role.to_string(),
            name: name.map(str::to_string),
            created_by,
            created_at,
            updated_at: None,
        })
    }

    pub fn email_taken(&self, email: &str, exclude_id: Option<i64>) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = match exclude_id {
                Some(id) => conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE email = ?1 AND id != ?2",
                    rusqlite::params![email, id],
                    |row| row.get(0),
                )?,
                None => conn.query_row(
                    "SELECT COUNT(*) FROM users WHERE email = ?1",
                    [email],
                    |row| row.get(0),
                )?,
            };
            Ok(count > 0)
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE email = ?1"))?;
            let row = stmt.query_row([email], map_user_row).optional()?;
            Ok(row)
        })
    }

    pub fn get_user_by_email_role(&self, email: &str, role: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{USER_SELECT} WHERE email = ?1 AND role = ?2"))?;
            let row = stmt.query_row([email, role], map_user_row).optional()?;
            Ok(row)
        })
    }

    pub fn get_user_by_id(&self, id: i64) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{USER_SELECT} WHERE id = ?1"))?;
            let row = stmt.query_row([id], map_user_row).optional()?;
            Ok(row)
        })
    }

    pub fn director_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE role = 'director'",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Users assignable by directors/principals, newest first.
    pub fn list_assigned_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{USER_SELECT}
                 WHERE role IN ('principal', 'teacher', 'employee', 'vice_principal', 'tech_staff')
                 ORDER BY id DESC"
            ))?;
            let rows = stmt
                .query_map([], map_user_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn all_user_emails(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT email FROM users")?;
            let emails = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(emails)
        })
    }

    pub fn director_emails(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT email FROM users WHERE role = 'director'")?;
            let emails = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(emails)
        })
    }

    /// Self-service account update. Fields left as `None` are untouched.
    pub fn update_user_account(
        &self,
        id: i64,
        email: Option<&str>,
        name: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let Some(mut user) = conn
                .prepare(&format!("{USER_SELECT} WHERE id = ?1"))?
                .query_row([id], map_user_row)
                .optional()?
            else {
                return Ok(None);
            };

            if let Some(email) = email {
                user.email = email.to_lowercase();
            }
            if let Some(name) = name {
                user.name = Some(name.to_string());
            }
            if let Some(hash) = password_hash {
                user.password_hash = hash.to_string();
            }
            user.updated_at = Some(now_iso());

            conn.execute(
                "UPDATE users SET email = ?1, name = ?2, password_hash = ?3, updated_at = ?4
                 WHERE id = ?5",
                rusqlite::params![user.email, user.name, user.password_hash, user.updated_at, id],
            )?;
            Ok(Some(user))
        })
    }

    /// Update an assigned (non-director) user. Returns `None` when the target
    /// does not exist or is not an assignable role.
    pub fn update_assigned_user(
        &self,
        id: i64,
        email: Option<&str>,
        role: Option<&str>,
        name: Option<&str>,
        password_hash: Option<&str>,
    ) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let Some(mut user) = conn
                .prepare(&format!("{USER_SELECT} WHERE id = ?1"))?
                .query_row([id], map_user_row)
                .optional()?
            else {
                return Ok(None);
            };

            const ASSIGNED: [&str; 5] =
                ["principal", "teacher", "employee", "vice_principal", "tech_staff"];
            if !ASSIGNED.contains(&user.role.as_str()) {
                return Ok(None);
            }

            if let Some(email) = email {
                user.email = email.to_lowercase();
            }
            if let Some(role) = role {
                user.role = role.to_string();
            }
            if let Some(name) = name {
                user.name = Some(name.to_string());
            }
            if let Some(hash) = password_hash {
                user.password_hash = hash.to_string();
            }
            user.updated_at = Some(now_iso());

            conn.execute(
                "UPDATE users SET email = ?1, role = ?2, name = ?3, password_hash = ?4,
                        updated_at = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    user.email,
                    user.role,
                    user.name,
                    user.password_hash,
                    user.updated_at,
                    id
                ],
            )?;
            Ok(Some(user))
        })
    }

    pub fn delete_user(&self, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM users WHERE id = ?1", [id])?;
            Ok(changed > 0)
        })
    }

    // -- Password resets --

    /// Replace any existing reset entry for the user with a fresh OTP row.
    pub fn upsert_password_reset_otp(
        &self,
        user_id: i64,
        otp_hash: &str,
        otp_expires_at: &str,
    ) -> Result<()> {
        let id = self.next_id("passwordResets")?;
        let now = now_iso();
        self.with_conn(|conn| {
            conn.execute("DELETE FROM password_resets WHERE user_id = ?1", [user_id])?;
            conn.execute(
                "INSERT INTO password_resets
                    (id, user_id, otp_hash, otp_expires_at, otp_attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
                rusqlite::params![id, user_id, otp_hash, otp_expires_at, now],
            )?;
            Ok(())
        })
    }

    pub fn get_password_reset(&self, user_id: i64) -> Result<Option<PasswordResetRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, otp_hash, otp_expires_at, otp_attempts,
                        reset_token_hash, reset_token_expires_at, verified_at,
                        created_at, updated_at
                 FROM password_resets WHERE user_id = ?1",
            )?;
            let row = stmt
                .query_row([user_id], |row| {
                    Ok(PasswordResetRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        otp_hash: row.get(2)?,
                        otp_expires_at: row.get(3)?,
                        otp_attempts: row.get(4)?,
                        reset_token_hash: row.get(5)?,
                        reset_token_expires_at: row.get(6)?,
                        verified_at: row.get(7)?,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    /// Bump the OTP attempt counter, returning the new count.
    pub fn increment_otp_attempts(&self, user_id: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let next = conn
                .query_row(
                    "UPDATE password_resets
                     SET otp_attempts = otp_attempts + 1, updated_at = ?2
                     WHERE user_id = ?1
                     RETURNING otp_attempts",
                    rusqlite::params![user_id, now_iso()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(next)
        })
    }

    /// Swap a verified OTP for a reset token. Clears the OTP fields.
    pub fn set_reset_token(
        &self,
        user_id: i64,
        reset_token_hash: &str,
        reset_token_expires_at: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let now = now_iso();
            let changed = conn.execute(
                "UPDATE password_resets
                 SET otp_hash = NULL, otp_expires_at = NULL, otp_attempts = 0,
                     reset_token_hash = ?2, reset_token_expires_at = ?3,
                     verified_at = ?4, updated_at = ?4
                 WHERE user_id = ?1",
                rusqlite::params![user_id, reset_token_hash, reset_token_expires_at, now],
            )?;
            Ok(changed > 0)
        })
    }

    /// Single-use: deletes the matching unexpired row and returns its user id.
    pub fn consume_reset_token(&self, reset_token_hash: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            let user_id = conn
                .query_row(
                    "DELETE FROM password_resets
                     WHERE reset_token_hash = ?1 AND reset_token_expires_at > ?2
                     RETURNING user_id",
                    rusqlite::params![reset_token_hash, now_iso()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(user_id)
        })
    }

    // -- Content store --

    /// All items of a kind, newest first, with the creator's email joined in.
    pub fn list_content(&self, kind: ContentType) -> Result<Vec<ContentItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.created_by, c.created_at, c.updated_at, c.payload, u.email
                 FROM content c
                 LEFT JOIN users u ON c.created_by = u.id
                 WHERE c.kind = ?1
                 ORDER BY c.id DESC",
            )?;
            let rows = stmt
                .query_map([kind.as_str()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(
                    |(id, created_by, created_at, updated_at, payload, creator_email)| {
                        ContentItem {
                            id,
                            kind,
                            data: parse_payload(kind, id, &payload),
                            created_by,
                            creator_email,
                            created_at,
                            updated_at,
                        }
                    },
                )
                .collect())
        })
    }

    pub fn get_content(&self, kind: ContentType, id: i64) -> Result<Option<ContentItem>> {
        self.with_conn(|conn| query_content(conn, kind, id))
    }

    /// Create an item under the shared "content" id namespace.
    pub fn create_content(
        &self,
        kind: ContentType,
        payload: Map<String, Value>,
        created_by: Option<i64>,
    ) -> Result<ContentItem> {
        let id = self.next_id("content")?;
        let now = now_iso();
        let raw = serde_json::to_string(&Value::Object(payload.clone()))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO content (kind, id, created_by, created_at, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                rusqlite::params![kind.as_str(), id, created_by, now, raw],
            )?;
            write_through_settings(conn, kind, id, &payload, &now)?;
            Ok(())
        })?;
        Ok(ContentItem {
            id,
            kind,
            data: payload,
            created_by,
            creator_email: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Shallow merge: each key of `patch` overwrites the stored payload key
    /// (last-write-wins per field, not a deep merge). Bumps `updated_at` only.
    pub fn update_content(
        &self,
        kind: ContentType,
        id: i64,
        patch: Map<String, Value>,
    ) -> Result<Option<ContentItem>> {
        self.with_conn(|conn| {
            let Some(mut item) = query_content(conn, kind, id)? else {
                return Ok(None);
            };

            for (key, value) in patch {
                item.data.insert(key, value);
            }
            item.updated_at = now_iso();

            let raw = serde_json::to_string(&Value::Object(item.data.clone()))?;
            conn.execute(
                "UPDATE content SET payload = ?1, updated_at = ?2 WHERE kind = ?3 AND id = ?4",
                rusqlite::params![raw, item.updated_at, kind.as_str(), id],
            )?;
            write_through_settings(conn, kind, id, &item.data, &item.updated_at)?;
            Ok(Some(item))
        })
    }

    pub fn delete_content(&self, kind: ContentType, id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "DELETE FROM content WHERE kind = ?1 AND id = ?2",
                rusqlite::params![kind.as_str(), id],
            )?;
            if changed > 0 && kind == ContentType::Notifications {
                rebuild_settings_after_delete(conn, id)?;
            }
            Ok(changed > 0)
        })
    }

    /// Flip the payload's `reminderSent` flag to true. Idempotent; a missing
    /// item is a no-op. Does not bump `updated_at` — this is dispatcher
    /// bookkeeping, not a user edit.
    pub fn mark_reminder_sent(&self, kind: ContentType, id: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE content
                 SET payload = json_set(payload, '$.reminderSent', json('true'))
                 WHERE kind = ?1 AND id = ?2",
                rusqlite::params![kind.as_str(), id],
            )?;
            Ok(())
        })
    }

    /// Items whose payload `reminderSent` is absent or not true.
    pub fn pending_reminders(&self, kind: ContentType) -> Result<Vec<ContentItem>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_by, created_at, updated_at, payload
                 FROM content
                 WHERE kind = ?1
                   AND COALESCE(json_extract(payload, '$.reminderSent'), 0) != 1",
            )?;
            let rows = stmt
                .query_map([kind.as_str()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows
                .into_iter()
                .map(|(id, created_by, created_at, updated_at, payload)| ContentItem {
                    id,
                    kind,
                    data: parse_payload(kind, id, &payload),
                    created_by,
                    creator_email: None,
                    created_at,
                    updated_at,
                })
                .collect())
        })
    }

    /// Current reminder configuration, if any has ever been saved.
    pub fn reminder_settings(&self) -> Result<Option<ReminderSettings>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT enabled, selected_time FROM reminder_settings WHERE id = 1",
                    [],
                    |row| {
                        Ok(ReminderSettings {
                            enabled: row.get::<_, i64>(0)? != 0,
                            selected_time: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Record a ballot: reject duplicates and bad candidate indexes, otherwise
    /// increment the chosen candidate's tally and append the voter id, all in
    /// one transaction.
    pub fn cast_vote(
        &self,
        id: i64,
        user_id: i64,
        candidate_index: usize,
    ) -> Result<VoteOutcome> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let Some(mut item) = query_content(&tx, ContentType::Votes, id)? else {
                return Ok(VoteOutcome::NotFound);
            };

            let voted_users = match item.data.get("votedUsers") {
                Some(Value::Array(list)) => list.clone(),
                _ => Vec::new(),
            };
            if voted_users.iter().any(|v| v.as_i64() == Some(user_id)) {
                return Ok(VoteOutcome::AlreadyVoted);
            }

            let mut candidates = match item.data.get("candidates") {
                Some(Value::Array(list)) => list.clone(),
                _ => Vec::new(),
            };
            let Some(candidate) = candidates.get_mut(candidate_index).and_then(Value::as_object_mut)
            else {
                return Ok(VoteOutcome::InvalidCandidate);
            };

            let tally = candidate.get("votes").and_then(Value::as_i64).unwrap_or(0);
            candidate.insert("votes".to_string(), Value::from(tally + 1));

            let mut voted_users = voted_users;
            voted_users.push(Value::from(user_id));

            item.data
                .insert("candidates".to_string(), Value::Array(candidates.clone()));
            item.data
                .insert("votedUsers".to_string(), Value::Array(voted_users.clone()));

            let raw = serde_json::to_string(&Value::Object(item.data))?;
            tx.execute(
                "UPDATE content SET payload = ?1, updated_at = ?2 WHERE kind = 'votes' AND id = ?3",
                rusqlite::params![raw, now_iso(), id],
            )?;
            tx.commit()?;

            Ok(VoteOutcome::Cast {
                candidates,
                voted_users,
            })
        })
    }
}

const USER_SELECT: &str = "SELECT id, email, password_hash, role, name, created_by, \
                           created_at, updated_at FROM users";

fn map_user_row(row: &rusqlite::Row<'_>) -> std::result::Result<UserRow, rusqlite::Error> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        role: row.get(3)?,
        name: row.get(4)?,
        created_by: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn query_content(conn: &Connection, kind: ContentType, id: i64) -> Result<Option<ContentItem>> {
    let mut stmt = conn.prepare(
        "SELECT created_by, created_at, updated_at, payload
         FROM content WHERE kind = ?1 AND id = ?2",
    )?;
    let row = stmt
        .query_row(rusqlite::params![kind.as_str(), id], |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .optional()?;

    Ok(row.map(|(created_by, created_at, updated_at, payload)| ContentItem {
        id,
        kind,
        data: parse_payload(kind, id, &payload),
        created_by,
        creator_email: None,
        created_at,
        updated_at,
    }))
}

fn parse_payload(kind: ContentType, id: i64, raw: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        _ => {
            warn!("Corrupt payload on {} {}", kind.as_str(), id);
            Map::new()
        }
    }
}

/// Saving a notifications item whose payload `kind` is "reminder_settings"
/// also lands in the dedicated settings row, so the scheduler never scans
/// content for the latest configuration. The highest-id save is authoritative:
/// edits to an older settings item never overwrite a newer one.
fn write_through_settings(
    conn: &Connection,
    kind: ContentType,
    source_id: i64,
    payload: &Map<String, Value>,
    now: &str,
) -> Result<()> {
    if kind != ContentType::Notifications {
        return Ok(());
    }
    if payload.get("kind").and_then(Value::as_str) != Some("reminder_settings") {
        return Ok(());
    }

    let enabled = payload
        .get("enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let selected_time = payload
        .get("selectedTime")
        .and_then(Value::as_str)
        .unwrap_or_default();

    conn.execute(
        "INSERT INTO reminder_settings (id, enabled, selected_time, source_id, updated_at)
         VALUES (1, ?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
             enabled = excluded.enabled,
             selected_time = excluded.selected_time,
             source_id = excluded.source_id,
             updated_at = excluded.updated_at
         WHERE excluded.source_id >= COALESCE(reminder_settings.source_id, -1)",
        rusqlite::params![enabled as i64, selected_time, source_id, now],
    )?;
    Ok(())
}

/// Deleting the notifications item the settings row came from falls back to
/// the latest remaining settings save, or clears the row when none is left.
fn rebuild_settings_after_delete(conn: &Connection, deleted_id: i64) -> Result<()> {
    let source = conn
        .query_row(
            "SELECT source_id FROM reminder_settings WHERE id = 1",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()?
        .flatten();
    if source != Some(deleted_id) {
        return Ok(());
    }

    conn.execute("DELETE FROM reminder_settings WHERE id = 1", [])?;

    let latest = conn
        .query_row(
            "SELECT id, payload FROM content
             WHERE kind = 'notifications'
               AND json_extract(payload, '$.kind') = 'reminder_settings'
             ORDER BY id DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    if let Some((id, raw)) = latest {
        let payload = parse_payload(ContentType::Notifications, id, &raw);
        write_through_settings(conn, ContentType::Notifications, id, &payload, &now_iso())?;
    }
    Ok(())
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
