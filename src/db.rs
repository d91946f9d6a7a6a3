use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::config::Config;
use crate::models::{
    DeliveryOutcome, DeliveryStatus, NotificationLog, NotificationMessage, NotificationUser,
    UserGroup, UserRecord,
};

const SCHEMA_SQL: &str = include_str!("../schema.sql");

const USER_COLUMNS: &str = "u.id, u.external_id, u.email, u.phone, u.telegram, \
     u.telegram_chat_id, u.group_id, u.is_active, u.created_at, u.updated_at";

pub struct Db {
    conn: Connection,
}

/// Fields to change on a user; `None` leaves the column as it is.
#[derive(Debug, Default)]
pub struct UserPatch {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub telegram: Option<String>,
    pub group_id: Option<i64>,
    pub is_active: Option<bool>,
}

/// Delivery log selection; unset fields match everything.
#[derive(Debug, Default)]
pub struct LogFilter {
    pub message_id: Option<i64>,
    pub status: Option<DeliveryStatus>,
    pub method: Option<String>,
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .with_context(|| format!("Bad timestamp in DB: {raw}"))
}

fn user_from_row(row: &Row<'_>) -> Result<NotificationUser> {
    Ok(NotificationUser {
        id: row.get(0)?,
        external_id: row.get(1)?,
        email: row.get(2)?,
        phone: row.get(3)?,
        telegram: row.get(4)?,
        telegram_chat_id: row.get(5)?,
        group_id: row.get(6)?,
        is_active: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?)?,
        updated_at: parse_ts(&row.get::<_, String>(9)?)?,
    })
}

/// Lowercased handle without the leading `@`, the form usernames are
/// compared in.
pub fn normalize_handle(handle: &str) -> String {
    handle.trim().trim_start_matches('@').to_lowercase()
}

impl Db {
    pub fn open(cfg: &Config) -> Result<Self> {
        Db::open_path(&cfg.db_path)
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DB at {}", path.display()))?;
        Db::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Db::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        // The collector writes through its own connection.
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;
        Ok(Db { conn })
    }

    /// Runs `f` inside one transaction; an error from `f` rolls it back.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Db) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(out)
    }

    // ---- groups ----

    pub fn get_or_create_group(&self, name: &str, description: &str) -> Result<i64> {
        let existing = self
            .conn
            .query_row(
                "SELECT id FROM user_groups WHERE name = ?",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }

        self.conn.execute(
            "INSERT INTO user_groups (name, description, created_at) VALUES (?, ?, ?)",
            params![name, description, now_ts()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_group(&self, name: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM user_groups WHERE name = ?",
                [name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn create_group(&self, name: &str, description: &str) -> Result<i64> {
        if self.find_group(name)?.is_some() {
            bail!("Group {name} already exists");
        }
        self.get_or_create_group(name, description)
    }

    /// Renames and/or redescribes group `id`.
    pub fn update_group(&self, id: i64, name: Option<&str>, description: Option<&str>) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE user_groups SET name = COALESCE(?1, name), description = COALESCE(?2, description)
                 WHERE id = ?3",
                params![name, description, id],
            )
            .with_context(|| format!("Could not update group {id}"))?;
        if changed == 0 {
            bail!("Group {id} does not exist");
        }
        Ok(())
    }

    /// Deletes group `id` together with its users. Returns how many users
    /// went with it.
    pub fn delete_group(&self, id: i64) -> Result<usize> {
        self.in_transaction(|db| {
            let members: i64 = db.conn.query_row(
                "SELECT COUNT(*) FROM users WHERE group_id = ?",
                [id],
                |row| row.get(0),
            )?;
            if db.conn.execute("DELETE FROM user_groups WHERE id = ?", [id])? == 0 {
                bail!("Group {id} does not exist");
            }
            Ok(members as usize)
        })
    }

    /// Every group with the number of its active users.
    pub fn list_groups(&self) -> Result<Vec<(UserGroup, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT g.id, g.name, g.description, g.created_at,
                    (SELECT COUNT(*) FROM users u WHERE u.group_id = g.id AND u.is_active = 1)
             FROM user_groups g
             ORDER BY g.name",
        )?;
        let iter = stmt.query_and_then([], |row| {
            let group = UserGroup {
                id: row.get(0)?,
                name: row.get(1)?,
                description: row.get(2)?,
                created_at: parse_ts(&row.get::<_, String>(3)?)?,
            };
            Ok((group, row.get::<_, i64>(4)?))
        })?;
        iter.collect::<Result<Vec<_>>>()
    }

    // ---- users ----

    /// Inserts or updates the user keyed by `external_id` and marks it
    /// active. Returns `true` when a new row was created. A changed Telegram
    /// handle drops the previously resolved chat id.
    pub fn upsert_user(
        &self,
        external_id: i64,
        email: &str,
        phone: &str,
        telegram: &str,
        group_id: i64,
    ) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM users WHERE external_id = ?",
                [external_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let ts = now_ts();
        self.conn.execute(
            "INSERT INTO users (external_id, email, phone, telegram, group_id, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(external_id) DO UPDATE SET
                email = excluded.email,
                phone = excluded.phone,
                telegram_chat_id = CASE WHEN users.telegram = excluded.telegram
                                        THEN users.telegram_chat_id ELSE NULL END,
                telegram = excluded.telegram,
                group_id = excluded.group_id,
                is_active = 1,
                updated_at = excluded.updated_at",
            params![external_id, email, phone, telegram, group_id, ts],
        )?;

        Ok(!exists)
    }

    pub fn create_user(
        &self,
        external_id: i64,
        email: &str,
        phone: &str,
        telegram: &str,
        group_id: i64,
    ) -> Result<i64> {
        let ts = now_ts();
        let inserted = self.conn.execute(
            "INSERT INTO users (external_id, email, phone, telegram, group_id, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
             ON CONFLICT(external_id) DO NOTHING",
            params![external_id, email, phone, telegram, group_id, ts],
        )?;
        if inserted == 0 {
            bail!("User with external id {external_id} already exists");
        }
        Ok(self.conn.last_insert_rowid())
    }

    /// Applies `patch` to user `id`. A new Telegram handle drops the
    /// resolved chat id, as on import.
    pub fn update_user(&self, id: i64, patch: &UserPatch) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE users SET
                email = COALESCE(?1, email),
                phone = COALESCE(?2, phone),
                telegram_chat_id = CASE WHEN ?3 IS NULL OR ?3 = telegram
                                        THEN telegram_chat_id ELSE NULL END,
                telegram = COALESCE(?3, telegram),
                group_id = COALESCE(?4, group_id),
                is_active = COALESCE(?5, is_active),
                updated_at = ?6
             WHERE id = ?7",
            params![
                patch.email,
                patch.phone,
                patch.telegram,
                patch.group_id,
                patch.is_active,
                now_ts(),
                id
            ],
        )?;
        if changed == 0 {
            bail!("User {id} does not exist");
        }
        Ok(())
    }

    pub fn delete_user(&self, id: i64) -> Result<()> {
        if self.conn.execute("DELETE FROM users WHERE id = ?", [id])? == 0 {
            bail!("User {id} does not exist");
        }
        Ok(())
    }

    pub fn get_user(&self, id: i64) -> Result<Option<NotificationUser>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users u WHERE u.id = ?");
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query_and_then([id], user_from_row)?;
        rows.next().transpose()
    }

    #[cfg(test)]
    pub fn list_users(&self, group_id: Option<i64>) -> Result<Vec<NotificationUser>> {
        self.search_users(group_id, None)
    }

    /// Users of `group_id` (or all) whose email, phone or Telegram handle
    /// contains `search`, ignoring case.
    pub fn search_users(
        &self,
        group_id: Option<i64>,
        search: Option<&str>,
    ) -> Result<Vec<NotificationUser>> {
        let needle = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users u
             WHERE (?1 IS NULL OR u.group_id = ?1)
               AND (?2 IS NULL
                    OR instr(lower(u.email), ?2) > 0
                    OR instr(lower(u.phone), ?2) > 0
                    OR instr(lower(u.telegram), ?2) > 0)
             ORDER BY u.external_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let iter = stmt.query_and_then(params![group_id, needle], user_from_row)?;
        iter.collect()
    }

    pub fn set_users_active(&self, ids: &[i64], active: bool) -> Result<usize> {
        self.in_transaction(|db| {
            let mut stmt = db
                .conn
                .prepare("UPDATE users SET is_active = ?, updated_at = ? WHERE id = ?")?;
            let ts = now_ts();
            let mut changed = 0;
            for id in ids {
                changed += stmt.execute(params![active, ts, id])?;
            }
            Ok(changed)
        })
    }

    pub fn change_users_group(&self, ids: &[i64], group_id: i64) -> Result<usize> {
        self.in_transaction(|db| {
            let mut stmt = db
                .conn
                .prepare("UPDATE users SET group_id = ?, updated_at = ? WHERE id = ?")?;
            let ts = now_ts();
            let mut changed = 0;
            for id in ids {
                changed += stmt.execute(params![group_id, ts, id])?;
            }
            Ok(changed)
        })
    }

    pub fn delete_users(&self, ids: &[i64]) -> Result<usize> {
        self.in_transaction(|db| {
            let mut stmt = db.conn.prepare("DELETE FROM users WHERE id = ?")?;
            let mut changed = 0;
            for id in ids {
                changed += stmt.execute([id])?;
            }
            Ok(changed)
        })
    }

    /// All users in import-file shape, ordered by external id.
    pub fn user_records(&self) -> Result<Vec<UserRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.external_id, u.email, u.phone, u.telegram, g.name
             FROM users u JOIN user_groups g ON g.id = u.group_id
             ORDER BY u.external_id",
        )?;
        let iter = stmt.query_map([], |row| {
            Ok(UserRecord {
                id: row.get(0)?,
                email: row.get(1)?,
                phone: row.get(2)?,
                telegram: row.get(3)?,
                group: row.get(4)?,
            })
        })?;
        Ok(iter.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stores `chat_id` on every user whose handle matches `username`.
    pub fn assign_telegram_chat_id(&self, username: &str, chat_id: i64) -> Result<usize> {
        let handle = normalize_handle(username);
        if handle.is_empty() {
            return Ok(0);
        }
        let changed = self.conn.execute(
            "UPDATE users SET telegram_chat_id = ?1, updated_at = ?2
             WHERE lower(ltrim(trim(telegram), '@')) = ?3
               AND (telegram_chat_id IS NULL OR telegram_chat_id != ?1)",
            params![chat_id, now_ts(), handle],
        )?;
        Ok(changed)
    }

    // ---- messages ----

    pub fn create_message(
        &self,
        title: &str,
        content: &str,
        send_to_all: bool,
        target_groups: &[i64],
        delivery_methods: &[String],
    ) -> Result<i64> {
        let methods_json = serde_json::to_string(delivery_methods)?;
        self.in_transaction(|db| {
            db.conn.execute(
                "INSERT INTO messages (title, content, send_to_all, delivery_methods, created_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![title, content, send_to_all, methods_json, now_ts()],
            )?;
            let message_id = db.conn.last_insert_rowid();

            let mut stmt = db.conn.prepare(
                "INSERT OR IGNORE INTO message_groups (message_id, group_id) VALUES (?, ?)",
            )?;
            for group_id in target_groups {
                stmt.execute(params![message_id, group_id])
                    .with_context(|| format!("Unknown group id {group_id}"))?;
            }
            Ok(message_id)
        })
    }

    fn message_from_row(&self, row: &Row<'_>) -> Result<NotificationMessage> {
        let id: i64 = row.get(0)?;
        let methods_raw: String = row.get(4)?;
        let sent_at = row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_ts(&s))
            .transpose()?;

        let mut stmt = self
            .conn
            .prepare("SELECT group_id FROM message_groups WHERE message_id = ? ORDER BY group_id")?;
        let target_groups = stmt
            .query_map([id], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(NotificationMessage {
            id,
            title: row.get(1)?,
            content: row.get(2)?,
            send_to_all: row.get(3)?,
            target_groups,
            delivery_methods: serde_json::from_str(&methods_raw)
                .with_context(|| format!("Bad delivery_methods for message {id}"))?,
            created_at: parse_ts(&row.get::<_, String>(5)?)?,
            sent_at,
            is_sent: row.get(7)?,
        })
    }

    pub fn get_message(&self, id: i64) -> Result<NotificationMessage> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, content, send_to_all, delivery_methods, created_at, sent_at, is_sent
             FROM messages WHERE id = ?",
        )?;
        let mut rows = stmt.query_and_then([id], |row| self.message_from_row(row))?;
        rows.next()
            .transpose()?
            .ok_or_else(|| anyhow!("Message {id} does not exist"))
    }

    pub fn list_messages(&self) -> Result<Vec<NotificationMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, content, send_to_all, delivery_methods, created_at, sent_at, is_sent
             FROM messages ORDER BY created_at DESC, id DESC",
        )?;
        let iter = stmt.query_and_then([], |row| self.message_from_row(row))?;
        iter.collect()
    }

    /// Active users a message goes to: everyone when `send_to_all`, else the
    /// members of its target groups, each user once.
    pub fn target_users(&self, message: &NotificationMessage) -> Result<Vec<NotificationUser>> {
        if message.send_to_all {
            let sql = format!(
                "SELECT {USER_COLUMNS} FROM users u WHERE u.is_active = 1 ORDER BY u.id"
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let iter = stmt.query_and_then([], user_from_row)?;
            return iter.collect();
        }

        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users u
             WHERE u.is_active = 1
               AND u.group_id IN (SELECT group_id FROM message_groups WHERE message_id = ?1)
             ORDER BY u.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let iter = stmt.query_and_then([message.id], user_from_row)?;
        iter.collect()
    }

    pub fn mark_message_sent(&self, message_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE messages SET is_sent = 1, sent_at = ? WHERE id = ?",
            params![now_ts(), message_id],
        )?;
        Ok(())
    }

    // ---- delivery logs ----

    pub fn insert_log(&self, message_id: i64, user_id: i64, outcome: &DeliveryOutcome) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO delivery_logs (message_id, user_id, delivery_method, status, error_message, sent_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    message_id,
                    user_id,
                    outcome.method_name(),
                    outcome.status.as_str(),
                    outcome.error,
                    now_ts(),
                ],
            )
            .context("Failed to insert delivery log")?;
        Ok(self.conn.last_insert_rowid())
    }

    #[cfg(test)]
    pub fn logs_for_message(&self, message_id: i64) -> Result<Vec<NotificationLog>> {
        self.query_logs(&LogFilter {
            message_id: Some(message_id),
            ..Default::default()
        })
    }

    /// Delivery logs matching `filter`, oldest first.
    pub fn query_logs(&self, filter: &LogFilter) -> Result<Vec<NotificationLog>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, message_id, user_id, delivery_method, status, error_message, sent_at
             FROM delivery_logs
             WHERE (?1 IS NULL OR message_id = ?1)
               AND (?2 IS NULL OR status = ?2)
               AND (?3 IS NULL OR delivery_method = ?3)
             ORDER BY id",
        )?;
        let status = filter.status.map(|s| s.as_str());
        let method = filter.method.as_deref().map(|m| m.trim().to_lowercase());
        let iter = stmt.query_and_then(params![filter.message_id, status, method], |row| {
            Ok(NotificationLog {
                id: row.get(0)?,
                message_id: row.get(1)?,
                user_id: row.get(2)?,
                delivery_method: row.get(3)?,
                status: row.get(4)?,
                error_message: row.get(5)?,
                sent_at: parse_ts(&row.get::<_, String>(6)?)?,
            })
        })?;
        iter.collect()
    }
}
