use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{ChatError, Result};
use crate::models::UserRow;
use crate::{Database, now_ts};

const USER_COLUMNS: &str =
    "id, username, email, password, refresh_token, last_seen_at, created_at";

impl Database {
    pub fn create_user(
        &self,
        id: &str,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, email, password) VALUES (?1, ?2, ?3, ?4)",
                (id, username, email, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username = ?1", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id = ?1", id))
    }

    pub fn get_user_by_refresh_token(&self, token: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "refresh_token = ?1", token))
    }

    pub fn set_refresh_token(&self, user_id: &str, token: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET refresh_token = ?2 WHERE id = ?1",
                params![user_id, token],
            )?;
            if n == 0 {
                return Err(ChatError::NotFound(format!("user {} not found", user_id)));
            }
            Ok(())
        })
    }

    /// Stamped on gateway disconnect.
    pub fn touch_last_seen(&self, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen_at = ?2 WHERE id = ?1",
                params![user_id, now_ts()],
            )?;
            Ok(())
        })
    }
}

fn query_user(conn: &Connection, predicate: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, predicate);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                email: row.get(2)?,
                password: row.get(3)?,
                refresh_token: row.get(4)?,
                last_seen_at: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .optional()?;

    Ok(row)
}
