use rusqlite::{Connection, OptionalExtension, params};

use crate::conversations::{ensure_conversation, is_participant};
use crate::error::{ChatError, Result};
use crate::models::{MessageRow, ReactionRow};
use crate::{Database, now_ts};

impl Database {
    /// Append a message to an existing conversation and bump its
    /// last-activity timestamp, atomically.
    pub fn append_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            ensure_conversation(&tx, conversation_id)?;
            if !is_participant(&tx, conversation_id, sender_id)? {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }

            let username: String = tx
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    [sender_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| ChatError::NotFound(format!("user {} not found", sender_id)))?;

            let now = now_ts();
            tx.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, conversation_id, sender_id, content, now],
            )?;
            tx.execute(
                "UPDATE conversations SET last_activity_at = ?2 WHERE id = ?1",
                params![conversation_id, now],
            )?;

            tx.commit()?;
            Ok(MessageRow {
                id: id.to_string(),
                conversation_id: conversation_id.to_string(),
                sender_id: sender_id.to_string(),
                sender_username: username,
                content: content.to_string(),
                is_edited: false,
                edited_at: None,
                created_at: now,
            })
        })
    }

    /// One page of a conversation's history, newest page first but rows in
    /// chronological order for display. Reading a page is what advances the
    /// caller's read watermark.
    pub fn list_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<MessageRow>> {
        let page = page.max(1);
        let limit = page_size.clamp(1, 200);
        let offset = (page - 1) * limit;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            ensure_conversation(&tx, conversation_id)?;
            if !is_participant(&tx, conversation_id, user_id)? {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }

            let mut rows = query_message_page(&tx, conversation_id, limit, offset)?;

            tx.execute(
                "UPDATE participants SET last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2
                   AND (last_read_at IS NULL OR last_read_at < ?3)",
                params![conversation_id, user_id, now_ts()],
            )?;

            tx.commit()?;
            rows.reverse();
            Ok(rows)
        })
    }

    /// Edit a message in place. Only the original sender may edit; the
    /// sender and conversation are immutable, only content and the edit
    /// flags change.
    pub fn edit_message(&self, message_id: &str, actor: &str, content: &str) -> Result<MessageRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let mut row = query_message(&tx, message_id)?
                .ok_or_else(|| ChatError::NotFound(format!("message {} not found", message_id)))?;

            if row.sender_id != actor {
                return Err(ChatError::Forbidden(
                    "only the author can edit a message".into(),
                ));
            }

            let now = now_ts();
            tx.execute(
                "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3 WHERE id = ?1",
                params![message_id, content, now],
            )?;

            tx.commit()?;
            row.content = content.to_string();
            row.is_edited = true;
            row.edited_at = Some(now);
            Ok(row)
        })
    }

    /// Hard delete. Any participant of the conversation may remove a
    /// message; its reactions go with it. Returns the conversation id.
    pub fn delete_message(&self, message_id: &str, actor: &str) -> Result<String> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let row = query_message(&tx, message_id)?
                .ok_or_else(|| ChatError::NotFound(format!("message {} not found", message_id)))?;

            if !is_participant(&tx, &row.conversation_id, actor)? {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }

            tx.execute("DELETE FROM reactions WHERE message_id = ?1", [message_id])?;
            tx.execute("DELETE FROM messages WHERE id = ?1", [message_id])?;

            tx.commit()?;
            Ok(row.conversation_id)
        })
    }

    /// Toggle a reaction: removes if the (message, user, emoji) triple
    /// exists, inserts if not. Returns (added, conversation_id).
    pub fn toggle_reaction(
        &self,
        candidate_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<(bool, String)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let row = query_message(&tx, message_id)?
                .ok_or_else(|| ChatError::NotFound(format!("message {} not found", message_id)))?;

            if !is_participant(&tx, &row.conversation_id, user_id)? {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM reactions
                     WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    params![message_id, user_id, emoji],
                    |r| r.get(0),
                )
                .optional()?;

            let added = match existing {
                Some(existing_id) => {
                    tx.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                    false
                }
                None => {
                    tx.execute(
                        "INSERT INTO reactions (id, message_id, user_id, emoji)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![candidate_id, message_id, user_id, emoji],
                    )?;
                    true
                }
            };

            tx.commit()?;
            Ok((added, row.conversation_id))
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at
                 FROM reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let bind: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(bind.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, u.username,
     m.content, m.is_edited, m.edited_at, m.created_at";

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_username: row
            .get::<_, Option<String>>(3)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(4)?,
        is_edited: row.get(5)?,
        edited_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn query_message(conn: &Connection, message_id: &str) -> Result<Option<MessageRow>> {
    let sql = format!(
        "SELECT {} FROM messages m LEFT JOIN users u ON m.sender_id = u.id WHERE m.id = ?1",
        MESSAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let row = stmt.query_row([message_id], map_message_row).optional()?;
    Ok(row)
}

fn query_message_page(
    conn: &Connection,
    conversation_id: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<MessageRow>> {
    // JOIN users to fetch sender_username in a single query (eliminates N+1)
    let sql = format!(
        "SELECT {} FROM messages m
         LEFT JOIN users u ON m.sender_id = u.id
         WHERE m.conversation_id = ?1
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?2 OFFSET ?3",
        MESSAGE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(params![conversation_id, limit, offset], map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("ua", "alice", "alice@example.com", "hash").unwrap();
        db.create_user("ub", "bob", "bob@example.com", "hash").unwrap();
        db.create_user("uc", "carol", "carol@example.com", "hash").unwrap();
        db.find_or_create_conversation("c1", "ua", "ub").unwrap();
        db
    }

    #[test]
    fn append_requires_participation() {
        let db = seeded_db();
        let err = db.append_message("m1", "c1", "uc", "hi").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn append_bumps_last_activity() {
        let db = seeded_db();
        let before: String = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT last_activity_at FROM conversations WHERE id = 'c1'",
                        [],
                        |row| row.get(0),
                    )
                    .unwrap())
            })
            .unwrap();

        let row = db.append_message("m1", "c1", "ua", "hello").unwrap();
        assert_eq!(row.sender_username, "alice");

        let after: String = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT last_activity_at FROM conversations WHERE id = 'c1'",
                        [],
                        |row| row.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert!(after >= before);
        assert_eq!(after, row.created_at);
    }

    #[test]
    fn edit_by_non_sender_leaves_content_unchanged() {
        let db = seeded_db();
        db.append_message("m1", "c1", "ua", "original").unwrap();

        let err = db.edit_message("m1", "ub", "tampered").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        let rows = db.list_messages("c1", "ub", 1, 50).unwrap();
        assert_eq!(rows[0].content, "original");
        assert!(!rows[0].is_edited);
    }

    #[test]
    fn edit_sets_flags() {
        let db = seeded_db();
        db.append_message("m1", "c1", "ua", "hello").unwrap();

        let row = db.edit_message("m1", "ua", "hello there").unwrap();
        assert_eq!(row.content, "hello there");
        assert!(row.is_edited);
        assert!(row.edited_at.is_some());
    }

    #[test]
    fn toggle_twice_returns_to_original_state() {
        let db = seeded_db();
        db.append_message("m1", "c1", "ua", "hello").unwrap();

        let (added, conv) = db.toggle_reaction("r1", "m1", "ub", "👍").unwrap();
        assert!(added);
        assert_eq!(conv, "c1");

        let (added, _) = db.toggle_reaction("r2", "m1", "ub", "👍").unwrap();
        assert!(!added);

        let reactions = db
            .get_reactions_for_messages(&["m1".to_string()])
            .unwrap();
        assert!(reactions.is_empty());
    }

    #[test]
    fn react_requires_participation() {
        let db = seeded_db();
        db.append_message("m1", "c1", "ua", "hello").unwrap();
        let err = db.toggle_reaction("r1", "m1", "uc", "👍").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn delete_message_cascades_reactions() {
        let db = seeded_db();
        db.append_message("m1", "c1", "ua", "hello").unwrap();
        db.toggle_reaction("r1", "m1", "ub", "🔥").unwrap();

        // Any participant may delete, not just the sender.
        let conv = db.delete_message("m1", "ub").unwrap();
        assert_eq!(conv, "c1");

        assert!(db.list_messages("c1", "ua", 1, 50).unwrap().is_empty());
        assert!(db
            .get_reactions_for_messages(&["m1".to_string()])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn pages_are_newest_first_rows_oldest_first() {
        let db = seeded_db();
        for i in 0..5 {
            db.append_message(&format!("m{}", i), "c1", "ua", &format!("msg {}", i))
                .unwrap();
        }

        let page1 = db.list_messages("c1", "ua", 1, 2).unwrap();
        let contents: Vec<&str> = page1.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 3", "msg 4"]);

        let page2 = db.list_messages("c1", "ua", 2, 2).unwrap();
        let contents: Vec<&str> = page2.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 1", "msg 2"]);
    }

    #[test]
    fn listing_advances_read_watermark() {
        let db = seeded_db();
        db.append_message("m1", "c1", "ua", "hello").unwrap();

        db.list_messages("c1", "ub", 1, 50).unwrap();
        let watermark: Option<String> = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT last_read_at FROM participants
                         WHERE conversation_id = 'c1' AND user_id = 'ub'",
                        [],
                        |row| row.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert!(watermark.is_some());
    }

    #[test]
    fn missing_message_is_not_found() {
        let db = seeded_db();
        let err = db.edit_message("nope", "ua", "new").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        let err = db.delete_message("nope", "ua").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        let err = db.toggle_reaction("r1", "nope", "ua", "👍").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }
}
