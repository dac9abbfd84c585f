use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{ChatError, Result};
use crate::models::ConversationRow;
use crate::{Database, now_ts};

impl Database {
    /// Find the conversation between two users, creating it if absent.
    /// Idempotent in either argument order: the pair is normalized before
    /// hitting the UNIQUE(user_min, user_max) constraint, so two racing
    /// first-messages cannot produce two conversations.
    ///
    /// `candidate_id` is used only if a new row is inserted. Returns
    /// (conversation_id, created).
    pub fn find_or_create_conversation(
        &self,
        candidate_id: &str,
        user_a: &str,
        user_b: &str,
    ) -> Result<(String, bool)> {
        if user_a == user_b {
            return Err(ChatError::Validation(
                "cannot start a conversation with yourself".into(),
            ));
        }

        let (user_min, user_max) = if user_a <= user_b {
            (user_a, user_b)
        } else {
            (user_b, user_a)
        };

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO conversations (id, user_min, user_max, last_activity_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![candidate_id, user_min, user_max, now_ts()],
            )?;

            if inserted == 1 {
                tx.execute(
                    "INSERT INTO participants (conversation_id, user_id) VALUES (?1, ?2)",
                    params![candidate_id, user_min],
                )?;
                tx.execute(
                    "INSERT INTO participants (conversation_id, user_id) VALUES (?1, ?2)",
                    params![candidate_id, user_max],
                )?;
                tx.commit()?;
                return Ok((candidate_id.to_string(), true));
            }

            let existing: String = tx.query_row(
                "SELECT id FROM conversations WHERE user_min = ?1 AND user_max = ?2",
                params![user_min, user_max],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok((existing, false))
        })
    }

    /// All conversations for a user, most recently active first, each
    /// annotated with the other participant and the latest message.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, po.user_id, u.username, c.last_activity_at,
                        (SELECT m.sender_id FROM messages m WHERE m.conversation_id = c.id
                         ORDER BY m.created_at DESC, m.id DESC LIMIT 1),
                        (SELECT m.content FROM messages m WHERE m.conversation_id = c.id
                         ORDER BY m.created_at DESC, m.id DESC LIMIT 1),
                        (SELECT m.created_at FROM messages m WHERE m.conversation_id = c.id
                         ORDER BY m.created_at DESC, m.id DESC LIMIT 1)
                 FROM conversations c
                 JOIN participants p  ON p.conversation_id = c.id AND p.user_id = ?1
                 JOIN participants po ON po.conversation_id = c.id AND po.user_id <> ?1
                 JOIN users u ON u.id = po.user_id
                 ORDER BY c.last_activity_at DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        other_user_id: row.get(1)?,
                        other_username: row.get(2)?,
                        last_activity_at: row.get(3)?,
                        last_message_sender_id: row.get(4)?,
                        last_message_content: row.get(5)?,
                        last_message_at: row.get(6)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Delete-for-everyone. All-or-nothing: reactions, messages,
    /// participants and the conversation row go in one transaction,
    /// ordered child-first. Returns the participant ids so the caller
    /// can notify each of them directly.
    pub fn delete_conversation(&self, conversation_id: &str, actor: &str) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            ensure_conversation(&tx, conversation_id)?;

            let participants = participant_ids(&tx, conversation_id)?;
            if !participants.iter().any(|p| p == actor) {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }

            tx.execute(
                "DELETE FROM reactions WHERE message_id IN
                 (SELECT id FROM messages WHERE conversation_id = ?1)",
                [conversation_id],
            )?;
            tx.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [conversation_id],
            )?;
            tx.execute(
                "DELETE FROM participants WHERE conversation_id = ?1",
                [conversation_id],
            )?;
            tx.execute(
                "DELETE FROM conversations WHERE id = ?1",
                [conversation_id],
            )?;

            tx.commit()?;
            Ok(participants)
        })
    }

    /// NotFound if the conversation is gone, Forbidden if the user is not
    /// a member. Used by the gateway before admitting a connection to a
    /// conversation's room.
    pub fn assert_participant(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            ensure_conversation(conn, conversation_id)?;
            if !is_participant(conn, conversation_id, user_id)? {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }
            Ok(())
        })
    }

    /// Advance the caller's read watermark to now. The watermark never
    /// moves backward; a stale call is a no-op, not an error.
    pub fn mark_read(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            ensure_conversation(conn, conversation_id)?;
            if !is_participant(conn, conversation_id, user_id)? {
                return Err(ChatError::Forbidden(
                    "not a participant of this conversation".into(),
                ));
            }

            conn.execute(
                "UPDATE participants SET last_read_at = ?3
                 WHERE conversation_id = ?1 AND user_id = ?2
                   AND (last_read_at IS NULL OR last_read_at < ?3)",
                params![conversation_id, user_id, now_ts()],
            )?;
            Ok(())
        })
    }
}

pub(crate) fn ensure_conversation(conn: &Connection, conversation_id: &str) -> Result<()> {
    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM conversations WHERE id = ?1",
            [conversation_id],
            |row| row.get(0),
        )
        .optional()?;

    match exists {
        Some(_) => Ok(()),
        None => Err(ChatError::NotFound(format!(
            "conversation {} not found",
            conversation_id
        ))),
    }
}

pub(crate) fn is_participant(
    conn: &Connection,
    conversation_id: &str,
    user_id: &str,
) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
            |row| row.get(0),
        )
        .optional()?;

    Ok(found.is_some())
}

pub(crate) fn participant_ids(conn: &Connection, conversation_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT user_id FROM participants WHERE conversation_id = ?1")?;
    let ids = stmt
        .query_map([conversation_id], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("ua", "alice", "alice@example.com", "hash").unwrap();
        db.create_user("ub", "bob", "bob@example.com", "hash").unwrap();
        db.create_user("uc", "carol", "carol@example.com", "hash").unwrap();
        db
    }

    #[test]
    fn find_or_create_is_idempotent_in_either_order() {
        let db = seeded_db();

        let (first, created) = db.find_or_create_conversation("c1", "ua", "ub").unwrap();
        assert!(created);
        assert_eq!(first, "c1");

        let (second, created) = db.find_or_create_conversation("c2", "ub", "ua").unwrap();
        assert!(!created);
        assert_eq!(second, "c1");
    }

    #[test]
    fn self_conversation_is_rejected() {
        let db = seeded_db();
        let err = db.find_or_create_conversation("c1", "ua", "ua").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn conversation_creates_both_participants() {
        let db = seeded_db();
        db.find_or_create_conversation("c1", "ub", "ua").unwrap();

        let participants = db
            .with_conn(|conn| participant_ids(conn, "c1"))
            .unwrap();
        assert_eq!(participants.len(), 2);
        assert!(participants.contains(&"ua".to_string()));
        assert!(participants.contains(&"ub".to_string()));
    }

    #[test]
    fn delete_cascades_messages_and_reactions() {
        let db = seeded_db();
        db.find_or_create_conversation("c1", "ua", "ub").unwrap();
        db.append_message("m1", "c1", "ua", "hello").unwrap();
        db.toggle_reaction("r1", "m1", "ub", "👍").unwrap();

        let participants = db.delete_conversation("c1", "ub").unwrap();
        assert_eq!(participants.len(), 2);

        let err = db.list_messages("c1", "ua", 1, 50).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        let leftovers: i64 = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM reactions", [], |row| row.get(0))
                    .unwrap())
            })
            .unwrap();
        assert_eq!(leftovers, 0);

        // A fresh send between the same pair creates a new conversation.
        let (fresh, created) = db.find_or_create_conversation("c9", "ua", "ub").unwrap();
        assert!(created);
        assert_eq!(fresh, "c9");
    }

    #[test]
    fn delete_requires_participation() {
        let db = seeded_db();
        db.find_or_create_conversation("c1", "ua", "ub").unwrap();
        let err = db.delete_conversation("c1", "uc").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn mark_read_never_moves_backward() {
        let db = seeded_db();
        db.find_or_create_conversation("c1", "ua", "ub").unwrap();

        db.mark_read("c1", "ua").unwrap();
        let first: Option<String> = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT last_read_at FROM participants
                         WHERE conversation_id = 'c1' AND user_id = 'ua'",
                        [],
                        |row| row.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert!(first.is_some());

        db.mark_read("c1", "ua").unwrap();
        let second: Option<String> = db
            .with_conn(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT last_read_at FROM participants
                         WHERE conversation_id = 'c1' AND user_id = 'ua'",
                        [],
                        |row| row.get(0),
                    )
                    .unwrap())
            })
            .unwrap();
        assert!(second >= first);
    }

    #[test]
    fn list_orders_by_last_activity() {
        let db = seeded_db();
        db.find_or_create_conversation("c1", "ua", "ub").unwrap();
        db.find_or_create_conversation("c2", "ua", "uc").unwrap();
        db.append_message("m1", "c1", "ua", "newest activity").unwrap();

        let rows = db.list_conversations("ua").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, "c1");
        assert_eq!(rows[0].other_username, "bob");
        assert_eq!(
            rows[0].last_message_content.as_deref(),
            Some("newest activity")
        );
        assert_eq!(rows[1].id, "c2");
        assert!(rows[1].last_message_content.is_none());
    }
}
