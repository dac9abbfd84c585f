use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{ChatError, Result};
use crate::models::{CommentRow, PostRow};
use crate::{Database, now_ts};

impl Database {
    pub fn insert_post(&self, id: &str, author_id: &str, content: &str) -> Result<PostRow> {
        self.with_conn(|conn| {
            let username: String = conn
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    [author_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| ChatError::NotFound(format!("user {} not found", author_id)))?;

            let now = now_ts();
            conn.execute(
                "INSERT INTO posts (id, author_id, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, author_id, content, now],
            )?;

            Ok(PostRow {
                id: id.to_string(),
                author_id: author_id.to_string(),
                author_username: username,
                content: content.to_string(),
                like_count: 0,
                created_at: now,
            })
        })
    }

    pub fn list_posts(&self, limit: u32) -> Result<Vec<PostRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.author_id, u.username, p.content,
                        (SELECT COUNT(*) FROM post_likes l WHERE l.post_id = p.id),
                        p.created_at
                 FROM posts p
                 LEFT JOIN users u ON p.author_id = u.id
                 ORDER BY p.created_at DESC
                 LIMIT ?1",
            )?;

            let rows = stmt
                .query_map([limit], map_post_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Author-only removal; likes and comments go with the post in one
    /// transaction.
    pub fn delete_post(&self, post_id: &str, actor: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let author: String = tx
                .query_row(
                    "SELECT author_id FROM posts WHERE id = ?1",
                    [post_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| ChatError::NotFound(format!("post {} not found", post_id)))?;

            if author != actor {
                return Err(ChatError::Forbidden(
                    "only the author can delete a post".into(),
                ));
            }

            tx.execute("DELETE FROM post_likes WHERE post_id = ?1", [post_id])?;
            tx.execute("DELETE FROM comments WHERE post_id = ?1", [post_id])?;
            tx.execute("DELETE FROM posts WHERE id = ?1", [post_id])?;

            tx.commit()?;
            Ok(())
        })
    }

    /// Toggle a like: same shape as message reactions, keyed on the
    /// unique (post, user) pair. Returns true if the like was added.
    pub fn toggle_post_like(&self, post_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            ensure_post(&tx, post_id)?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM post_likes WHERE post_id = ?1 AND user_id = ?2",
                    params![post_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;

            let liked = match existing {
                Some(_) => {
                    tx.execute(
                        "DELETE FROM post_likes WHERE post_id = ?1 AND user_id = ?2",
                        params![post_id, user_id],
                    )?;
                    false
                }
                None => {
                    tx.execute(
                        "INSERT INTO post_likes (post_id, user_id) VALUES (?1, ?2)",
                        params![post_id, user_id],
                    )?;
                    true
                }
            };

            tx.commit()?;
            Ok(liked)
        })
    }

    pub fn insert_comment(
        &self,
        id: &str,
        post_id: &str,
        author_id: &str,
        content: &str,
    ) -> Result<CommentRow> {
        self.with_conn(|conn| {
            ensure_post(conn, post_id)?;

            let username: String = conn
                .query_row(
                    "SELECT username FROM users WHERE id = ?1",
                    [author_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| ChatError::NotFound(format!("user {} not found", author_id)))?;

            let now = now_ts();
            conn.execute(
                "INSERT INTO comments (id, post_id, author_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, post_id, author_id, content, now],
            )?;

            Ok(CommentRow {
                id: id.to_string(),
                post_id: post_id.to_string(),
                author_id: author_id.to_string(),
                author_username: username,
                content: content.to_string(),
                created_at: now,
            })
        })
    }

    pub fn list_comments(&self, post_id: &str) -> Result<Vec<CommentRow>> {
        self.with_conn(|conn| {
            ensure_post(conn, post_id)?;

            let mut stmt = conn.prepare(
                "SELECT c.id, c.post_id, c.author_id, u.username, c.content, c.created_at
                 FROM comments c
                 LEFT JOIN users u ON c.author_id = u.id
                 WHERE c.post_id = ?1
                 ORDER BY c.created_at ASC",
            )?;

            let rows = stmt
                .query_map([post_id], |row| {
                    Ok(CommentRow {
                        id: row.get(0)?,
                        post_id: row.get(1)?,
                        author_id: row.get(2)?,
                        author_username: row
                            .get::<_, Option<String>>(3)?
                            .unwrap_or_else(|| "unknown".to_string()),
                        content: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }
}

fn ensure_post(conn: &Connection, post_id: &str) -> Result<()> {
    let exists: Option<String> = conn
        .query_row("SELECT id FROM posts WHERE id = ?1", [post_id], |row| {
            row.get(0)
        })
        .optional()?;

    match exists {
        Some(_) => Ok(()),
        None => Err(ChatError::NotFound(format!("post {} not found", post_id))),
    }
}

fn map_post_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PostRow> {
    Ok(PostRow {
        id: row.get(0)?,
        author_id: row.get(1)?,
        author_username: row
            .get::<_, Option<String>>(2)?
            .unwrap_or_else(|| "unknown".to_string()),
        content: row.get(3)?,
        like_count: row.get(4)?,
        created_at: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.create_user("ua", "alice", "alice@example.com", "hash").unwrap();
        db.create_user("ub", "bob", "bob@example.com", "hash").unwrap();
        db
    }

    #[test]
    fn like_toggles() {
        let db = seeded_db();
        db.insert_post("p1", "ua", "first post").unwrap();

        assert!(db.toggle_post_like("p1", "ub").unwrap());
        assert!(!db.toggle_post_like("p1", "ub").unwrap());

        let posts = db.list_posts(50).unwrap();
        assert_eq!(posts[0].like_count, 0);
    }

    #[test]
    fn delete_post_is_author_only() {
        let db = seeded_db();
        db.insert_post("p1", "ua", "mine").unwrap();

        let err = db.delete_post("p1", "ub").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));

        db.delete_post("p1", "ua").unwrap();
        assert!(db.list_posts(50).unwrap().is_empty());
    }

    #[test]
    fn comments_attach_to_existing_posts_only() {
        let db = seeded_db();
        let err = db.insert_comment("cm1", "nope", "ua", "hi").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        db.insert_post("p1", "ua", "post").unwrap();
        db.insert_comment("cm1", "p1", "ub", "nice").unwrap();
        let comments = db.list_comments("p1").unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].author_username, "bob");
    }
}
