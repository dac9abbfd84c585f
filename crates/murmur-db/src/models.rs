//! Database row types — these map directly to SQLite rows.
//! Distinct from the murmur-types API models to keep the DB layer
//! independent; conversions live here so both REST and the gateway
//! share one parsing path.

use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use murmur_types::models::{
    Comment, ConversationSummary, LastMessage, Message, Post, ReactionGroup, User,
};

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password: String,
    pub refresh_token: Option<String>,
    pub last_seen_at: Option<String>,
    pub created_at: String,
}

pub struct ConversationRow {
    pub id: String,
    pub other_user_id: String,
    pub other_username: String,
    pub last_activity_at: String,
    pub last_message_sender_id: Option<String>,
    pub last_message_content: Option<String>,
    pub last_message_at: Option<String>,
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    pub is_edited: bool,
    pub edited_at: Option<String>,
    pub created_at: String,
}

pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub struct PostRow {
    pub id: String,
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub like_count: i64,
    pub created_at: String,
}

#[derive(Debug)]
pub struct CommentRow {
    pub id: String,
    pub post_id: String,
    pub author_id: String,
    pub author_username: String,
    pub content: String,
    pub created_at: String,
}

/// Parse a stored uuid, logging and defaulting on corruption rather than
/// failing an entire page of results.
pub fn parse_uuid(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", what, raw, e);
        Uuid::default()
    })
}

/// Parse a stored timestamp. We write RFC3339, but SQLite column defaults
/// produce "YYYY-MM-DD HH:MM:SS" without a timezone — accept both.
pub fn parse_ts(raw: &str, what: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt {} '{}': {}", what, raw, e);
            DateTime::default()
        })
}

impl UserRow {
    pub fn into_user(self) -> User {
        User {
            id: parse_uuid(&self.id, "user id"),
            username: self.username,
            last_seen_at: self.last_seen_at.map(|ts| parse_ts(&ts, "last_seen_at")),
            created_at: parse_ts(&self.created_at, "user created_at"),
        }
    }
}

impl MessageRow {
    pub fn into_message(self, reactions: Vec<ReactionGroup>) -> Message {
        Message {
            id: parse_uuid(&self.id, "message id"),
            conversation_id: parse_uuid(&self.conversation_id, "conversation id"),
            sender_id: parse_uuid(&self.sender_id, "sender id"),
            sender_username: self.sender_username,
            content: self.content,
            is_edited: self.is_edited,
            edited_at: self.edited_at.map(|ts| parse_ts(&ts, "edited_at")),
            created_at: parse_ts(&self.created_at, "message created_at"),
            reactions,
        }
    }
}

impl ConversationRow {
    pub fn into_summary(self) -> ConversationSummary {
        let last_message = match (
            self.last_message_sender_id,
            self.last_message_content,
            self.last_message_at,
        ) {
            (Some(sender), Some(content), Some(at)) => Some(LastMessage {
                sender_id: parse_uuid(&sender, "last message sender"),
                content,
                created_at: parse_ts(&at, "last message created_at"),
            }),
            _ => None,
        };

        ConversationSummary {
            id: parse_uuid(&self.id, "conversation id"),
            other_user_id: parse_uuid(&self.other_user_id, "participant id"),
            other_username: self.other_username,
            last_activity_at: parse_ts(&self.last_activity_at, "last_activity_at"),
            last_message,
        }
    }
}

impl PostRow {
    pub fn into_post(self) -> Post {
        Post {
            id: parse_uuid(&self.id, "post id"),
            author_id: parse_uuid(&self.author_id, "author id"),
            author_username: self.author_username,
            content: self.content,
            like_count: self.like_count.max(0) as usize,
            created_at: parse_ts(&self.created_at, "post created_at"),
        }
    }
}

impl CommentRow {
    pub fn into_comment(self) -> Comment {
        Comment {
            id: parse_uuid(&self.id, "comment id"),
            post_id: parse_uuid(&self.post_id, "post id"),
            author_id: parse_uuid(&self.author_id, "author id"),
            author_username: self.author_username,
            content: self.content,
            created_at: parse_ts(&self.created_at, "comment created_at"),
        }
    }
}
