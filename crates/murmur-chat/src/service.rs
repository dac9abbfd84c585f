use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use murmur_db::Database;
use murmur_db::error::{ChatError, Result};
use murmur_db::models::{ReactionRow, parse_uuid};
use murmur_types::events::{GatewayEvent, ReactionAction};
use murmur_types::models::{Message, ReactionGroup};

use crate::plan::NotificationPlan;

pub const MAX_MESSAGE_LEN: usize = 4000;

/// Pure orchestration over the store: each operation runs exactly one
/// store transaction and computes the set of parties to notify. Never
/// talks to the presence registry or the transport, which keeps it
/// unit-testable without a live connection.
///
/// Methods are synchronous (the store blocks on SQLite), so async
/// callers hop through `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct ChatService {
    db: Arc<Database>,
}

impl ChatService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Send a message to another user, creating the conversation lazily
    /// on first contact.
    pub fn send_message(
        &self,
        sender: Uuid,
        recipient: Uuid,
        content: &str,
    ) -> Result<(Message, NotificationPlan)> {
        let content = validate_content(content)?;

        self.db
            .get_user_by_id(&recipient.to_string())?
            .ok_or_else(|| ChatError::NotFound(format!("user {} not found", recipient)))?;

        let (conversation_id, _created) = self.db.find_or_create_conversation(
            &Uuid::new_v4().to_string(),
            &sender.to_string(),
            &recipient.to_string(),
        )?;

        let row = self.db.append_message(
            &Uuid::new_v4().to_string(),
            &conversation_id,
            &sender.to_string(),
            content,
        )?;
        let message = row.into_message(vec![]);

        let plan = NotificationPlan::room(
            message.conversation_id,
            GatewayEvent::MessageNew {
                message: message.clone(),
            },
        )
        .with_direct(
            recipient,
            GatewayEvent::ConversationUpdate {
                conversation_id: message.conversation_id,
                message: message.clone(),
            },
        );

        Ok((message, plan))
    }

    /// Edit a message in place. Only the original sender may edit.
    pub fn edit_message(
        &self,
        actor: Uuid,
        message_id: Uuid,
        content: &str,
    ) -> Result<(Message, NotificationPlan)> {
        let content = validate_content(content)?;

        let row = self
            .db
            .edit_message(&message_id.to_string(), &actor.to_string(), content)?;

        // Reactions survive an edit; carry the current set in the event.
        let reactions = self.db.get_reactions_for_messages(&[row.id.clone()])?;
        let groups = group_reactions(reactions).remove(&row.id).unwrap_or_default();
        let message = row.into_message(groups);

        let plan = NotificationPlan::room(
            message.conversation_id,
            GatewayEvent::MessageEdited {
                message: message.clone(),
            },
        );

        Ok((message, plan))
    }

    /// Hard-delete a message. Any participant may delete. Returns the
    /// conversation the message belonged to.
    pub fn delete_message(&self, actor: Uuid, message_id: Uuid) -> Result<(Uuid, NotificationPlan)> {
        let conversation_id = self
            .db
            .delete_message(&message_id.to_string(), &actor.to_string())?;
        let conversation_id = parse_uuid(&conversation_id, "conversation id");

        let plan = NotificationPlan::room(
            conversation_id,
            GatewayEvent::MessageDeleted {
                conversation_id,
                message_id,
            },
        );

        Ok((conversation_id, plan))
    }

    /// Toggle an emoji reaction on a message.
    pub fn toggle_reaction(
        &self,
        actor: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> Result<(ReactionAction, NotificationPlan)> {
        if emoji.trim().is_empty() {
            return Err(ChatError::Validation("emoji must not be empty".into()));
        }

        let (added, conversation_id) = self.db.toggle_reaction(
            &Uuid::new_v4().to_string(),
            &message_id.to_string(),
            &actor.to_string(),
            emoji,
        )?;
        let conversation_id = parse_uuid(&conversation_id, "conversation id");

        let action = if added {
            ReactionAction::Added
        } else {
            ReactionAction::Removed
        };

        let plan = NotificationPlan::room(
            conversation_id,
            GatewayEvent::MessageReaction {
                conversation_id,
                message_id,
                user_id: actor,
                emoji: emoji.to_string(),
                action,
            },
        );

        Ok((action, plan))
    }

    /// Delete-for-everyone. Notifies each participant directly rather
    /// than through the room, since the room itself is being torn down.
    pub fn delete_conversation(&self, actor: Uuid, conversation_id: Uuid) -> Result<NotificationPlan> {
        let participants = self
            .db
            .delete_conversation(&conversation_id.to_string(), &actor.to_string())?;

        let mut plan = NotificationPlan::default();
        for participant in &participants {
            plan = plan.with_direct(
                parse_uuid(participant, "participant id"),
                GatewayEvent::ConversationDeleted { conversation_id },
            );
        }

        Ok(plan)
    }

    /// Room admission check for the gateway.
    pub fn assert_participant(&self, actor: Uuid, conversation_id: Uuid) -> Result<()> {
        self.db
            .assert_participant(&conversation_id.to_string(), &actor.to_string())
    }

    /// Stamped on gateway disconnect.
    pub fn touch_last_seen(&self, user_id: Uuid) -> Result<()> {
        self.db.touch_last_seen(&user_id.to_string())
    }
}

/// Group raw reaction rows by message id, then by emoji: the shape both
/// REST message pages and gateway events serve.
pub fn group_reactions(rows: Vec<ReactionRow>) -> HashMap<String, Vec<ReactionGroup>> {
    let mut by_message: HashMap<String, HashMap<String, Vec<Uuid>>> = HashMap::new();
    for row in &rows {
        let emoji_map = by_message.entry(row.message_id.clone()).or_default();
        let user_ids = emoji_map.entry(row.emoji.clone()).or_default();
        if let Ok(uid) = row.user_id.parse::<Uuid>() {
            user_ids.push(uid);
        }
    }

    by_message
        .into_iter()
        .map(|(message_id, emoji_map)| {
            let groups = emoji_map
                .into_iter()
                .map(|(emoji, user_ids)| ReactionGroup {
                    emoji,
                    count: user_ids.len(),
                    user_ids,
                })
                .collect();
            (message_id, groups)
        })
        .collect()
}

fn validate_content(content: &str) -> Result<&str> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ChatError::Validation(
            "message content must not be empty".into(),
        ));
    }
    if trimmed.chars().count() > MAX_MESSAGE_LEN {
        return Err(ChatError::Validation(format!(
            "message content exceeds {} characters",
            MAX_MESSAGE_LEN
        )));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_users() -> (ChatService, Uuid, Uuid, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let carol = Uuid::new_v4();
        db.create_user(&alice.to_string(), "alice", "alice@example.com", "hash")
            .unwrap();
        db.create_user(&bob.to_string(), "bob", "bob@example.com", "hash")
            .unwrap();
        db.create_user(&carol.to_string(), "carol", "carol@example.com", "hash")
            .unwrap();
        (ChatService::new(db), alice, bob, carol)
    }

    #[test]
    fn first_send_creates_conversation_and_plans_both_notifications() {
        let (svc, alice, bob, _) = service_with_users();

        let (message, plan) = svc.send_message(alice, bob, "hello").unwrap();
        assert_eq!(message.content, "hello");
        assert_eq!(message.sender_id, alice);
        assert!(!message.is_edited);

        let room = plan.room.expect("send plans a room broadcast");
        assert_eq!(room.conversation_id, message.conversation_id);
        assert!(matches!(room.event, GatewayEvent::MessageNew { .. }));

        assert_eq!(plan.direct.len(), 1);
        assert_eq!(plan.direct[0].user_id, bob);
        assert!(matches!(
            plan.direct[0].event,
            GatewayEvent::ConversationUpdate { .. }
        ));
    }

    #[test]
    fn send_reuses_the_conversation_for_the_pair() {
        let (svc, alice, bob, _) = service_with_users();

        let (first, _) = svc.send_message(alice, bob, "hello").unwrap();
        let (reply, _) = svc.send_message(bob, alice, "hi back").unwrap();
        assert_eq!(first.conversation_id, reply.conversation_id);
    }

    #[test]
    fn send_to_self_is_rejected() {
        let (svc, alice, _, _) = service_with_users();
        let err = svc.send_message(alice, alice, "hi me").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn send_to_unknown_recipient_is_not_found() {
        let (svc, alice, _, _) = service_with_users();
        let err = svc.send_message(alice, Uuid::new_v4(), "hi").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn empty_and_oversized_content_are_rejected() {
        let (svc, alice, bob, _) = service_with_users();

        let err = svc.send_message(alice, bob, "   ").unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let oversized = "x".repeat(MAX_MESSAGE_LEN + 1);
        let err = svc.send_message(alice, bob, &oversized).unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[test]
    fn edit_marks_message_edited_and_plans_room_event() {
        let (svc, alice, bob, _) = service_with_users();
        let (message, _) = svc.send_message(alice, bob, "hello").unwrap();

        let (edited, plan) = svc.edit_message(alice, message.id, "hello there").unwrap();
        assert_eq!(edited.content, "hello there");
        assert!(edited.is_edited);

        let room = plan.room.expect("edit plans a room broadcast");
        match room.event {
            GatewayEvent::MessageEdited { message } => {
                assert_eq!(message.content, "hello there");
                assert!(message.is_edited);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn edit_by_non_sender_is_forbidden() {
        let (svc, alice, bob, _) = service_with_users();
        let (message, _) = svc.send_message(alice, bob, "hello").unwrap();

        let err = svc.edit_message(bob, message.id, "hijacked").unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }

    #[test]
    fn reaction_toggles_between_added_and_removed() {
        let (svc, alice, bob, _) = service_with_users();
        let (message, _) = svc.send_message(alice, bob, "hello").unwrap();

        let (action, plan) = svc.toggle_reaction(alice, message.id, "👍").unwrap();
        assert_eq!(action, ReactionAction::Added);
        assert!(plan.room.is_some());

        let (action, _) = svc.toggle_reaction(alice, message.id, "👍").unwrap();
        assert_eq!(action, ReactionAction::Removed);
    }

    #[test]
    fn delete_message_plans_room_event_with_ids() {
        let (svc, alice, bob, _) = service_with_users();
        let (message, _) = svc.send_message(alice, bob, "hello").unwrap();

        let (conversation_id, plan) = svc.delete_message(bob, message.id).unwrap();
        assert_eq!(conversation_id, message.conversation_id);

        let room = plan.room.unwrap();
        match room.event {
            GatewayEvent::MessageDeleted {
                message_id,
                conversation_id: conv,
            } => {
                assert_eq!(message_id, message.id);
                assert_eq!(conv, conversation_id);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn delete_conversation_notifies_each_participant_directly() {
        let (svc, alice, bob, _) = service_with_users();
        let (message, _) = svc.send_message(alice, bob, "hello").unwrap();
        let conversation_id = message.conversation_id;

        let plan = svc.delete_conversation(bob, conversation_id).unwrap();
        assert!(plan.room.is_none());

        let mut notified: Vec<Uuid> = plan.direct.iter().map(|d| d.user_id).collect();
        notified.sort();
        let mut expected = vec![alice, bob];
        expected.sort();
        assert_eq!(notified, expected);

        // The old id is gone; the next send transparently starts fresh.
        let err = svc.delete_conversation(alice, conversation_id).unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        let (fresh, _) = svc.send_message(alice, bob, "hello again").unwrap();
        assert_ne!(fresh.conversation_id, conversation_id);
    }

    #[test]
    fn room_admission_follows_membership() {
        let (svc, alice, bob, carol) = service_with_users();
        let (message, _) = svc.send_message(alice, bob, "hello").unwrap();

        svc.assert_participant(bob, message.conversation_id).unwrap();
        let err = svc
            .assert_participant(carol, message.conversation_id)
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
    }
}
