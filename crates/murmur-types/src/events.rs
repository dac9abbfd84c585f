use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Message, Post};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    #[serde(rename = "ready")]
    Ready { user_id: Uuid, username: String },

    /// Response to an inbound frame that carried an `ack` correlation id.
    /// Exactly one ack is emitted per correlated frame, on success and on
    /// every error path.
    #[serde(rename = "ack")]
    Ack {
        ack: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A new message was posted to a conversation (room-scoped)
    #[serde(rename = "message:new")]
    MessageNew { message: Message },

    /// A message was edited in place (room-scoped)
    #[serde(rename = "message:edited")]
    MessageEdited { message: Message },

    /// A message was removed (room-scoped)
    #[serde(rename = "message:deleted")]
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    /// A reaction was toggled on a message (room-scoped)
    #[serde(rename = "message:reaction")]
    MessageReaction {
        conversation_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
        action: ReactionAction,
    },

    /// Targeted: tells a recipient their conversation list changed,
    /// even if they never joined the room.
    #[serde(rename = "conversation:update")]
    ConversationUpdate {
        conversation_id: Uuid,
        message: Message,
    },

    /// Targeted per participant: the conversation was deleted for everyone.
    #[serde(rename = "conversation:deleted")]
    ConversationDeleted { conversation_id: Uuid },

    /// A user started typing (room-scoped, excludes the typist)
    #[serde(rename = "typing:start")]
    TypingStart {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    /// A user stopped typing (room-scoped, excludes the typist)
    #[serde(rename = "typing:stop")]
    TypingStop {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    /// A user came online (broadcast to all connections)
    #[serde(rename = "user:online")]
    UserOnline { user_id: Uuid },

    /// A user went offline (broadcast to all connections)
    #[serde(rename = "user:offline")]
    UserOffline { user_id: Uuid },

    /// Feed broadcasts, delivered to every connected client.
    #[serde(rename = "post:new")]
    PostNew { post: Post },

    #[serde(rename = "post:liked")]
    PostLiked {
        post_id: Uuid,
        user_id: Uuid,
        liked: bool,
    },

    #[serde(rename = "post:removed")]
    PostRemoved { post_id: Uuid },
}

impl GatewayEvent {
    /// Returns the conversation id if this event is scoped to a room.
    /// Room-scoped events are only delivered to connections that have
    /// joined that conversation's room; everything else is either global
    /// or sent over a targeted per-user channel.
    pub fn room_scope(&self) -> Option<Uuid> {
        match self {
            Self::MessageNew { message } | Self::MessageEdited { message } => {
                Some(message.conversation_id)
            }
            Self::MessageDeleted {
                conversation_id, ..
            }
            | Self::MessageReaction {
                conversation_id, ..
            }
            | Self::TypingStart {
                conversation_id, ..
            }
            | Self::TypingStop {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Added,
    Removed,
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientCommand {
    /// Join a conversation's room to receive its live events
    #[serde(rename = "conversation:join")]
    ConversationJoin { conversation_id: Uuid },

    /// Leave a conversation's room
    #[serde(rename = "conversation:leave")]
    ConversationLeave { conversation_id: Uuid },

    /// Send a message to another user. The conversation is created
    /// lazily on first contact.
    #[serde(rename = "message:send")]
    MessageSend { recipient_id: Uuid, content: String },

    /// Edit one of your own messages
    #[serde(rename = "message:edit")]
    MessageEdit { message_id: Uuid, content: String },

    /// Delete a message from a conversation you participate in
    #[serde(rename = "message:delete")]
    MessageDelete { message_id: Uuid },

    /// Toggle an emoji reaction on a message
    #[serde(rename = "message:react")]
    MessageReact { message_id: Uuid, emoji: String },

    /// Delete a conversation for everyone
    #[serde(rename = "conversation:delete")]
    ConversationDelete { conversation_id: Uuid },

    /// Typing indicators, fire and forget
    #[serde(rename = "typing:start")]
    TypingStart { conversation_id: Uuid },

    #[serde(rename = "typing:stop")]
    TypingStop { conversation_id: Uuid },
}

/// One inbound frame: a command plus an optional acknowledgment
/// correlation id. Frames with an `ack` id always get exactly one
/// `ack` event back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(flatten)]
    pub command: ClientCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_parses_with_ack() {
        let raw = r#"{"type":"message:send","data":{"recipient_id":"6a2f40de-61c1-4519-b9c6-a6bb8f1e50cf","content":"hi"},"ack":7}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.ack, Some(7));
        match frame.command {
            ClientCommand::MessageSend { content, .. } => assert_eq!(content, "hi"),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn frame_parses_without_ack() {
        let raw = r#"{"type":"typing:start","data":{"conversation_id":"6a2f40de-61c1-4519-b9c6-a6bb8f1e50cf"}}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        assert!(frame.ack.is_none());
    }

    #[test]
    fn event_names_use_colon_form_on_the_wire() {
        let event = GatewayEvent::UserOnline {
            user_id: Uuid::nil(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"user:online""#));
    }

    #[test]
    fn room_scope_covers_room_events_only() {
        let id = Uuid::new_v4();
        let typing = GatewayEvent::TypingStart {
            conversation_id: id,
            user_id: Uuid::new_v4(),
        };
        assert_eq!(typing.room_scope(), Some(id));

        let deleted = GatewayEvent::ConversationDeleted {
            conversation_id: id,
        };
        assert_eq!(deleted.room_scope(), None);
    }
}
