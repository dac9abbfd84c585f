use uuid::Uuid;

use murmur_types::events::GatewayEvent;

/// The outbound events one service operation produced. The service only
/// enumerates recipients; the gateway resolves them against live
/// connections and rooms. Failed operations never produce a plan.
#[derive(Debug, Default)]
pub struct NotificationPlan {
    /// Broadcast to every connection joined to the conversation's room.
    pub room: Option<RoomBroadcast>,
    /// Targeted events, delivered through the presence registry and
    /// silently skipped for users who are not connected.
    pub direct: Vec<DirectNotify>,
}

#[derive(Debug)]
pub struct RoomBroadcast {
    pub conversation_id: Uuid,
    pub event: GatewayEvent,
}

#[derive(Debug)]
pub struct DirectNotify {
    pub user_id: Uuid,
    pub event: GatewayEvent,
}

impl NotificationPlan {
    pub fn room(conversation_id: Uuid, event: GatewayEvent) -> Self {
        Self {
            room: Some(RoomBroadcast {
                conversation_id,
                event,
            }),
            direct: Vec::new(),
        }
    }

    pub fn with_direct(mut self, user_id: Uuid, event: GatewayEvent) -> Self {
        self.direct.push(DirectNotify { user_id, event });
        self
    }
}
