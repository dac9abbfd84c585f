use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use murmur_chat::NotificationPlan;
use murmur_types::events::GatewayEvent;

use crate::presence::PresenceRegistry;

/// One fan-out unit on the broadcast channel. Every connection receives
/// the stream; room-scoped events (per `GatewayEvent::room_scope`) are
/// filtered per-connection against the rooms that connection has joined,
/// and `exclude_user` drops the event for one user (typing indicators
/// never echo to the typist).
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub exclude_user: Option<Uuid>,
    pub event: GatewayEvent,
}

/// Manages all connected clients and fans out events: a broadcast channel
/// every connection subscribes to, plus per-user targeted channels owned
/// by the presence registry.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<Broadcast>,
    presence: PresenceRegistry,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                presence: PresenceRegistry::new(),
            }),
        }
    }

    /// Subscribe to the broadcast stream. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Put an event on the broadcast stream. Globally-scoped events reach
    /// every connection; room-scoped events reach the connections joined
    /// to their room.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(Broadcast {
            exclude_user: None,
            event,
        });
    }

    /// Broadcast that skips one user, used for typing indicators.
    pub fn broadcast_excluding(&self, exclude_user: Uuid, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(Broadcast {
            exclude_user: Some(exclude_user),
            event,
        });
    }

    /// Register a connection's targeted channel with the presence
    /// registry. Returns the connection id used to guard unregistration.
    pub async fn register_connection(
        &self,
        user_id: Uuid,
        tx: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Uuid {
        self.inner.presence.register(user_id, tx).await
    }

    /// Tear down a connection. Only the still-current session is removed
    /// from the registry and announced offline; a superseded socket
    /// closing later is a no-op. Returns whether this connection was
    /// still current.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let was_current = self.inner.presence.unregister(user_id, conn_id).await;
        if was_current {
            self.broadcast(GatewayEvent::UserOffline { user_id });
        }
        was_current
    }

    /// Send a targeted event to a specific user, if connected.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        self.inner.presence.send_to(user_id, event).await;
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.presence.online_users().await
    }

    /// Resolve a service notification plan: the room part goes out on the
    /// broadcast channel, direct parts through the presence registry.
    pub async fn deliver(&self, plan: NotificationPlan) {
        if let Some(room) = plan.room {
            // The event must declare the scope the plan promised.
            debug_assert_eq!(room.event.room_scope(), Some(room.conversation_id));
            self.broadcast(room.event);
        }
        for direct in plan.direct {
            self.send_to_user(direct.user_id, direct.event).await;
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deliver_broadcasts_the_room_event() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let conversation = Uuid::new_v4();

        let plan = NotificationPlan::room(
            conversation,
            GatewayEvent::MessageDeleted {
                conversation_id: conversation,
                message_id: Uuid::new_v4(),
            },
        );
        dispatcher.deliver(plan).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event.room_scope(), Some(conversation));
        assert!(received.exclude_user.is_none());
    }

    #[tokio::test]
    async fn excluded_user_is_marked_on_the_broadcast() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();
        let typist = Uuid::new_v4();
        let conversation = Uuid::new_v4();

        dispatcher.broadcast_excluding(
            typist,
            GatewayEvent::TypingStart {
                conversation_id: conversation,
                user_id: typist,
            },
        );

        let received = rx.recv().await.unwrap();
        assert_eq!(received.exclude_user, Some(typist));
        assert_eq!(received.event.room_scope(), Some(conversation));
    }

    #[tokio::test]
    async fn deliver_routes_direct_notifications_through_presence() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let conversation = Uuid::new_v4();

        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register_connection(user, tx).await;

        let plan = NotificationPlan::default().with_direct(
            user,
            GatewayEvent::ConversationDeleted {
                conversation_id: conversation,
            },
        );
        dispatcher.deliver(plan).await;

        match rx.try_recv().unwrap() {
            GatewayEvent::ConversationDeleted { conversation_id } => {
                assert_eq!(conversation_id, conversation);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn deliver_skips_absent_recipients() {
        let dispatcher = Dispatcher::new();
        let plan = NotificationPlan::default().with_direct(
            Uuid::new_v4(),
            GatewayEvent::ConversationDeleted {
                conversation_id: Uuid::new_v4(),
            },
        );
        // Nothing registered, so delivery is a silent no-op.
        dispatcher.deliver(plan).await;
    }
}
