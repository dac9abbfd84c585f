use std::collections::HashMap;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use murmur_types::events::GatewayEvent;

/// Live mapping of authenticated user -> active connection. Process
/// lifetime, rebuilt from nothing on restart; it only reflects currently
/// connected sessions. Lock critical sections are insert/remove/lookup
/// only; no work is done while held.
pub struct PresenceRegistry {
    entries: RwLock<HashMap<Uuid, Entry>>,
}

struct Entry {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection's targeted channel. Replaces any prior entry
    /// for the user: one active session per user, and a second connection
    /// silently supersedes the first's registry entry without forcibly
    /// disconnecting it. Returns the connection id.
    pub async fn register(&self, user_id: Uuid, tx: mpsc::UnboundedSender<GatewayEvent>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.entries
            .write()
            .await
            .insert(user_id, Entry { conn_id, tx });
        conn_id
    }

    /// Remove the entry only if it still maps to the given connection, so
    /// a stale disconnect cannot evict a newer session. Returns whether
    /// the entry was removed.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(&user_id) {
            Some(entry) if entry.conn_id == conn_id => {
                entries.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Send a targeted event to a user's active connection, silently
    /// skipped if the user is not online.
    pub async fn send_to(&self, user_id: Uuid, event: GatewayEvent) {
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(&user_id) {
            let _ = entry.tx.send(event);
        }
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        self.entries.read().await.keys().copied().collect()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_registration_supersedes_the_first() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let _conn1 = registry.register(user, tx1).await;

        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let _conn2 = registry.register(user, tx2).await;

        registry
            .send_to(user, GatewayEvent::UserOnline { user_id: user })
            .await;

        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn stale_unregister_does_not_evict_newer_session() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let conn1 = registry.register(user, tx1).await;

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let _conn2 = registry.register(user, tx2).await;

        // The first connection's disconnect fires after it was superseded.
        assert!(!registry.unregister(user, conn1).await);
        assert_eq!(registry.online_users().await, vec![user]);
    }

    #[tokio::test]
    async fn current_unregister_removes_the_entry() {
        let registry = PresenceRegistry::new();
        let user = Uuid::new_v4();

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = registry.register(user, tx).await;

        assert!(registry.unregister(user, conn).await);
        assert!(registry.online_users().await.is_empty());
    }
}
