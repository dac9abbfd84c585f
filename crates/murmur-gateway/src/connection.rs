use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use murmur_chat::{ChatError, ChatService};
use murmur_types::events::{ClientCommand, ClientFrame, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Handle a pre-authenticated WebSocket connection. The token was already
/// validated at the HTTP upgrade layer, so the connection goes straight to
/// Ready + the event loop; unauthenticated sockets never reach this point.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    chat: ChatService,
    user_id: Uuid,
    username: String,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    // Register the targeted channel; the recv task keeps a sender handle
    // for acknowledgments.
    let (user_tx, mut user_rx) = mpsc::unbounded_channel();
    let conn_id = dispatcher.register_connection(user_id, user_tx.clone()).await;

    // Subscribe before announcing ourselves so no presence change is lost
    // between the snapshot and the event loop.
    let mut broadcast_rx = dispatcher.subscribe();

    // Send existing online users to this client so they see who's already
    // here, then announce this user to everyone else.
    let mut snapshot_ok = true;
    for uid in dispatcher.online_users().await {
        if uid == user_id {
            continue;
        }
        let event = GatewayEvent::UserOnline { user_id: uid };
        if sender
            .send(Message::Text(serde_json::to_string(&event).unwrap().into()))
            .await
            .is_err()
        {
            snapshot_ok = false;
            break;
        }
    }

    if snapshot_ok {
        dispatcher.broadcast_excluding(user_id, GatewayEvent::UserOnline { user_id });

        // Rooms this connection has joined (shared between send and recv
        // tasks).
        let joined_rooms: Arc<std::sync::RwLock<HashSet<Uuid>>> =
            Arc::new(std::sync::RwLock::new(HashSet::new()));
        let send_rooms = joined_rooms.clone();

        // Shared flag for heartbeat
        let pong_received = Arc::new(AtomicBool::new(true));
        let pong_flag_send = pong_received.clone();
        let pong_flag_recv = pong_received.clone();

        // Forward broadcasts + targeted events -> client, with heartbeat.
        // Targeted events (acks, conversation:update/deleted) bypass room
        // filtering entirely.
        let mut send_task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            let mut missed_heartbeats: u8 = 0;

            loop {
                tokio::select! {
                    result = broadcast_rx.recv() => {
                        let msg = match result {
                            Ok(msg) => msg,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!("Broadcast receiver lagged by {} messages", n);
                                continue;
                            }
                            Err(_) => break,
                        };

                        if msg.exclude_user == Some(user_id) {
                            continue;
                        }
                        if let Some(room) = msg.event.room_scope() {
                            let joined = send_rooms.read().expect("room lock poisoned");
                            if !joined.contains(&room) {
                                continue;
                            }
                        }

                        let text = serde_json::to_string(&msg.event).unwrap();
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    result = user_rx.recv() => {
                        let event = match result {
                            Some(event) => event,
                            None => break,
                        };
                        let text = serde_json::to_string(&event).unwrap();
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if pong_flag_send.swap(false, Ordering::Acquire) {
                            missed_heartbeats = 0;
                        } else {
                            missed_heartbeats += 1;
                            if missed_heartbeats >= 2 {
                                warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                                break;
                            }
                        }
                        if sender.send(Message::Ping(vec![].into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        // Read frames from the client, one at a time. Per-connection
        // ordering is preserved because each frame is handled to
        // completion before the next is read.
        let recv_dispatcher = dispatcher.clone();
        let recv_chat = chat.clone();
        let recv_rooms = joined_rooms.clone();
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(msg)) = receiver.next().await {
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                        Ok(frame) => {
                            handle_frame(
                                &recv_dispatcher,
                                &recv_chat,
                                user_id,
                                &recv_rooms,
                                &user_tx,
                                frame,
                            )
                            .await;
                        }
                        Err(e) => {
                            warn!(
                                "{} bad frame: {} -- raw: {}",
                                user_id,
                                e,
                                &text[..text.len().min(200)]
                            );
                            // Even a malformed frame gets its ack resolved
                            // if we can still dig out the correlation id.
                            if let Some(ack) = extract_ack_id(&text) {
                                let _ = user_tx.send(GatewayEvent::Ack {
                                    ack,
                                    success: false,
                                    data: None,
                                    error: Some("malformed frame".into()),
                                });
                            }
                        }
                    },
                    Message::Pong(_) => {
                        pong_flag_recv.store(true, Ordering::Release);
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        });

        // Wait for either task to finish
        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }
    }

    if dispatcher.disconnect(user_id, conn_id).await {
        let svc = chat.clone();
        let stamped = blocking(move || svc.touch_last_seen(user_id)).await;
        if let Err(e) = stamped {
            warn!("last-seen update failed for {}: {}", user_id, e);
        }
    }
    info!("{} ({}) disconnected from gateway", username, user_id);
}

/// Dispatch one client frame. Every command that carried an `ack` id gets
/// exactly one ack event back, success or failure, and no error escapes
/// to the transport.
async fn handle_frame(
    dispatcher: &Dispatcher,
    chat: &ChatService,
    user_id: Uuid,
    joined_rooms: &Arc<std::sync::RwLock<HashSet<Uuid>>>,
    ack_tx: &mpsc::UnboundedSender<GatewayEvent>,
    frame: ClientFrame,
) {
    let ack_id = frame.ack;
    let result = run_command(dispatcher, chat, user_id, joined_rooms, frame.command).await;

    if let Some(ack) = ack_id {
        let event = match result {
            Ok(data) => GatewayEvent::Ack {
                ack,
                success: true,
                data,
                error: None,
            },
            Err(e) => GatewayEvent::Ack {
                ack,
                success: false,
                data: None,
                error: Some(e.to_string()),
            },
        };
        let _ = ack_tx.send(event);
    }
}

async fn run_command(
    dispatcher: &Dispatcher,
    chat: &ChatService,
    user_id: Uuid,
    joined_rooms: &Arc<std::sync::RwLock<HashSet<Uuid>>>,
    command: ClientCommand,
) -> Result<Option<serde_json::Value>, ChatError> {
    match command {
        ClientCommand::ConversationJoin { conversation_id } => {
            let svc = chat.clone();
            blocking(move || svc.assert_participant(user_id, conversation_id)).await?;
            joined_rooms
                .write()
                .expect("room lock poisoned")
                .insert(conversation_id);
            Ok(None)
        }

        ClientCommand::ConversationLeave { conversation_id } => {
            joined_rooms
                .write()
                .expect("room lock poisoned")
                .remove(&conversation_id);
            Ok(None)
        }

        ClientCommand::MessageSend {
            recipient_id,
            content,
        } => {
            let svc = chat.clone();
            let (message, plan) =
                blocking(move || svc.send_message(user_id, recipient_id, &content)).await?;
            dispatcher.deliver(plan).await;
            Ok(Some(serde_json::to_value(&message).unwrap_or_default()))
        }

        ClientCommand::MessageEdit {
            message_id,
            content,
        } => {
            let svc = chat.clone();
            let (message, plan) =
                blocking(move || svc.edit_message(user_id, message_id, &content)).await?;
            dispatcher.deliver(plan).await;
            Ok(Some(serde_json::to_value(&message).unwrap_or_default()))
        }

        ClientCommand::MessageDelete { message_id } => {
            let svc = chat.clone();
            let (conversation_id, plan) =
                blocking(move || svc.delete_message(user_id, message_id)).await?;
            dispatcher.deliver(plan).await;
            Ok(Some(serde_json::json!({
                "message_id": message_id,
                "conversation_id": conversation_id,
            })))
        }

        ClientCommand::MessageReact { message_id, emoji } => {
            let svc = chat.clone();
            let emoji_arg = emoji.clone();
            let (action, plan) =
                blocking(move || svc.toggle_reaction(user_id, message_id, &emoji_arg)).await?;
            dispatcher.deliver(plan).await;
            Ok(Some(serde_json::json!({
                "message_id": message_id,
                "emoji": emoji,
                "action": action,
            })))
        }

        ClientCommand::ConversationDelete { conversation_id } => {
            let svc = chat.clone();
            let plan =
                blocking(move || svc.delete_conversation(user_id, conversation_id)).await?;
            dispatcher.deliver(plan).await;
            Ok(Some(serde_json::json!({
                "conversation_id": conversation_id,
            })))
        }

        // Typing indicators are transient and unvalidated: no persistence,
        // no ordering guarantee beyond in-order delivery per connection.
        ClientCommand::TypingStart { conversation_id } => {
            dispatcher.broadcast_excluding(
                user_id,
                GatewayEvent::TypingStart {
                    conversation_id,
                    user_id,
                },
            );
            Ok(None)
        }

        ClientCommand::TypingStop { conversation_id } => {
            dispatcher.broadcast_excluding(
                user_id,
                GatewayEvent::TypingStop {
                    conversation_id,
                    user_id,
                },
            );
            Ok(None)
        }
    }
}

/// Run a blocking service call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ChatError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ChatError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Storage(format!("blocking task failed: {}", e)))?
}

/// Best-effort recovery of the `ack` field from a frame that failed to
/// parse as a command.
fn extract_ack_id(raw: &str) -> Option<u64> {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()?
        .get("ack")?
        .as_u64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_id_survives_malformed_commands() {
        let raw = r#"{"type":"message:send","data":{"recipient_id":"not-a-uuid"},"ack":42}"#;
        assert!(serde_json::from_str::<ClientFrame>(raw).is_err());
        assert_eq!(extract_ack_id(raw), Some(42));
    }

    #[test]
    fn no_ack_id_in_garbage() {
        assert_eq!(extract_ack_id("not json at all"), None);
        assert_eq!(extract_ack_id(r#"{"type":"x"}"#), None);
    }
}
