pub mod plan;
pub mod service;

pub use murmur_db::error::{ChatError, Result};
pub use plan::{DirectNotify, NotificationPlan, RoomBroadcast};
pub use service::{ChatService, MAX_MESSAGE_LEN, group_reactions};
