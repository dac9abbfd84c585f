use thiserror::Error;

pub type Result<T> = std::result::Result<T, ChatError>;

/// Error taxonomy shared by the store, the messaging service, and both
/// transports. REST maps these to status codes (400/404/403/401); the
/// gateway maps them to acknowledgment failures. `Storage` covers SQLite
/// faults and lock poisoning and surfaces as a 500.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for ChatError {
    fn from(e: rusqlite::Error) -> Self {
        ChatError::Storage(e.to_string())
    }
}
