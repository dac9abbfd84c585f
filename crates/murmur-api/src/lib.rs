pub mod auth;
pub mod conversations;
pub mod error;
pub mod middleware;
pub mod posts;
pub mod users;

use murmur_chat::ChatError;

use crate::error::ApiError;

/// Run a blocking store call off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ChatError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ChatError::Storage(format!("blocking task failed: {}", e)))?;
    result.map_err(ApiError)
}
