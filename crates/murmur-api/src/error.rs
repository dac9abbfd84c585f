use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use murmur_chat::ChatError;

/// Uniform REST error envelope: the typed taxonomy maps to fixed status
/// codes with a `{"error": message}` body. Storage faults are logged and
/// masked as a plain 500.
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            ChatError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ChatError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ChatError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
            ChatError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            ChatError::Storage(m) => {
                error!("storage failure: {}", m);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_fixed_status_codes() {
        let cases = [
            (ChatError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ChatError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ChatError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ChatError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
            (
                ChatError::Storage("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
