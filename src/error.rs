use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Failure taxonomy for the relay. `status` drives the HTTP mapping whenever a
/// handler lets one of these escape.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Validation(&'static str),

    #[error("Telegram Error: {0}")]
    Relay(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl ChatError {
    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Relay(_) => StatusCode::BAD_GATEWAY,
            ChatError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_error_carries_provider_description() {
        let err = ChatError::Relay("chat not found".to_string());
        assert_eq!(err.to_string(), "Telegram Error: chat not found");
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let err = ChatError::Validation("message content is required");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "message content is required");
    }

    #[test]
    fn store_errors_map_to_internal_error() {
        let err = ChatError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
