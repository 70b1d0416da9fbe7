use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;
use vault_coordination::chatroom::ChatroomError;
use vault_coordination::council::CouncilError;
use vault_coordination::kv::KvError;
use vault_coordination::trading::TradingError;

/// Handler failure, rendered as `{"error": ..}` with a matching status.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<KvError> for ApiError {
    fn from(e: KvError) -> Self {
        Self::Internal(format!("store error: {e}"))
    }
}

impl From<ChatroomError> for ApiError {
    fn from(e: ChatroomError) -> Self {
        match e {
            ChatroomError::NoMessages => Self::BadRequest("No missed messages found".to_string()),
            ChatroomError::ModelUnavailable => {
                Self::Unavailable("Failed to generate summary: AI model unavailable".to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<CouncilError> for ApiError {
    fn from(e: CouncilError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<TradingError> for ApiError {
    fn from(e: TradingError) -> Self {
        match e {
            TradingError::NotFound(_) => Self::NotFound(e.to_string()),
            TradingError::AlreadyClosed(_) => Self::Conflict(e.to_string()),
            TradingError::ThresholdNotMet => Self::BadRequest(e.to_string()),
            TradingError::Market(_) => Self::Unavailable(e.to_string()),
            TradingError::Store(_) => Self::Internal(e.to_string()),
        }
    }
}
