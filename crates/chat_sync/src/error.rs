//! Error taxonomy for the sync engine.
//!
//! Every failure that crosses a transport boundary is classified into one of
//! these variants before it reaches the engine loop; the engine turns them
//! into supervisor transitions or `ClientEvent::Error` values.

use shared::error::{ApiError, ErrorCode};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),
    #[error("session expired, re-authentication required: {0}")]
    AuthExpired(String),
    #[error("conversation not found: {0}")]
    RoomNotFound(String),
    #[error("invalid record: {0}")]
    Validation(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("sync engine is no longer running")]
    EngineClosed,
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::AuthExpired(_))
    }

    pub fn from_api_error(err: &ApiError) -> Self {
        match err.code {
            ErrorCode::Unauthorized | ErrorCode::Forbidden => {
                Self::AuthExpired(err.message.clone())
            }
            ErrorCode::NotFound => Self::RoomNotFound(err.message.clone()),
            ErrorCode::Validation => Self::Validation(err.message.clone()),
            ErrorCode::RateLimited | ErrorCode::Unavailable | ErrorCode::Internal => {
                Self::TransientNetwork(err.to_string())
            }
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let api_error = serde_json::from_str::<ApiError>(body)
            .unwrap_or_else(|_| ApiError::from_status(status, format!("HTTP {status}: {body}")));
        Self::from_api_error(&api_error)
    }

    /// Classifies an error chain produced inside a transport implementation.
    pub fn classify(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(sync) = cause.downcast_ref::<SyncError>() {
                return sync.clone();
            }
            if let Some(api) = cause.downcast_ref::<ApiError>() {
                return Self::from_api_error(api);
            }
            if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
                if let Some(status) = http.status() {
                    return Self::from_status(status.as_u16(), &http.to_string());
                }
                if http.is_decode() {
                    return Self::Validation(format!("{err:#}"));
                }
                return Self::TransientNetwork(format!("{err:#}"));
            }
            if let Some(ws) = cause.downcast_ref::<WsError>() {
                return Self::from_ws_error(ws, err);
            }
            if cause.downcast_ref::<serde_json::Error>().is_some() {
                return Self::Validation(format!("{err:#}"));
            }
        }
        Self::from_message(&format!("{err:#}"))
    }

    fn from_ws_error(ws: &WsError, err: &anyhow::Error) -> Self {
        match ws {
            // The upgrade was refused with a real HTTP response.
            WsError::Http(response) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default();
                Self::from_status(response.status().as_u16(), &body)
            }
            WsError::Url(_) => Self::Config(format!("{err:#}")),
            WsError::Utf8 => Self::Validation(format!("{err:#}")),
            _ => Self::TransientNetwork(format!("{err:#}")),
        }
    }

    /// Last resort for errors of unknown type. Only whole phrases count;
    /// status codes are read from typed errors above.
    fn from_message(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("unauthorized") || lower.contains("session expired") {
            Self::AuthExpired(message.to_string())
        } else if lower.contains("conversation not found") {
            Self::RoomNotFound(message.to_string())
        } else {
            Self::TransientNetwork(message.to_string())
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(value: ApiError) -> Self {
        Self::from_api_error(&value)
    }
}

#[cfg(test)]
#[path = "tests/error_tests.rs"]
mod tests;
