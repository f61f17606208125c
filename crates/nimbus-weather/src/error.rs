//! Weather cache error types.

use nimbus_core::error::{ReqwestErrorExt, RusqliteErrorExt};
use nimbus_core::{AppError, NetworkError, WeatherError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("304 Not Modified for {0} but no cached snapshot exists")]
    NotModifiedWithoutSnapshot(String),

    #[error("Response body is not a valid forecast: {0}")]
    MalformedBody(serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    /// User-friendly error message for UI display.
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(_) => "Network error. Check your connection.".to_string(),
            Self::Status { status: 401, .. } => "Weather API key is invalid. Check settings.".to_string(),
            Self::Status { status, .. } if *status >= 500 => {
                "The weather service is having trouble. Please try again later.".to_string()
            }
            Self::Status { status, .. } => format!("Weather request failed ({}).", status),
            Self::NotModifiedWithoutSnapshot(_) | Self::MalformedBody(_) => {
                "Weather service sent an unexpected reply.".to_string()
            }
            Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => "Local cache error".to_string(),
            Self::Task(_) => "An unexpected error occurred. Please try again.".to_string(),
        }
    }

    /// Whether the failure happened before any response arrived.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Transport(e) => AppError::Network(e.into_network_error()),
            CacheError::Status { status: 401, .. } => AppError::Weather(WeatherError::InvalidApiKey),
            CacheError::Status { status, body } => {
                AppError::Network(NetworkError::ServerError { status, message: body })
            }
            e @ CacheError::NotModifiedWithoutSnapshot(_) => {
                AppError::Weather(WeatherError::Protocol(e.to_string()))
            }
            CacheError::MalformedBody(e) => {
                AppError::Network(NetworkError::InvalidResponse(e.to_string()))
            }
            CacheError::Storage(e) => AppError::Database(e.into_database_error()),
            CacheError::Io(e) => AppError::Io(e),
            e @ (CacheError::Task(_) | CacheError::Serialization(_)) => {
                AppError::Other(anyhow::Error::new(e))
            }
        }
    }
}

/// Why a stored payload could not be turned into a [`crate::Forecast`].
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("payload is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}
