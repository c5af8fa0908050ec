use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not a valid zip file.")]
    InvalidArchive,

    /// A record inside a readable archive entry failed conversion or validation.
    #[error("Invalid backup record: {0}")]
    InvalidBackup(String),

    #[error("Maximum filesize upload limit exceeded. File must be <= {}", sizeof_readable(*limit as f64))]
    SizeLimitExceeded { limit: usize },

    #[error("Configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidArchive => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::InvalidBackup(ref reason) => {
                tracing::warn!("Rejected backup file: {}", reason);
                (
                    StatusCode::BAD_REQUEST,
                    "Not a valid lastfm-backup-file.".to_string(),
                )
            }
            AppError::SizeLimitExceeded { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            AppError::ConfigurationMissing(ref what) => {
                tracing::error!("Configuration missing: {}", what);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Could not upload the file. {}", what),
                )
            }
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Database(ref e) => {
                tracing::error!("Database error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
            }
            AppError::Redis(ref e) => {
                tracing::error!("Redis error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Cache error".to_string())
            }
            AppError::Storage(ref msg) => {
                tracing::error!("Storage error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            AppError::Io(ref e) => {
                tracing::error!("I/O error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Something went wrong. Could not upload the file".to_string(),
                )
            }
            AppError::Internal(ref e) => {
                tracing::error!("Internal error: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Human readable byte size, e.g. `16.0 MB`.
pub fn sizeof_readable(mut num: f64) -> String {
    for unit in ["", "K", "M", "G", "T", "P", "E", "Z"] {
        if num.abs() < 1024.0 {
            return format!("{:.1} {}B", num, unit);
        }
        num /= 1024.0;
    }
    format!("{:.1} YiB", num)
}
