use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Missing values: {0}")]
    MissingValues(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Transform error: {0}")]
    Transform(String),
    #[error("Queue is full: {0}")]
    QueueFull(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Result code reported to the HTTP collaborator for this error.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }
}

/// The small result-code taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    None,
    BadRequest,
    MissingValues,
    ServerError,
}

impl ErrorCode {
    pub fn from_result<T>(result: &Result<T, AppError>) -> Self {
        match result {
            Ok(_) => Self::None,
            Err(err) => err.code(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::BadRequest => "Bad Request",
            Self::MissingValues => "Missing Values",
            Self::ServerError => "Server Error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::None => StatusCode::OK,
            Self::BadRequest | Self::MissingValues => StatusCode::BAD_REQUEST,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<&AppError> for ErrorCode {
    fn from(err: &AppError) -> Self {
        match err {
            // A job owned by someone else is reported exactly like a missing one
            AppError::NotFound(_) | AppError::Validation(_) => Self::BadRequest,
            AppError::MissingValues(_) => Self::MissingValues,
            AppError::Database(_)
            | AppError::Join(_)
            | AppError::Io(_)
            | AppError::Serialization(_)
            | AppError::Config(_)
            | AppError::Image(_)
            | AppError::Transform(_)
            | AppError::QueueFull(_)
            | AppError::InternalError(_) => Self::ServerError,
        }
    }
}

impl IntoResponse for ErrorCode {
    fn into_response(self) -> Response {
        let body = match self {
            Self::None => ErrorResponse {
                error: None,
                status: "success".to_string(),
            },
            _ => ErrorResponse {
                error: Some(self.as_str().to_string()),
                status: "error".to_string(),
            },
        };

        (self.status_code(), Json(body)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let message = match code {
            ErrorCode::ServerError => {
                tracing::error!("Internal error: {:?}", self);
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        (
            code.status_code(),
            Json(ErrorResponse {
                error: Some(message),
                status: "error".to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    status: String,
}
