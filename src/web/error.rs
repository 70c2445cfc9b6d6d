use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::monitor::coordinator::EngineError;
use crate::server::config::ConfigError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::ConfigError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Configuration error: {msg}"),
            ),
            AppError::StoreError(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Stopped => AppError::ServiceUnavailable(err.to_string()),
            EngineError::Store(e) => AppError::StoreError(e.to_string()),
            EngineError::Pool(e) => AppError::InternalServerError(e.to_string()),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}
