use crate::agent::AgentError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum AppError {
    #[error("Model invocation failed: {0}")]
    ModelError(String),

    #[error("Invalid input: {0}")]
    ValidationError(String),

    #[error("Service temporarily unavailable: {0}")]
    ResourceError(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::ModelError(e) => {
                tracing::error!(error = %e, "Model invocation error");
                (StatusCode::BAD_GATEWAY, self.to_string())
            }
            AppError::ValidationError(msg) => {
                tracing::warn!(error = %msg, "Validation error");
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            AppError::ResourceError(msg) => {
                tracing::warn!(error = %msg, "Resource error");
                (StatusCode::SERVICE_UNAVAILABLE, msg.clone())
            }
        };

        let body = Json(ErrorResponse {
            error: message,
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

impl From<AgentError> for AppError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Timeout(_) => AppError::ResourceError(err.to_string()),
            other => AppError::ModelError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
