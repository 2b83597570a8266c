use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Service-level error taxonomy. `Startup` never crosses the HTTP
/// boundary; it aborts the process before the server accepts requests.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No input sentences")]
    InvalidInput,

    #[error("model execution failed: {0}")]
    ModelExecution(String),

    #[error("startup failed: {0}")]
    Startup(String),
}

impl ServiceError {
    pub fn model(err: impl std::fmt::Display) -> Self {
        Self::ModelExecution(err.to_string())
    }

    pub fn startup(err: impl std::fmt::Display) -> Self {
        Self::Startup(err.to_string())
    }
}

impl From<candle_core::Error> for ServiceError {
    fn from(err: candle_core::Error) -> Self {
        Self::ModelExecution(err.to_string())
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::InvalidInput => StatusCode::BAD_REQUEST,
            ServiceError::ModelExecution(_) | ServiceError::Startup(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
