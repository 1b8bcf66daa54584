use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tokio::task;
use tracing::error;

use crate::csv_import::CsvImportError;
use crate::survey_store::SurveyStoreError;
use crate::time_util::TimeParseError;

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(message)
            | ApiError::NotFound(message)
            | ApiError::Conflict(message)
            | ApiError::Unavailable(message) => message,
            ApiError::Internal(message) => {
                error!("request failed: {}", message);
                "internal error".to_string()
            }
        };
        (
            status,
            Json(json!({ "status": "error", "message": message })),
        )
            .into_response()
    }
}

impl From<SurveyStoreError> for ApiError {
    fn from(err: SurveyStoreError) -> Self {
        match err {
            SurveyStoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            SurveyStoreError::NotPublished(_) => ApiError::Conflict(err.to_string()),
            SurveyStoreError::InvalidInput(message) => ApiError::BadRequest(message),
            SurveyStoreError::InconsistentPublishState => ApiError::BadRequest(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<TimeParseError> for ApiError {
    fn from(err: TimeParseError) -> Self {
        ApiError::BadRequest(format!("invalid scheduled_time: {}", err))
    }
}

impl From<CsvImportError> for ApiError {
    fn from(err: CsvImportError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

/// Runs store work on the blocking pool.
pub(crate) async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work).await.map_err(|err| {
        error!("spawn_blocking panicked: {}", err);
        ApiError::Internal("blocking task failed".to_string())
    })?
}
