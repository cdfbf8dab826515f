use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::nutrition::store::StorageError;
use crate::nutrition::NutritionError;

/// Error type returned by every HTTP handler.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("storage unavailable, try again later")]
    Unavailable(#[source] anyhow::Error),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<NutritionError> for AppError {
    fn from(e: NutritionError) -> Self {
        match e {
            NutritionError::Validation(msg) => AppError::BadRequest(msg),
            e @ NutritionError::MealNotFound(_) => AppError::NotFound(e.to_string()),
            e @ NutritionError::GoalNotSet => AppError::NotFound(e.to_string()),
            NutritionError::Storage(e @ StorageError::Unavailable(_)) => {
                AppError::Unavailable(e.into())
            }
            NutritionError::Storage(e) => AppError::Internal(e.into()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(e) => AppError::Unprocessable(e.body_text()),
            other => AppError::BadRequest(other.body_text()),
        }
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Unavailable(source) | AppError::Internal(source) => {
                error!(error = ?source, %status, "request failed");
            }
            _ => {}
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn nutrition_errors_map_to_distinct_statuses() {
        let not_found: AppError = NutritionError::MealNotFound(Uuid::nil()).into();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let invalid: AppError = NutritionError::Validation("days must be positive".into()).into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let down: AppError =
            NutritionError::Storage(StorageError::Unavailable("pool closed".into())).into();
        assert_eq!(down.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn database_failures_are_not_retryable() {
        let err: AppError =
            NutritionError::Storage(StorageError::from(sqlx::Error::RowNotFound)).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn internal_error_hides_details() {
        let err = AppError::Internal(anyhow::anyhow!("password for postgres is hunter2"));
        assert_eq!(err.to_string(), "internal error");
    }
}
