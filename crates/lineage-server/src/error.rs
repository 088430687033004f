use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use lineage_engine::ResolveError;
use lineage_storage::{ErrorCategory, StorageError};
use serde::Serialize;

/// Seconds a client should wait before retrying a capacity failure.
pub const RETRY_AFTER_SECS: u64 = 1;

/// Errors returned by HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// The view join is misconfigured; the answer cannot be served.
    #[error("{message}")]
    SchemaInvariantViolation {
        entity_id: String,
        join_column: String,
        message: String,
    },
    #[error("{0}")]
    CapacityExceeded(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_column: Option<String>,
    pub retryable: bool,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::SchemaInvariantViolation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CapacityExceeded(_) | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid",
            Self::NotFound(_) => "not-found",
            Self::Conflict(_) => "conflict",
            Self::SchemaInvariantViolation { .. } => "schema-invariant-violation",
            Self::CapacityExceeded(_) => "capacity-exceeded",
            Self::Unavailable(_) => "unavailable",
            Self::Internal(_) => "exception",
        }
    }

    fn to_body(&self) -> ErrorBody {
        let (entity_id, join_column) = match self {
            Self::SchemaInvariantViolation {
                entity_id,
                join_column,
                ..
            } => (Some(entity_id.clone()), Some(join_column.clone())),
            _ => (None, None),
        };
        ErrorBody {
            error: self.code(),
            message: self.to_string(),
            entity_id,
            join_column,
            retryable: matches!(self, Self::CapacityExceeded(_) | Self::Unavailable(_)),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SchemaInvariantViolation {
                entity_id,
                join_column,
                message,
            } => Self::SchemaInvariantViolation {
                entity_id,
                join_column,
                message,
            },
            other => {
                let msg = other.to_string();
                match other.category() {
                    ErrorCategory::NotFound => Self::NotFound(msg),
                    ErrorCategory::Conflict => Self::Conflict(msg),
                    ErrorCategory::Validation => Self::BadRequest(msg),
                    ErrorCategory::Capacity => Self::CapacityExceeded(msg),
                    ErrorCategory::Infrastructure => Self::Unavailable(msg),
                    ErrorCategory::Schema | ErrorCategory::Internal => Self::Internal(msg),
                }
            }
        }
    }
}

impl From<ResolveError> for ApiError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound { .. } => Self::NotFound(err.to_string()),
            ResolveError::SchemaInvariantViolation {
                entity_id,
                join_column,
                message,
            } => Self::SchemaInvariantViolation {
                entity_id,
                join_column,
                message,
            },
            ResolveError::CapacityExceeded { message, .. } => Self::CapacityExceeded(message),
            ResolveError::Storage(inner) => inner.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let retry_after = matches!(self, Self::CapacityExceeded(_) | Self::Unavailable(_));
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }
        let mut response = (status, Json(self.to_body())).into_response();
        if retry_after {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_error_mapping() {
        let not_found: ApiError = ResolveError::not_found("x").into();
        assert_eq!(not_found.status_code(), StatusCode::NOT_FOUND);

        let capacity: ApiError = ResolveError::capacity("pool saturated").into();
        assert_eq!(capacity.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let schema: ApiError = ResolveError::SchemaInvariantViolation {
            entity_id: "a".into(),
            join_column: "row_id".into(),
            message: "no row".into(),
        }
        .into();
        assert_eq!(schema.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_storage_error_mapping() {
        let conflict: ApiError = StorageError::already_exists("root.acme").into();
        assert_eq!(conflict.status_code(), StatusCode::CONFLICT);

        let orphan: ApiError = StorageError::orphaned_path("a.b", "a").into();
        assert_eq!(orphan.status_code(), StatusCode::BAD_REQUEST);

        let busy: ApiError = StorageError::has_active_descendants("a", 2).into();
        assert_eq!(busy.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_capacity_response_has_retry_after() {
        let response = ApiError::CapacityExceeded("busy".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from(RETRY_AFTER_SECS)
        );
    }

    #[test]
    fn test_schema_body_names_join_column() {
        let err = ApiError::SchemaInvariantViolation {
            entity_id: "a".into(),
            join_column: "row_id".into(),
            message: "no row".into(),
        };
        let body = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(body["error"], "schema-invariant-violation");
        assert_eq!(body["joinColumn"], "row_id");
        assert_eq!(body["retryable"], false);
    }
}
