use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// A structured reason a publish request was refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishBlocker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concept_version_id: Option<i64>,
    pub reason: String,
}

impl PublishBlocker {
    pub fn child(concept_id: i64, concept_version_id: i64, reason: impl Into<String>) -> Self {
        Self {
            concept_id: Some(concept_id),
            concept_version_id: Some(concept_version_id),
            reason: reason.into(),
        }
    }

    pub fn entity(reason: impl Into<String>) -> Self {
        Self {
            concept_id: None,
            concept_version_id: None,
            reason: reason.into(),
        }
    }
}

/// Error kinds surfaced to callers. Permission and brand-scope failures
/// use `NotFound`/`Forbidden` without disclosing whether the resource
/// exists.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("malformed id: {0}")]
    MalformedId(String),

    #[error("validation failed")]
    ValidationFailed(Vec<FieldError>),

    #[error("publication blocked")]
    PublicationBlocked(Vec<PublishBlocker>),

    #[error("concurrent edit detected: expected version {expected}, found {found}")]
    Conflict { expected: i64, found: i64 },

    #[error("upstream source failed: {0}")]
    Upstream(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        ApiError::ValidationFailed(vec![FieldError::new(field, message)])
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::MalformedId(_) => StatusCode::NOT_ACCEPTABLE,
            ApiError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            ApiError::PublicationBlocked(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::MalformedId("x".into()).status_code(),
            StatusCode::NOT_ACCEPTABLE
        );
        assert_eq!(
            ApiError::validation("name", "missing").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Conflict {
                expected: 1,
                found: 2
            }
            .status_code(),
            StatusCode::CONFLICT
        );
    }
}
