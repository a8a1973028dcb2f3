//! # Error Handling
//!
//! HTTP-facing error type. Core modules return their own `thiserror` enums;
//! handlers convert them into [`AppError`] with `?`, which renders every
//! failure as the same JSON shape:
//!
//! ```json
//! {
//!   "error": {
//!     "type": "validation_error",
//!     "message": "invalid target language 'xx-'",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```
//!
//! ## Status Code Mapping:
//! - Internal/ConfigError → 500
//! - BadRequest/ValidationError → 400
//! - NotFound → 404
//! - ServiceUnavailable → 503 (models that cannot be loaded, session limits)

use crate::cache::CacheStoreError;
use crate::frame::FrameError;
use crate::language::LanguageTagError;
use crate::models::RegistryError;
use crate::pipeline::{ErrorKind, PassError, PipelineError};
use crate::stages::SummarizationError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    /// A dependency (model, session slot) is temporarily or persistently unavailable
    ServiceUnavailable(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::ConfigError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error", msg.as_str()),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, "validation_error", msg.as_str()),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.as_str())
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<LanguageTagError> for AppError {
    fn from(err: LanguageTagError) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

impl From<FrameError> for AppError {
    fn from(err: FrameError) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidConfig(msg) => AppError::ValidationError(msg),
            PipelineError::NoRuntime => AppError::Internal(err.to_string()),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        AppError::ServiceUnavailable(err.to_string())
    }
}

impl From<CacheStoreError> for AppError {
    fn from(err: CacheStoreError) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<SummarizationError> for AppError {
    fn from(err: SummarizationError) -> Self {
        AppError::ValidationError(err.to_string())
    }
}

impl From<PassError> for AppError {
    fn from(err: PassError) -> Self {
        let message = err.to_string();
        match err.kind {
            ErrorKind::ModelUnavailable | ErrorKind::Timeout => AppError::ServiceUnavailable(message),
            ErrorKind::Translation | ErrorKind::Recognition | ErrorKind::DetectionAmbiguous => {
                AppError::ValidationError(message)
            }
            ErrorKind::CancelledBySupersession => AppError::ServiceUnavailable(message),
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageTag;
    use crate::pipeline::PassContext;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::ServiceUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_pass_errors_map_by_kind() {
        let context = PassContext::for_text("hello", LanguageTag::parse("fr").unwrap());
        let unavailable = PassError::new(ErrorKind::ModelUnavailable, &context, "offline");
        assert!(matches!(AppError::from(unavailable), AppError::ServiceUnavailable(_)));

        let rejected = PassError::new(ErrorKind::Translation, &context, "bad input");
        match AppError::from(rejected) {
            AppError::ValidationError(msg) => assert_eq!(msg, "translation_error: bad input"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_body_shape() {
        let response = AppError::BadRequest("nope".into()).error_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
