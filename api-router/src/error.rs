use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_typed_multipart::TypedMultipartError;
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize, Clone)]
pub enum ApiError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("{message}")]
    BadRequest { code: &'static str, message: String },

    #[error("{message}")]
    NotFound { code: &'static str, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Gone(String),
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        let code = err.code();
        match err {
            AppError::NotFound(msg) => Self::NotFound { code, message: msg },
            AppError::BatchNotReady(_) => Self::NotFound {
                code,
                message: err.to_string(),
            },
            AppError::Validation(msg) => Self::BadRequest { code, message: msg },
            AppError::NoFile | AppError::InvalidFileType(_) | AppError::NotReady(_) => {
                Self::BadRequest {
                    code,
                    message: err.to_string(),
                }
            }
            AppError::FileTooLarge { .. } => Self::PayloadTooLarge(err.to_string()),
            AppError::QuotaExceeded { .. } => Self::QuotaExceeded(err.to_string()),
            AppError::Expired(_) => Self::Gone(err.to_string()),
            AppError::Auth(msg) => Self::Unauthorized(msg),
            _ => {
                tracing::error!("Internal error: {:?}", err);
                Self::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl From<TypedMultipartError> for ApiError {
    fn from(err: TypedMultipartError) -> Self {
        if err.get_status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(err.to_string())
        } else {
            Self::BadRequest {
                code: "VALIDATION_ERROR",
                message: err.to_string(),
            }
        }
    }
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            Self::InternalError(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
            }
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            Self::Unauthorized(message) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message),
            Self::PayloadTooLarge(message) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE", message)
            }
            Self::QuotaExceeded(message) => {
                (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED", message)
            }
            Self::Gone(message) => (StatusCode::GONE, "FILE_EXPIRED", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, error) = self.parts();

        (
            status,
            Json(ErrorResponse {
                error,
                code,
                status: "error",
            }),
        )
            .into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    status: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::AppError;
    use std::fmt::Debug;

    // Helper to check status code
    fn assert_status_code<T: IntoResponse + Debug>(response: T, expected_status: StatusCode) {
        let response = response.into_response();
        assert_eq!(response.status(), expected_status);
    }

    fn parts_of(err: AppError) -> (StatusCode, &'static str) {
        let (status, code, _) = ApiError::from(err).parts();
        (status, code)
    }

    #[test]
    fn test_app_error_to_api_error_conversion() {
        let not_found = AppError::NotFound("resource not found".to_string());
        let api_error = ApiError::from(not_found);
        assert!(matches!(
            api_error,
            ApiError::NotFound { code: "JOB_NOT_FOUND", ref message } if message == "resource not found"
        ));

        let validation = AppError::Validation("invalid input".to_string());
        let api_error = ApiError::from(validation);
        assert!(matches!(
            api_error,
            ApiError::BadRequest { code: "VALIDATION_ERROR", ref message } if message == "invalid input"
        ));

        let auth = AppError::Auth("unauthorized".to_string());
        let api_error = ApiError::from(auth);
        assert!(matches!(api_error, ApiError::Unauthorized(msg) if msg == "unauthorized"));

        let internal_error = AppError::Io(std::io::Error::other("io error"));
        let api_error = ApiError::from(internal_error);
        assert!(matches!(api_error, ApiError::InternalError(_)));
    }

    #[test]
    fn domain_errors_map_to_status_and_code() {
        assert_eq!(
            parts_of(AppError::NoFile),
            (StatusCode::BAD_REQUEST, "NO_FILE")
        );
        assert_eq!(
            parts_of(AppError::InvalidFileType("image/gif".into())),
            (StatusCode::BAD_REQUEST, "INVALID_FILE_TYPE")
        );
        assert_eq!(
            parts_of(AppError::NotReady("job".into())),
            (StatusCode::BAD_REQUEST, "NOT_READY")
        );
        assert_eq!(
            parts_of(AppError::FileTooLarge { size: 2, limit: 1 }),
            (StatusCode::PAYLOAD_TOO_LARGE, "FILE_TOO_LARGE")
        );
        assert_eq!(
            parts_of(AppError::QuotaExceeded { limit: 10 }),
            (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED")
        );
        assert_eq!(
            parts_of(AppError::Expired("job".into())),
            (StatusCode::GONE, "FILE_EXPIRED")
        );
        assert_eq!(
            parts_of(AppError::BatchNotReady("batch".into())),
            (StatusCode::NOT_FOUND, "BATCH_NOT_READY")
        );
        assert_eq!(
            parts_of(AppError::Codec("truncated".into())),
            (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
        );
    }

    #[test]
    fn test_api_error_response_status_codes() {
        assert_status_code(
            ApiError::InternalError("server error".to_string()),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        assert_status_code(
            ApiError::Unauthorized("not allowed".to_string()),
            StatusCode::UNAUTHORIZED,
        );
        assert_status_code(
            ApiError::PayloadTooLarge("too big".to_string()),
            StatusCode::PAYLOAD_TOO_LARGE,
        );
    }

    #[test]
    fn test_internal_error_sanitization() {
        let api_error = ApiError::InternalError("db password incorrect".to_string());
        assert_eq!(api_error.to_string(), "Internal server error");
        assert_status_code(api_error, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
