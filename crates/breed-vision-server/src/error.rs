//! Server errors: startup failures and per-request API errors.
//!
//! # Status Mapping
//!
//! | Variant | Status |
//! |---------|--------|
//! | MissingUpload, EmptyFilename, EmptyUpload, UnsupportedContentType, Multipart | 400 |
//! | Model (input error) | 400 |
//! | Model (any other), Internal | 500 |
//! | UploadTooLarge | 413 |
//! | ModelNotLoaded | 503 |

use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use breed_vision_model::ModelError;
use serde::Serialize;
use thiserror::Error;

/// Startup and configuration failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Prefix a configuration message with its TOML section.
    pub(crate) fn in_section(self, section: &str) -> Self {
        match self {
            Self::Config { message } | Self::Model(ModelError::ConfigError { message }) => {
                Self::config(format!("[{}] {}", section, message))
            }
            other => other,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

/// Error returned by a request handler.
#[derive(Debug, Error)]
pub enum ApiError {
    // === Request Errors (400) ===
    #[error("No file uploaded (expected a multipart field named {})", fields.join(" or "))]
    MissingUpload { fields: Vec<String> },

    #[error("No file selected")]
    EmptyFilename,

    #[error("Uploaded file is empty")]
    EmptyUpload,

    #[error("Unsupported content type '{content_type}', expected an image")]
    UnsupportedContentType { content_type: String },

    #[error("Malformed multipart request: {message}")]
    Multipart { message: String },

    #[error("Upload exceeds the request size limit: {message}")]
    UploadTooLarge { message: String },

    // === Model Errors (400 / 500) ===
    #[error(transparent)]
    Model(#[from] ModelError),

    // === Availability (503) ===
    #[error("Model not loaded: {reason}")]
    ModelNotLoaded { reason: String },

    // === Internal (500) ===
    #[error("Internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    detail: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingUpload { .. }
            | Self::EmptyFilename
            | Self::EmptyUpload
            | Self::UnsupportedContentType { .. }
            | Self::Multipart { .. } => StatusCode::BAD_REQUEST,
            Self::UploadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Model(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            Self::Model(_) | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ModelNotLoaded { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short summary placed in the `error` field of the response body.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::MissingUpload { .. } => "No file uploaded",
            Self::EmptyFilename => "No file selected",
            Self::EmptyUpload => "Empty file",
            Self::UnsupportedContentType { .. } => "Unsupported file type",
            Self::Multipart { .. } => "Malformed upload",
            Self::UploadTooLarge { .. } => "File too large",
            Self::Model(e) if e.is_client_error() => "Invalid image file",
            Self::Model(_) => "Prediction failed",
            Self::ModelNotLoaded { .. } => "Model not loaded",
            Self::Internal { .. } => "Internal server error",
        }
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::UploadTooLarge {
                message: err.body_text(),
            }
        } else {
            Self::Multipart {
                message: err.body_text(),
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", self);
        } else {
            tracing::warn!(status = status.as_u16(), "{}", self);
        }
        let body = ErrorBody {
            error: self.summary(),
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_model_errors_are_bad_requests() {
        let err = ApiError::from(ModelError::InvalidImage {
            reason: "bad magic".to_string(),
        });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.summary(), "Invalid image file");
        assert!(err.to_string().contains("bad magic"));

        assert_eq!(
            ApiError::from(ModelError::EmptyInput).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_inference_errors_are_server_errors() {
        let err = ApiError::from(ModelError::Inference {
            message: "nan logits".to_string(),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("nan logits"));
    }

    #[test]
    fn test_not_loaded_is_unavailable() {
        let err = ApiError::ModelNotLoaded {
            reason: "Checkpoint not found: x.pth".to_string(),
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_missing_upload_lists_fields() {
        let err = ApiError::MissingUpload {
            fields: vec!["image".to_string(), "file".to_string()],
        };
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("image or file"));
    }
}
