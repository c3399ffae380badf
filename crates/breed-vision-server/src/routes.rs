//! HTTP handlers and router.

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use axum::{Json, Router};
use breed_vision_model::{ModelInfo, Prediction};
use serde::Serialize;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, info};

use crate::config::HttpConfig;
use crate::error::{ApiError, ServerError, ServerResult};
use crate::state::AppState;

/// Body of `GET /`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
}

/// Build the application router with CORS and the upload size limit applied.
pub fn build_router(state: AppState, http: &HttpConfig) -> ServerResult<Router> {
    Ok(Router::new()
        .route("/", get(health))
        .route("/model", get(model_info))
        .route("/predict", post(predict))
        .layer(DefaultBodyLimit::max(http.max_upload_bytes))
        .layer(cors_layer(&http.cors_origins)?)
        .with_state(state))
}

fn cors_layer(origins: &[String]) -> ServerResult<CorsLayer> {
    let origins = origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|e| ServerError::Config {
                message: format!("invalid cors origin '{}': {}", origin, e),
            })
        })
        .collect::<ServerResult<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model_loaded: state.model_loaded(),
    })
}

async fn model_info(State(state): State<AppState>) -> Result<Json<ModelInfo>, ApiError> {
    let classifier = state.classifier()?;
    Ok(Json(classifier.info().clone()))
}

async fn predict(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, ApiError> {
    let classifier = state.classifier()?;
    let multipart = multipart.map_err(|e| ApiError::Multipart {
        message: e.body_text(),
    })?;
    let bytes = read_upload(multipart, &state.upload_fields).await?;
    debug!(bytes = bytes.len(), "Received upload");

    let top_k = state.top_k;
    let prediction = tokio::task::spawn_blocking(move || classifier.predict_bytes(&bytes, top_k))
        .await
        .map_err(|e| ApiError::Internal {
            message: format!("spawn_blocking failed: {}", e),
        })??;

    info!(
        label = %prediction.label,
        confidence = prediction.confidence,
        "Prediction served"
    );
    Ok(Json(prediction))
}

/// Pull the first accepted file field out of the form.
async fn read_upload(mut multipart: Multipart, fields: &[String]) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        let accepted = field
            .name()
            .is_some_and(|name| fields.iter().any(|f| f == name));
        if !accepted {
            continue;
        }

        if field.file_name().is_some_and(str::is_empty) {
            return Err(ApiError::EmptyFilename);
        }
        if let Some(content_type) = field.content_type() {
            if !is_image_content_type(content_type) {
                return Err(ApiError::UnsupportedContentType {
                    content_type: content_type.to_string(),
                });
            }
        }

        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::EmptyUpload);
        }
        return Ok(bytes);
    }

    Err(ApiError::MissingUpload {
        fields: fields.to_vec(),
    })
}

/// `image/*` or an undeclared binary payload.
fn is_image_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("image/") || essence == "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_gate() {
        assert!(is_image_content_type("image/jpeg"));
        assert!(is_image_content_type("Image/PNG"));
        assert!(is_image_content_type("image/webp; charset=binary"));
        assert!(is_image_content_type("application/octet-stream"));
        assert!(!is_image_content_type("text/plain"));
        assert!(!is_image_content_type("application/pdf"));
        assert!(!is_image_content_type(""));
    }

    #[test]
    fn test_invalid_cors_origin_is_config_error() {
        let err = cors_layer(&["http://ok\nbad".to_string()]).unwrap_err();
        assert!(err.to_string().contains("cors origin"));
    }
}
