//! Shared request state.

use std::sync::Arc;

use breed_vision_model::ImageClassifier;

use crate::config::HttpConfig;
use crate::error::ApiError;

/// State cloned into every handler.
///
/// The classifier is loaded once at startup and read concurrently; when
/// loading failed, `load_error` keeps the reason served with each 503.
#[derive(Clone)]
pub struct AppState {
    classifier: Option<Arc<dyn ImageClassifier>>,
    load_error: Option<Arc<str>>,
    pub top_k: usize,
    pub upload_fields: Arc<[String]>,
}

impl AppState {
    pub fn ready(classifier: Arc<dyn ImageClassifier>, top_k: usize, http: &HttpConfig) -> Self {
        Self {
            classifier: Some(classifier),
            load_error: None,
            top_k,
            upload_fields: http.upload_fields.clone().into(),
        }
    }

    /// State for a server whose model failed to load.
    pub fn degraded(reason: impl Into<String>, top_k: usize, http: &HttpConfig) -> Self {
        Self {
            classifier: None,
            load_error: Some(Arc::from(reason.into())),
            top_k,
            upload_fields: http.upload_fields.clone().into(),
        }
    }

    pub fn model_loaded(&self) -> bool {
        self.classifier.is_some()
    }

    /// The loaded classifier, or the 503 explaining why there is none.
    pub fn classifier(&self) -> Result<Arc<dyn ImageClassifier>, ApiError> {
        self.classifier
            .clone()
            .ok_or_else(|| ApiError::ModelNotLoaded {
                reason: self
                    .load_error
                    .as_deref()
                    .unwrap_or("no model configured")
                    .to_string(),
            })
    }
}
