//! HTTP endpoint serving a breed image classifier.
//!
//! # Endpoints
//!
//! | Method | Path | Response |
//! |--------|------|----------|
//! | GET | `/` | `{"status": "ok", "model_loaded": bool}` |
//! | GET | `/model` | loaded model summary, or 503 |
//! | POST | `/predict` | multipart upload → `{"label", "confidence", "alternatives"}` |
//!
//! The model is loaded once at startup. A failed load leaves the server up
//! in a degraded state where `/predict` and `/model` answer 503, unless
//! `server.require_model` is set.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use breed_vision_model::{init_device, load_classifier, ImageClassifier};
use tracing::{error, info, warn};

pub use config::{HttpConfig, ServerConfig};
pub use error::{ApiError, ServerError, ServerResult};
pub use routes::build_router;
pub use state::AppState;

/// Load the model described by `config` and wrap it in request state.
///
/// # Errors
///
/// Only when the model fails to load and `server.require_model` is set.
pub fn load_state(config: &ServerConfig) -> ServerResult<AppState> {
    let loaded = init_device(config.model.device)
        .and_then(|device| load_classifier(&config.model, device));

    match loaded {
        Ok(classifier) => {
            let info = classifier.info();
            info!(
                architecture = %info.architecture,
                classes = info.num_classes,
                class_source = %info.class_source,
                device = %info.device,
                "Model ready"
            );
            if info.load_report.is_partial() {
                warn!("Model was loaded partially; see GET /model for the skipped parameters");
            }
            let classifier: Arc<dyn ImageClassifier> = Arc::new(classifier);
            Ok(AppState::ready(classifier, config.model.top_k, &config.server))
        }
        Err(e) if config.server.require_model => Err(e.into()),
        Err(e) => {
            error!("Model failed to load, serving without it: {}", e);
            Ok(AppState::degraded(
                e.to_string(),
                config.model.top_k,
                &config.server,
            ))
        }
    }
}

/// Bind the listener and serve until Ctrl-C.
pub async fn serve(config: &ServerConfig, state: AppState) -> ServerResult<()> {
    let addr = config.server.socket_addr()?;
    let router = build_router(state, &config.server)?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

