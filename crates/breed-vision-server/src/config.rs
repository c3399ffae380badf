//! Server configuration.
//!
//! Loaded from TOML, then environment overrides, then CLI flags.
//!
//! ```toml
//! [server]
//! bind_address = "127.0.0.1"
//! port = 8000
//!
//! [model]
//! model_path = "models/final_enhanced_cattle_classifier.pth"
//! ```

use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use breed_vision_model::ModelConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

pub const ENV_BIND_ADDRESS: &str = "BREED_VISION_BIND_ADDRESS";
pub const ENV_PORT: &str = "BREED_VISION_PORT";
pub const ENV_REQUIRE_MODEL: &str = "BREED_VISION_REQUIRE_MODEL";

// ============================================================================
// HTTP CONFIG
// ============================================================================

/// Listener and request handling settings (`[server]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Multipart field names accepted as the uploaded image.
    #[serde(default = "default_upload_fields")]
    pub upload_fields: Vec<String>,

    /// Maximum request body size in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Browser origins allowed by CORS.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Abort startup instead of serving 503 when the model fails to load.
    #[serde(default)]
    pub require_model: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_upload_fields() -> Vec<String> {
    vec!["image".to_string(), "file".to_string()]
}

fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:3000".to_string(),
        "http://127.0.0.1:5173".to_string(),
    ]
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            upload_fields: default_upload_fields(),
            max_upload_bytes: default_max_upload_bytes(),
            cors_origins: default_cors_origins(),
            require_model: false,
        }
    }
}

impl HttpConfig {
    pub fn validate(&self) -> ServerResult<()> {
        if self.bind_address.parse::<IpAddr>().is_err() {
            return Err(ServerError::config(format!(
                "bind_address '{}' is not an IP address",
                self.bind_address
            )));
        }
        if self.upload_fields.is_empty() || self.upload_fields.iter().any(|f| f.is_empty()) {
            return Err(ServerError::config(
                "upload_fields must list at least one non-empty field name",
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(ServerError::config("max_upload_bytes must be > 0"));
        }
        for origin in &self.cors_origins {
            if !origin.starts_with("http://") && !origin.starts_with("https://") {
                return Err(ServerError::config(format!(
                    "cors origin '{}' must start with http:// or https://",
                    origin
                )));
            }
        }
        Ok(())
    }

    /// Socket address to listen on. Call after [`validate`](Self::validate).
    pub fn socket_addr(&self) -> ServerResult<SocketAddr> {
        let ip: IpAddr = self.bind_address.parse().map_err(|e| {
            ServerError::config(format!("bind_address '{}': {}", self.bind_address, e))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

// ============================================================================
// SERVER CONFIG
// ============================================================================

/// Root configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,

    #[serde(default)]
    pub model: ModelConfig,
}

impl ServerConfig {
    /// Load configuration from a TOML file. Missing fields take defaults.
    pub fn from_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let path = path.as_ref();

        let contents = std::fs::read_to_string(path).map_err(|e| {
            ServerError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        toml::from_str(&contents).map_err(|e| {
            ServerError::config(format!(
                "Failed to parse TOML in '{}': {}",
                path.display(),
                e
            ))
        })
    }

    /// Validate both sections, returning the first error found.
    pub fn validate(&self) -> ServerResult<()> {
        self.server.validate().map_err(|e| e.in_section("server"))?;
        self.model
            .validate()
            .map_err(|e| ServerError::from(e).in_section("model"))
    }

    /// Apply environment variable overrides for both sections.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `BREED_VISION_BIND_ADDRESS` | `server.bind_address` |
    /// | `BREED_VISION_PORT` | `server.port` |
    /// | `BREED_VISION_REQUIRE_MODEL` | `server.require_model` |
    /// | `MODEL_FILE` | `model.model_path` |
    /// | `CLASSES_FILE` | `model.classes_path` |
    /// | `BREED_VISION_TOP_K` | `model.top_k` |
    /// | `BREED_VISION_DEVICE` | `model.device` |
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| env::var(key).ok())
    }

    fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = lookup(ENV_BIND_ADDRESS) {
            self.server.bind_address = val;
        }
        if let Some(val) = lookup(ENV_PORT) {
            match val.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => tracing::warn!("Ignoring {}={}: not a port number", ENV_PORT, val),
            }
        }
        if let Some(val) = lookup(ENV_REQUIRE_MODEL) {
            match val.parse::<bool>() {
                Ok(b) => self.server.require_model = b,
                Err(_) => tracing::warn!("Ignoring {}={}: expected true/false", ENV_REQUIRE_MODEL, val),
            }
        }
        self.model = self.model.with_overrides_from(&lookup);
        self
    }
}
