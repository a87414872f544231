use std::env;
use std::path::Path;

use tokio::fs;
use tracing::{info, warn};

use crate::types::EngineError;

use super::{paths, Config};

pub const SERVER_URL_ENV: &str = "ZYPPMON_SERVER_URL";

impl Config {
    /// Load configuration from config.json
    /// Falls back to defaults if the file doesn't exist or can't be parsed
    pub async fn load() -> Self {
        let mut config = match paths::get_config_path() {
            Ok(path) => match Self::load_from(&path).await {
                Ok(config) => {
                    info!(
                        server = %config.server_url,
                        path = %path.display(),
                        "Loaded configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(error = ?err, "Failed to load config.json, using defaults");
                    Self::default()
                }
            },
            Err(err) => {
                warn!(error = ?err, "No config path available, using defaults");
                Self::default()
            }
        };

        if let Ok(custom) = env::var(SERVER_URL_ENV) {
            let trimmed = custom.trim();
            if !trimmed.is_empty() {
                config.server_url = trimmed.to_string();
            }
        }
        config
    }

    pub async fn load_from(config_path: &Path) -> Result<Self, EngineError> {
        if !config_path.exists() {
            warn!(path = %config_path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(config_path)
            .await
            .map_err(|err| EngineError::Config(format!("Failed to read config file: {err}")))?;

        serde_json::from_str(&contents)
            .map_err(|err| EngineError::Config(format!("Failed to parse config.json: {err}")))
    }
}
