use std::path::PathBuf;
use tracing::{debug, warn};

use crate::types::EngineError;

pub const CONFIG_ENV: &str = "ZYPPMON_CONFIG";

/// Get the path to the config.json file
/// Honors ZYPPMON_CONFIG, else looks in the app directory (parent of the bin folder)
pub(super) fn get_config_path() -> Result<PathBuf, EngineError> {
    if let Ok(custom) = std::env::var(CONFIG_ENV) {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    // Executable is at: app_root/bin/zyppmon-engine
    // Config should be at: app_root/config.json
    if let Ok(exe_path) = std::env::current_exe() {
        debug!(path = %exe_path.display(), "Executable path detected");

        if let Some(bin_dir) = exe_path.parent() {
            if let Some(app_root) = bin_dir.parent() {
                let config_path = app_root.join("config.json");
                debug!(path = %config_path.display(), "Looking for config");
                return Ok(config_path);
            }
        }
    }

    warn!("Using fallback: looking for config.json in current directory");
    Ok(PathBuf::from("config.json"))
}
