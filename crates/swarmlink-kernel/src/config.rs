//! Configuration loading from `~/.swarmlink/config.toml` with defaults.

use std::path::{Path, PathBuf};
use swarmlink_types::CoordinatorConfig;
use tracing::{info, warn};

/// Load coordinator configuration from a TOML file, with defaults.
///
/// A missing, unreadable, unparsable or invalid file yields the default
/// configuration.
pub fn load_config(path: Option<&Path>) -> CoordinatorConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return CoordinatorConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return CoordinatorConfig::default();
        }
    };

    match CoordinatorConfig::from_toml(&contents).and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            CoordinatorConfig::default()
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    swarmlink_home().join("config.toml")
}

/// Get the default SwarmLink home directory.
pub fn swarmlink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".swarmlink")
}
