use crate::config::schema::Config;
use crate::errors::PincerError;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// Resolve the config file location: `$PINCER_CONFIG` if set, else
/// `~/.pincer/config.json`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("PINCER_CONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".pincer")
        .join("config.json")
}

/// Load configuration from `path` (or the default location). A missing
/// file yields the default config; a malformed file is an error.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path).map_err(|err| {
        PincerError::Config(format!("failed to read {}: {}", path.display(), err))
    })?;
    let mut config: Config = serde_json::from_str(&raw).map_err(|err| {
        PincerError::Config(format!("failed to parse {}: {}", path.display(), err))
    })?;

    // Environment fallback for the provider key so the config file can
    // stay secret-free.
    if config.llm.api_key.trim().is_empty() {
        if let Ok(key) = std::env::var("PINCER_API_KEY") {
            config.llm.api_key = key;
        }
    }
    Ok(config)
}
