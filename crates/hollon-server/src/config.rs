//! Configuration file management for hollond.
//!
//! Provides a TOML-based config file at `~/.config/hollon/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use hollon_db::config::DbConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    /// HTTP listen address.
    pub http_addr: String,
    /// Skip the control-plane loops entirely (test environments).
    pub scheduler_disabled: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:8700".to_string(),
            scheduler_disabled: false,
        }
    }
}

/// Return the hollon config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/hollon` or `~/.config/hollon`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("hollon");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("hollon")
}

/// Return the path to the hollon config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct HollonConfig {
    pub db: DbConfig,
    pub http_addr: String,
    pub scheduler_disabled: bool,
}

impl HollonConfig {
    /// Resolve configuration: CLI flag > env var > config file > default.
    pub fn resolve(database_url_flag: Option<String>) -> Self {
        let file = load_config().ok();

        let database_url = database_url_flag
            .or_else(|| std::env::var("HOLLON_DATABASE_URL").ok())
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_string());

        let http_addr = std::env::var("HOLLON_HTTP_ADDR")
            .ok()
            .or_else(|| file.as_ref().map(|f| f.server.http_addr.clone()))
            .unwrap_or_else(|| ServerSection::default().http_addr);

        let scheduler_disabled = std::env::var("HOLLON_SCHEDULER_DISABLED")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or_else(|_| file.as_ref().is_some_and(|f| f.server.scheduler_disabled));

        Self {
            db: DbConfig::new(database_url),
            http_addr,
            scheduler_disabled,
        }
    }
}
