//! Application configuration for SourceHub.
//!
//! User config lives at `~/.sourcehub/sourcehub.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SourceHubError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "sourcehub.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".sourcehub";

// ---------------------------------------------------------------------------
// Config structs (matching sourcehub.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Fan-out dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Subprocess supervision settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Raw instance records.
    ///
    /// Kept untyped so a single malformed record is reported by the loader
    /// instead of failing the whole file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<serde_json::Value>,
}

/// `[dispatch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound for a single instance's `search`/`schedule`/`activate` call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

fn default_call_timeout() -> u64 {
    30
}

/// `[supervisor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How long a retired child gets to exit before it is killed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Capacity of the shared provider log channel.
    #[serde(default = "default_log_channel_capacity")]
    pub log_channel_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: default_shutdown_grace(),
            log_channel_capacity: default_log_channel_capacity(),
        }
    }
}

impl SupervisorConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn default_shutdown_grace() -> u64 {
    3_000
}
fn default_log_channel_capacity() -> usize {
    1_024
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.sourcehub/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SourceHubError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.sourcehub/sourcehub.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SourceHubError::io(path, e))?;
    parse_config(&content)
        .map_err(|e| SourceHubError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Parse config TOML text.
pub fn parse_config(content: &str) -> std::result::Result<AppConfig, toml::de::Error> {
    toml::from_str(content)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| SourceHubError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SourceHubError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SourceHubError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
