use crate::error::{AutodeleteError, Result};
use crate::worker::WorkerConfig;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/autodelete.yaml";

/// Main configuration for AutoDelete
pub struct Config {
    pub bot_token: String,
    pub settings: Settings,
}

/// Tunables read from `config/autodelete.yaml`; every field has a default
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding one `<channel_id>.yml` policy per channel
    pub policy_dir: PathBuf,
    pub sweep_interval_secs: u64,
    /// How often to reconcile every backlog when no gateway drives reconnects
    pub resync_interval_secs: u64,
    /// Most messages fetched per channel when loading a backlog
    pub backlog_limit: usize,
    pub delete_retries: u32,
    pub retry_backoff_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub api_base: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            policy_dir: PathBuf::from("data"),
            sweep_interval_secs: 300,
            resync_interval_secs: 900,
            backlog_limit: 500,
            delete_retries: 3,
            retry_backoff_ms: 500,
            shutdown_timeout_secs: 10,
            api_base: "https://discord.com/api/v10".to_string(),
        }
    }
}

impl Settings {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            delete_retries: self.delete_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(AutodeleteError::ConfigError(
                "sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.resync_interval_secs == 0 {
            return Err(AutodeleteError::ConfigError(
                "resync_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.backlog_limit == 0 {
            return Err(AutodeleteError::ConfigError(
                "backlog_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from the YAML settings file and environment variables
pub fn load_config() -> Result<Config> {
    // Load environment variables (required)
    let bot_token = env::var("DISCORD_BOT_TOKEN")
        .map_err(|_| AutodeleteError::ConfigError("DISCORD_BOT_TOKEN not set".to_string()))?;

    let path = env::var("AUTODELETE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let settings = load_settings(Path::new(&path))?;

    Ok(Config {
        bot_token,
        settings,
    })
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = match fs::read_to_string(path) {
        Ok(content) => serde_yaml::from_str(&content)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!("No settings file at {:?}, using defaults", path);
            Settings::default()
        }
        Err(e) => {
            return Err(AutodeleteError::ConfigError(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    settings.validate()?;
    Ok(settings)
}
