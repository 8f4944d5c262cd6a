use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Where the mixer backend lives.  The two push endpoints are addressed
/// separately because they fail and reconnect independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_thread_ws_url")]
    pub thread_ws_url: String,
    #[serde(default = "default_volume_ws_url")]
    pub volume_ws_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Delay between reconnect attempts on a dropped push stream.
    /// Fixed, no backoff — the control surface must keep trying.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// How long a channel stays marked ERROR after a thread_exception
    /// before it is cleared back to STOPPED.
    #[serde(default = "default_error_display_ms")]
    pub error_display_ms: u64,
    /// Period of the authoritative full-status REST poll.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            thread_ws_url: default_thread_ws_url(),
            volume_ws_url: default_volume_ws_url(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            error_display_ms: default_error_display_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_thread_ws_url() -> String {
    "ws://localhost:8080/ws/thread".to_string()
}

fn default_volume_ws_url() -> String {
    "ws://localhost:8080/ws/volume".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

fn default_error_display_ms() -> u64 {
    5000
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
