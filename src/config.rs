use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::bootstrap::BootstrapOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Agent identity
    #[serde(default = "default_handle")]
    pub handle: String,

    // Group state storage
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // LLM configuration (OpenAI-compatible endpoint)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Connection bootstrap tuning
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    #[serde(default = "default_first_attempt_timeout_secs")]
    pub first_attempt_timeout_secs: u64,
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,
    #[serde(default = "default_base_retry_delay_secs")]
    pub base_retry_delay_secs: u64,
    /// Documented network installation cap; metadata for error messages.
    #[serde(default = "default_installation_cap")]
    pub installation_cap: u32,

    // Thread engagement windows
    #[serde(default = "default_thread_timeout_secs")]
    pub thread_timeout_secs: u64,
    #[serde(default = "default_response_gap_secs")]
    pub response_gap_secs: u64,

    /// How many recent messages to pull when judging engagement.
    #[serde(default = "default_engagement_history_limit")]
    pub engagement_history_limit: usize,
}

fn default_handle() -> String {
    "@splitlaunch".to_string()
}

fn default_database_path() -> String {
    "splitlaunch_groups.db".to_string()
}

fn default_llm_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.1".to_string()
}

fn default_max_connect_attempts() -> u32 {
    5
}

fn default_first_attempt_timeout_secs() -> u64 {
    30
}

fn default_retry_timeout_secs() -> u64 {
    10
}

fn default_base_retry_delay_secs() -> u64 {
    2
}

fn default_installation_cap() -> u32 {
    5
}

fn default_thread_timeout_secs() -> u64 {
    300
}

fn default_response_gap_secs() -> u64 {
    120
}

fn default_engagement_history_limit() -> usize {
    20
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            handle: default_handle(),
            database_path: default_database_path(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            max_connect_attempts: default_max_connect_attempts(),
            first_attempt_timeout_secs: default_first_attempt_timeout_secs(),
            retry_timeout_secs: default_retry_timeout_secs(),
            base_retry_delay_secs: default_base_retry_delay_secs(),
            installation_cap: default_installation_cap(),
            thread_timeout_secs: default_thread_timeout_secs(),
            response_gap_secs: default_response_gap_secs(),
            engagement_history_limit: default_engagement_history_limit(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Path to the config file (next to the executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("splitlaunch_config.toml")
    }

    /// Load from splitlaunch_config.toml, falling back to defaults + env vars.
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match toml::from_str::<AgentConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Build from environment variables alone.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(handle) = env::var("SPLITLAUNCH_HANDLE") {
            if !handle.trim().is_empty() {
                config.handle = handle;
            }
        }

        if let Ok(path) = env::var("SPLITLAUNCH_DB_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(attempts) = env::var("SPLITLAUNCH_MAX_CONNECT_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                config.max_connect_attempts = n;
            }
        }

        if let Ok(secs) = env::var("SPLITLAUNCH_FIRST_ATTEMPT_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse() {
                config.first_attempt_timeout_secs = n;
            }
        }

        if let Ok(secs) = env::var("SPLITLAUNCH_RETRY_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse() {
                config.retry_timeout_secs = n;
            }
        }

        if let Ok(secs) = env::var("SPLITLAUNCH_BASE_RETRY_DELAY_SECS") {
            if let Ok(n) = secs.parse() {
                config.base_retry_delay_secs = n;
            }
        }

        if let Ok(cap) = env::var("SPLITLAUNCH_INSTALLATION_CAP") {
            if let Ok(n) = cap.parse() {
                config.installation_cap = n;
            }
        }

        if let Ok(secs) = env::var("SPLITLAUNCH_THREAD_TIMEOUT_SECS") {
            if let Ok(n) = secs.parse() {
                config.thread_timeout_secs = n;
            }
        }

        if let Ok(secs) = env::var("SPLITLAUNCH_RESPONSE_GAP_SECS") {
            if let Ok(n) = secs.parse() {
                config.response_gap_secs = n;
            }
        }

        config
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            max_attempts: self.max_connect_attempts,
            first_attempt_timeout: Duration::from_secs(self.first_attempt_timeout_secs),
            retry_timeout: Duration::from_secs(self.retry_timeout_secs),
            base_retry_delay: Duration::from_secs(self.base_retry_delay_secs),
            installation_cap: self.installation_cap,
        }
    }

    pub fn thread_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.thread_timeout_secs as i64)
    }

    pub fn response_gap(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.response_gap_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tuning() {
        let config = AgentConfig::default();
        assert_eq!(config.max_connect_attempts, 5);
        assert_eq!(config.installation_cap, 5);
        assert_eq!(config.thread_timeout_secs, 300);
        assert_eq!(config.response_gap_secs, 120);

        let opts = config.bootstrap_options();
        assert_eq!(opts.first_attempt_timeout, Duration::from_secs(30));
        assert_eq!(opts.retry_timeout, Duration::from_secs(10));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: AgentConfig =
            toml::from_str("handle = \"@launchbot\"\nthread_timeout_secs = 60\n")
                .expect("parse");
        assert_eq!(config.handle, "@launchbot");
        assert_eq!(config.thread_timeout_secs, 60);
        assert_eq!(config.max_connect_attempts, 5);
        assert_eq!(config.database_path, default_database_path());
    }
}
