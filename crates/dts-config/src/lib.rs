use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use dts_types::Resources;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Backend server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bearer token required on every API call (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// SQLite database file. Defaults to `~/.dts/dts.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Seconds between fire-loop ticks.
    #[serde(default = "default_fire_interval")]
    pub fire_interval_secs: u64,
    /// Total resources the scheduler may reserve at once.
    #[serde(default = "default_capacity")]
    pub capacity: Resources,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_fire_interval() -> u64 {
    5
}

fn default_capacity() -> Resources {
    Resources::new(64.0, 256.0, 1024.0)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            auth_token: None,
            database_path: None,
            fire_interval_secs: default_fire_interval(),
            capacity: default_capacity(),
        }
    }
}

/// Where the orchestrator finds the three backend services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default = "default_service_url")]
    pub job_registry_url: String,
    #[serde(default = "default_service_url")]
    pub scheduler_url: String,
    #[serde(default = "default_service_url")]
    pub execution_url: String,
    /// Upper bound for a single service call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Bearer token attached to outgoing calls (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

fn default_service_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout() -> u64 {
    10_000
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            job_registry_url: default_service_url(),
            scheduler_url: default_service_url(),
            execution_url: default_service_url(),
            request_timeout_ms: default_request_timeout(),
            auth_token: None,
        }
    }
}

impl ServicesConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level dts configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DtsConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub services: ServicesConfig,
}

impl DtsConfig {
    /// Apply `DTS_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DTS_JOB_REGISTRY_URL") {
            self.services.job_registry_url = v;
        }
        if let Some(v) = lookup("DTS_SCHEDULER_URL") {
            self.services.scheduler_url = v;
        }
        if let Some(v) = lookup("DTS_EXECUTION_URL") {
            self.services.execution_url = v;
        }
        if let Some(v) = lookup("DTS_AUTH_TOKEN") {
            self.services.auth_token = Some(v.clone());
            self.server.auth_token = Some(v);
        }
        if let Some(v) = lookup("DTS_REQUEST_TIMEOUT_MS") {
            match v.parse() {
                Ok(ms) => self.services.request_timeout_ms = ms,
                Err(_) => tracing::warn!("Ignoring invalid DTS_REQUEST_TIMEOUT_MS={v}"),
            }
        }
    }

    /// Reject settings that would only fail later at call time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("job_registry_url", &self.services.job_registry_url),
            ("scheduler_url", &self.services.scheduler_url),
            ("execution_url", &self.services.execution_url),
        ] {
            url::Url::parse(value)
                .map_err(|e| ConfigError::Invalid(format!("services.{name} {value:?}: {e}")))?;
        }
        if self.services.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "services.request_timeout_ms must be positive".into(),
            ));
        }
        if self.server.fire_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.fire_interval_secs must be positive".into(),
            ));
        }
        self.server
            .capacity
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("server.capacity: {e}")))
    }

    /// Database path, defaulting into the config directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.server.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(ensure_config_dir()?.join("dts.db")),
        }
    }
}

/// Resolve the dts config directory (~/.dts/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".dts"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.dts/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from the default path, then apply environment overrides.
pub fn load_config() -> Result<DtsConfig, ConfigError> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let path = config_file_path()?;
    let mut config = load_config_from(&path)?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<DtsConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(DtsConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: DtsConfig = json5::from_str(&content)?;
    Ok(config)
}

/// Ensure the config directory exists.
pub fn ensure_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = config_dir()?;
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(dir)
}
