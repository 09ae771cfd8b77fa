//! Configuration loading, validation, and management for Turnflow.
//!
//! Loads configuration from `~/.turnflow/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.turnflow/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model used when a conversation has no preference
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Total token window of the model; response headroom is carved from it
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Context window selection
    #[serde(default)]
    pub context: ContextConfig,

    /// Inference parameters
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Event bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Per-stage handler deadlines
    #[serde(default)]
    pub deadlines: DeadlineConfig,

    /// Per-stage worker counts
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Tool catalog settings
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Persistence backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Completion provider
    #[serde(default)]
    pub provider: ProviderConfig,
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Token ceiling for system prompt + history when a request has no override
    #[serde(default = "default_token_ceiling")]
    pub token_ceiling: u32,

    /// How many recent messages are fetched before budgeting
    #[serde(default = "default_recent_batch_size")]
    pub recent_batch_size: usize,

    /// Tokens held back when hard-truncating an oversized message
    #[serde(default = "default_truncation_reserve")]
    pub truncation_reserve_tokens: u32,
}

fn default_token_ceiling() -> u32 {
    4096
}
fn default_recent_batch_size() -> usize {
    50
}
fn default_truncation_reserve() -> u32 {
    10
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_ceiling: default_token_ceiling(),
            recent_batch_size: default_recent_batch_size(),
            truncation_reserve_tokens: default_truncation_reserve(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Offer the tool catalog to the model
    #[serde(default = "default_true")]
    pub tools_enabled: bool,

    /// Never offer less response headroom than this
    #[serde(default = "default_min_response_tokens")]
    pub min_response_tokens: u32,

    /// Never offer more response headroom than this
    #[serde(default = "default_max_response_tokens")]
    pub max_response_tokens: u32,
}

fn default_min_response_tokens() -> u32 {
    512
}
fn default_max_response_tokens() -> u32 {
    2048
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            tools_enabled: true,
            min_response_tokens: default_min_response_tokens(),
            max_response_tokens: default_max_response_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Messages buffered per queue group
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,

    /// Attempts per message before it is discarded
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u32,
}

fn default_bus_capacity() -> usize {
    1024
}
fn default_max_deliver() -> u32 {
    3
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            max_deliver: default_max_deliver(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    #[serde(default = "default_context_ms")]
    pub context_builder_ms: u64,

    #[serde(default = "default_inference_ms")]
    pub inference_executor_ms: u64,

    #[serde(default = "default_orchestrator_ms")]
    pub flow_orchestrator_ms: u64,

    #[serde(default = "default_tool_ms")]
    pub tool_runner_ms: u64,
}

fn default_context_ms() -> u64 {
    5_000
}
fn default_inference_ms() -> u64 {
    120_000
}
fn default_orchestrator_ms() -> u64 {
    5_000
}
fn default_tool_ms() -> u64 {
    30_000
}

impl DeadlineConfig {
    pub fn context_builder(&self) -> Duration {
        Duration::from_millis(self.context_builder_ms)
    }
    pub fn inference_executor(&self) -> Duration {
        Duration::from_millis(self.inference_executor_ms)
    }
    pub fn flow_orchestrator(&self) -> Duration {
        Duration::from_millis(self.flow_orchestrator_ms)
    }
    pub fn tool_runner(&self) -> Duration {
        Duration::from_millis(self.tool_runner_ms)
    }
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            context_builder_ms: default_context_ms(),
            inference_executor_ms: default_inference_ms(),
            flow_orchestrator_ms: default_orchestrator_ms(),
            tool_runner_ms: default_tool_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_workers")]
    pub context_builder: usize,

    #[serde(default = "default_workers")]
    pub inference_executor: usize,

    #[serde(default = "default_workers")]
    pub flow_orchestrator: usize,

    #[serde(default = "default_workers")]
    pub tool_runner: usize,
}

fn default_workers() -> usize {
    2
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            context_builder: default_workers(),
            inference_executor: default_workers(),
            flow_orchestrator: default_workers(),
            tool_runner: default_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// How long a fetched tool catalog stays fresh
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,

    /// Run the bundled tool runner in-process
    #[serde(default = "default_true")]
    pub run_builtin: bool,
}

fn default_catalog_ttl() -> u64 {
    300
}

impl ToolsConfig {
    pub fn catalog_ttl(&self) -> Duration {
        Duration::from_secs(self.catalog_ttl_secs)
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            catalog_ttl_secs: default_catalog_ttl(),
            run_builtin: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "sqlite" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// SQLite database path; relative paths live under the config dir
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_backend() -> String {
    "sqlite".into()
}
fn default_storage_path() -> String {
    "turnflow.db".into()
}

impl StorageConfig {
    /// Resolve the database path against the config directory.
    pub fn resolved_path(&self) -> PathBuf {
        let p = PathBuf::from(&self.path);
        if p.is_absolute() || self.path == ":memory:" {
            p
        } else {
            AppConfig::config_dir().join(p)
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_storage_path(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// OpenAI-compatible base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_provider_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            timeout_secs: default_provider_timeout(),
        }
    }
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &redact(&self.api_key))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.turnflow/config.toml).
    ///
    /// Environment overrides:
    /// - `TURNFLOW_API_KEY`, then `OPENAI_API_KEY`
    /// - `TURNFLOW_API_URL`
    /// - `TURNFLOW_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = std::env::var("TURNFLOW_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }
        if let Ok(url) = std::env::var("TURNFLOW_API_URL") {
            self.provider.api_url = url;
        }
        if let Ok(model) = std::env::var("TURNFLOW_MODEL") {
            self.default_model = model;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".turnflow")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.inference.min_response_tokens > self.inference.max_response_tokens {
            return Err(ConfigError::ValidationError(
                "inference.min_response_tokens must not exceed max_response_tokens".into(),
            ));
        }

        if self.context.recent_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "context.recent_batch_size must be > 0".into(),
            ));
        }

        if self.bus.max_deliver == 0 {
            return Err(ConfigError::ValidationError("bus.max_deliver must be > 0".into()));
        }

        if !matches!(self.storage.backend.as_str(), "sqlite" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "storage.backend must be \"sqlite\" or \"memory\", got \"{}\"",
                self.storage.backend
            )));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            default_temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            context: ContextConfig::default(),
            inference: InferenceConfig::default(),
            bus: BusConfig::default(),
            deadlines: DeadlineConfig::default(),
            workers: WorkerConfig::default(),
            tools: ToolsConfig::default(),
            storage: StorageConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for turnflow_core::Error {
    fn from(e: ConfigError) -> Self {
        turnflow_core::Error::Config {
            message: e.to_string(),
        }
    }
}
