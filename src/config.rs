//! Configuration loading and defaults for threadrun.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::run_coordinator::RunPolicy;
use crate::thread_store::DEFAULT_CACHE_CAPACITY;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 2024;
pub const DEFAULT_MODEL: &str = "deepseek-chat";
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly, helpful AI assistant.";

// === Types ===

/// Which language-model provider serves runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    DeepSeek,
    Mock,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "deepseek" | "openai" => Some(ProviderKind::DeepSeek),
            "mock" => Some(ProviderKind::Mock),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::DeepSeek => "deepseek",
            ProviderKind::Mock => "mock",
        }
    }
}

/// Raw retry configuration loaded from config files.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy with defaults applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl RetryPolicy {
    /// Compute the backoff delay for a retry attempt.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        let delay = if delay.is_nan() { 0.0 } else { delay.clamp(0.0, 300.0) };
        std::time::Duration::from_secs_f64(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
        }
    }
}

/// Server configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_path: Option<String>,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Prepended to every prompt. Empty disables it.
    pub system_prompt: Option<String>,
    pub run_policy: Option<String>,
    pub cors_origins: Option<Vec<String>>,
    /// Threads kept in the in-memory cache.
    pub cache_capacity: Option<usize>,
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Load configuration from disk and merge with environment overrides.
    ///
    /// Path resolution: explicit `path`, then `$THREADRUN_CONFIG_PATH`, then
    /// `~/.threadrun/config.toml`. A missing file yields defaults.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = resolve_load_config_path(path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                Self::from_toml(&contents, profile)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            _ => Config::default(),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document and select `profile` from its `[profiles]` table.
    pub fn from_toml(contents: &str, profile: Option<&str>) -> Result<Self> {
        let parsed: ConfigFile = toml::from_str(contents)?;
        apply_profile(parsed, profile)
    }

    /// Validate field values that have a fixed domain.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("api_key cannot be empty string");
        }
        if let Some(provider) = self.provider.as_deref()
            && ProviderKind::parse(provider).is_none()
        {
            anyhow::bail!("Invalid provider '{provider}': expected deepseek or mock.");
        }
        if let Some(policy) = self.run_policy.as_deref()
            && RunPolicy::parse(policy).is_none()
        {
            anyhow::bail!("Invalid run_policy '{policy}': expected reject or queue.");
        }
        if let Some(temperature) = self.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            anyhow::bail!("Invalid temperature {temperature}: expected a value in [0, 2].");
        }
        if self.max_tokens == Some(0) {
            anyhow::bail!("max_tokens must be greater than zero");
        }
        if self.port == Some(0) {
            anyhow::bail!("port must be greater than zero");
        }
        if self.cache_capacity == Some(0) {
            anyhow::bail!("cache_capacity must be greater than zero");
        }
        if let Some(model) = self.model.as_deref()
            && model.trim().is_empty()
        {
            anyhow::bail!("model cannot be empty string");
        }
        Ok(())
    }

    #[must_use]
    pub fn host(&self) -> String {
        self.host
            .clone()
            .filter(|host| !host.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// Resolve the SQLite database path.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .as_deref()
            .map(expand_path)
            .or_else(default_database_path)
            .unwrap_or_else(|| PathBuf::from("threads.sqlite"))
    }

    #[must_use]
    pub fn provider(&self) -> ProviderKind {
        self.provider
            .as_deref()
            .and_then(ProviderKind::parse)
            .unwrap_or(ProviderKind::DeepSeek)
    }

    /// Return the `DeepSeek` base URL (normalized).
    #[must_use]
    pub fn deepseek_base_url(&self) -> String {
        let base = self
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        normalize_base_url(&base)
    }

    /// Read the `DeepSeek` API key from config/environment.
    pub fn deepseek_api_key(&self) -> Result<String> {
        if let Some(configured) = self.api_key.clone()
            && !configured.trim().is_empty()
        {
            return Ok(configured);
        }

        anyhow::bail!(
            "DeepSeek API key not found. Set it using one of these methods:\n\
             1. Set DEEPSEEK_API_KEY environment variable (recommended)\n\
             2. Add 'api_key = \"your-key\"' to ~/.threadrun/config.toml\n\
             3. Start with --mock to serve canned replies without a provider"
        )
    }

    #[must_use]
    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    #[must_use]
    pub fn temperature(&self) -> f32 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    #[must_use]
    pub fn max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    #[must_use]
    pub fn system_prompt(&self) -> Option<String> {
        match self.system_prompt.as_deref() {
            Some(prompt) if prompt.trim().is_empty() => None,
            Some(prompt) => Some(prompt.to_string()),
            None => Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        }
    }

    #[must_use]
    pub fn run_policy(&self) -> RunPolicy {
        self.run_policy
            .as_deref()
            .and_then(RunPolicy::parse)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY)
    }

    /// Allowed CORS origins. Empty means any origin.
    #[must_use]
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_origins
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty() && origin != "*")
            .collect()
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();

        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

// === Defaults ===

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".threadrun").join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("THREADRUN_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(expand_path(trimmed));
        }
    }
    None
}

fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".threadrun").join("threads.sqlite"))
}

/// The config file `Config::load` would read for `path`, if any.
pub fn resolve_load_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(match path.to_str() {
            Some(raw) => expand_path(raw),
            None => path,
        });
    }
    env_config_path().or_else(home_config_path)
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(value) = lookup("DEEPSEEK_API_KEY")
        && !value.trim().is_empty()
    {
        config.api_key = Some(value);
    }
    if let Some(value) = lookup("DEEPSEEK_BASE_URL") {
        config.base_url = Some(value);
    }
    if let Some(value) = lookup("DEEPSEEK_MODEL") {
        config.model = Some(value);
    }
    if let Some(value) = lookup("THREADRUN_HOST") {
        config.host = Some(value);
    }
    if let Some(value) = lookup("THREADRUN_PORT")
        && let Ok(parsed) = value.trim().parse::<u16>()
    {
        config.port = Some(parsed);
    }
    if let Some(value) = lookup("THREADRUN_DB_PATH") {
        config.database_path = Some(value);
    }
    if let Some(value) = lookup("THREADRUN_PROVIDER").or_else(|| lookup("MODEL_PROVIDER")) {
        config.provider = Some(value);
    }
    if let Some(value) = lookup("THREADRUN_RUN_POLICY") {
        config.run_policy = Some(value);
    }
}

fn normalize_base_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    if trimmed.contains("api.deepseek.com") {
        return trimmed.trim_end_matches("/v1").to_string();
    }
    trimmed.to_string()
}

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    keys.join(", ")
                })
                .filter(|keys| !keys.is_empty())
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
        }
    }
}

fn merge_config(base: Config, override_cfg: Config) -> Config {
    Config {
        host: override_cfg.host.or(base.host),
        port: override_cfg.port.or(base.port),
        database_path: override_cfg.database_path.or(base.database_path),
        provider: override_cfg.provider.or(base.provider),
        api_key: override_cfg.api_key.or(base.api_key),
        base_url: override_cfg.base_url.or(base.base_url),
        model: override_cfg.model.or(base.model),
        temperature: override_cfg.temperature.or(base.temperature),
        max_tokens: override_cfg.max_tokens.or(base.max_tokens),
        system_prompt: override_cfg.system_prompt.or(base.system_prompt),
        run_policy: override_cfg.run_policy.or(base.run_policy),
        cors_origins: override_cfg.cors_origins.or(base.cors_origins),
        cache_capacity: override_cfg.cache_capacity.or(base.cache_capacity),
        retry: override_cfg.retry.or(base.retry),
    }
}
