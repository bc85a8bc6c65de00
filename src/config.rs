use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::health::BreakerConfig;
use crate::jobs::RetryPolicy;
use crate::search::FusionConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file holding jobs, chunks and provider health
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: base_dir().join("embedline.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub pool_size: usize,
    pub lease_ms: u64,
    pub poll_interval_ms: u64,
    pub reclaim_interval_ms: u64,
    pub worker_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            lease_ms: 300_000,
            poll_interval_ms: 1_000,
            reclaim_interval_ms: 30_000,
            worker_prefix: "embed-worker".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub health_check_interval_ms: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            health_check_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub enabled: bool,
    pub k: f64,
    pub alpha: Option<f64>,
    pub min_similarity: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k: 60.0,
            alpha: Some(0.3),
            min_similarity: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory laid out as `<root>/<entity_type>/<entity_id>.txt`
    pub root: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            root: base_dir().join("content"),
        }
    }
}

fn base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".embedline")
}

impl Config {
    /// Load configuration from the default path, creating it if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from(&config_path)
    }

    /// Load configuration from an explicit path, creating a default file if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let config = Config::default();
            config.save_to(config_path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(config_path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&contents)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let toml_string = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(config_path, toml_string)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .context("Could not determine home directory")?;

        Ok(home.join(".embedline").join("config.toml"))
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker.pool_size == 0 {
            anyhow::bail!("worker.pool_size must be at least 1");
        }
        if self.worker.lease_ms == 0 {
            anyhow::bail!("worker.lease_ms must be positive");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!("retry.initial_delay_ms exceeds retry.max_delay_ms");
        }
        if let Some(alpha) = self.hybrid.alpha {
            if !(0.0..=1.0).contains(&alpha) {
                anyhow::bail!("hybrid.alpha must be within [0, 1], got {}", alpha);
            }
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.worker.lease_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay_ms: self.retry.initial_delay_ms,
            max_delay_ms: self.retry.max_delay_ms,
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            cooldown: Duration::from_millis(self.breaker.cooldown_ms),
        }
    }

    pub fn fusion_config(&self) -> FusionConfig {
        FusionConfig {
            k: self.hybrid.k,
            alpha: self.hybrid.alpha,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.worker.pool_size, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.hybrid.k, 60.0);
        assert_eq!(config.hybrid.alpha, Some(0.3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.ollama.model = "mxbai-embed-large".to_string();

        let toml_string = toml::to_string(&config).unwrap();
        assert!(toml_string.contains("mxbai-embed-large"));

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(deserialized.ollama.model, "mxbai-embed-large");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("[worker]\npool_size = 8\n").unwrap();
        assert_eq!(config.worker.pool_size, 8);
        assert_eq!(config.worker.lease_ms, 300_000);
        assert_eq!(config.retry.max_delay_ms, 300_000);
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let mut config = Config::default();
        config.hybrid.alpha = Some(1.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.worker.pool_size, 2);

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.ollama.base_url, config.ollama.base_url);
    }

    #[test]
    fn test_derived_settings() {
        let config = Config::default();
        assert_eq!(config.lease_duration(), Duration::from_secs(300));
        assert_eq!(config.retry_policy().max_attempts, 3);
        assert_eq!(config.breaker_config().failure_threshold, 5);
        assert_eq!(config.fusion_config().alpha, Some(0.3));
    }
}
