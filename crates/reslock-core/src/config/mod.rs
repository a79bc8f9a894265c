//! Configuration management with file persistence

use crate::locking::{BackendKind, RetryPolicy};
use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reslock configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub locker: LockerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    pub backend: BackendKind,
    pub acquire_timeout_ms: u64,
    pub file: FileConfig,
    pub redis: RedisConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub lock_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub namespace: String,
    pub lease_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    /// 0 = bounded by the acquire timeout only
    pub max_attempts: u32,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::File,
            acquire_timeout_ms: 6000,
            file: FileConfig::default(),
            redis: RedisConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            lock_dir: PathBuf::from(".reslock/locks"),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            namespace: "reslock:".to_string(),
            lease_ms: 30_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter_ms: policy.jitter.as_millis() as u64,
            max_attempts: 0,
        }
    }
}

impl LockerConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.redis.lease_ms)
    }
}

impl RetryConfig {
    /// Build the backoff policy used by the polling backends
    pub fn policy(&self) -> RetryPolicy {
        let policy = RetryPolicy {
            jitter: Duration::from_millis(self.jitter_ms),
            ..RetryPolicy::default()
        }
        .with_delays(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        );
        match self.max_attempts {
            0 => policy,
            attempts => policy.with_max_attempts(attempts),
        }
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("RESLOCK_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("reslock")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            // Return default config without creating file
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let locker = &self.locker;
        if locker.file.lock_dir.as_os_str().is_empty() {
            return Err(anyhow!("locker.file.lock_dir must not be empty"));
        }
        if locker.redis.namespace.is_empty() {
            return Err(anyhow!(
                "locker.redis.namespace must not be empty, the sweep would clear the whole database"
            ));
        }
        if locker.redis.lease_ms == 0 {
            return Err(anyhow!("locker.redis.lease_ms must be positive"));
        }
        if locker.retry.max_delay_ms < locker.retry.initial_delay_ms {
            return Err(anyhow!(
                "locker.retry.max_delay_ms must not be lower than locker.retry.initial_delay_ms"
            ));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        let locker = &self.locker;
        match key {
            "locker.backend" => Ok(locker.backend.to_string()),
            "locker.acquire_timeout_ms" => Ok(locker.acquire_timeout_ms.to_string()),

            // File backend
            "locker.file.lock_dir" => Ok(locker.file.lock_dir.display().to_string()),

            // Redis backend
            "locker.redis.url" => Ok(locker.redis.url.clone()),
            "locker.redis.namespace" => Ok(locker.redis.namespace.clone()),
            "locker.redis.lease_ms" => Ok(locker.redis.lease_ms.to_string()),

            // Backoff
            "locker.retry.initial_delay_ms" => Ok(locker.retry.initial_delay_ms.to_string()),
            "locker.retry.max_delay_ms" => Ok(locker.retry.max_delay_ms.to_string()),
            "locker.retry.jitter_ms" => Ok(locker.retry.jitter_ms.to_string()),
            "locker.retry.max_attempts" => Ok(locker.retry.max_attempts.to_string()),

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `reslock config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let locker = &mut self.locker;
        match key {
            "locker.backend" => {
                locker.backend = value.parse().map_err(|e| anyhow!("{}", e))?;
            }
            "locker.acquire_timeout_ms" => {
                locker.acquire_timeout_ms = parse_number(key, value)?;
            }

            "locker.file.lock_dir" => {
                if value.trim().is_empty() {
                    return Err(anyhow!("Lock directory must not be empty"));
                }
                locker.file.lock_dir = PathBuf::from(value);
            }

            "locker.redis.url" => {
                if !value.starts_with("redis://") && !value.starts_with("rediss://") {
                    return Err(anyhow!(
                        "Invalid redis url: {}. Expected redis:// or rediss://",
                        value
                    ));
                }
                locker.redis.url = value.to_string();
            }
            "locker.redis.namespace" => {
                if value.is_empty() {
                    return Err(anyhow!("Redis namespace must not be empty"));
                }
                locker.redis.namespace = value.to_string();
            }
            "locker.redis.lease_ms" => {
                let lease: u64 = parse_number(key, value)?;
                if lease == 0 {
                    return Err(anyhow!("Lease must be positive"));
                }
                locker.redis.lease_ms = lease;
            }

            "locker.retry.initial_delay_ms" => {
                locker.retry.initial_delay_ms = parse_number(key, value)?;
            }
            "locker.retry.max_delay_ms" => {
                locker.retry.max_delay_ms = parse_number(key, value)?;
            }
            "locker.retry.jitter_ms" => {
                locker.retry.jitter_ms = parse_number(key, value)?;
            }
            "locker.retry.max_attempts" => {
                locker.retry.max_attempts = parse_number(key, value)?;
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `reslock config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        let keys = [
            "locker.backend",
            "locker.acquire_timeout_ms",
            "locker.file.lock_dir",
            "locker.redis.url",
            "locker.redis.namespace",
            "locker.redis.lease_ms",
            "locker.retry.initial_delay_ms",
            "locker.retry.max_delay_ms",
            "locker.retry.jitter_ms",
            "locker.retry.max_attempts",
        ];

        keys.into_iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid {} value: {}", key, value))
}
