use anyhow::{Context, Result};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{
    audio::{player::ReconnectPolicy, queue::MAX_VOLUME},
    engine::LavalinkConfig,
    storage::GuildSettings,
};

/// Backend de almacenamiento para colas, configuración y estadísticas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Json,
    Memory,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(StorageBackend::Json),
            "memory" => Ok(StorageBackend::Memory),
            other => anyhow::bail!("Unknown storage backend: {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // Lavalink
    pub lavalink_host: String,
    pub lavalink_port: u16,
    pub lavalink_password: String,
    pub lavalink_secure: bool,

    // Almacenamiento
    pub data_dir: PathBuf,
    pub storage_backend: StorageBackend,

    // Colas
    pub default_volume: u16,
    pub max_queue_length: usize,
    pub queue_expiry: Duration,
    pub cleanup_interval: Duration,

    // Reconexión
    pub reconnect_attempts: u32,
    pub reconnect_backoff: Duration,

    // Rendimiento
    pub worker_threads: usize,
}

fn var_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default.to_string(),
    }
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var_or(key, default)
        .trim()
        .parse()
        .with_context(|| format!("Invalid value for {}", key))
}

fn duration_var(key: &str, default: &str) -> Result<Duration> {
    humantime::parse_duration(var_or(key, default).trim())
        .with_context(|| format!("Invalid duration for {}", key))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Lavalink
            lavalink_host: var_or("LAVALINK_HOST", "localhost"),
            lavalink_port: parse_var("LAVALINK_PORT", "2333")?,
            lavalink_password: var_or("LAVALINK_PASSWORD", "youshallnotpass"),
            lavalink_secure: parse_var("LAVALINK_SECURE", "false")?,

            // Almacenamiento
            data_dir: var_or("DATA_DIR", "./data").into(),
            storage_backend: var_or("STORAGE_BACKEND", "json").parse()?,

            // Colas
            default_volume: parse_var("DEFAULT_VOLUME", "100")?,
            max_queue_length: parse_var("MAX_QUEUE_LENGTH", "1000")?,
            queue_expiry: duration_var("QUEUE_EXPIRY", "24h")?,
            cleanup_interval: duration_var("CLEANUP_INTERVAL", "1h")?,

            // Reconexión
            reconnect_attempts: parse_var("RECONNECT_ATTEMPTS", "3")?,
            reconnect_backoff: duration_var("RECONNECT_BACKOFF", "5s")?,

            // Rendimiento
            worker_threads: match env::var("WORKER_THREADS") {
                Ok(val) if !val.trim().is_empty() => val.trim().parse()?,
                _ => num_cpus::get(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// - Volume must be within `0..=1000`
    /// - Queue length, worker threads and intervals must be non-zero
    /// - At least one reconnection attempt
    pub fn validate(&self) -> Result<()> {
        if self.default_volume > MAX_VOLUME {
            anyhow::bail!(
                "Default volume must be between 0 and {}, got: {}",
                MAX_VOLUME,
                self.default_volume
            );
        }

        if self.max_queue_length == 0 {
            anyhow::bail!("Max queue length must be greater than 0");
        }

        if self.lavalink_host.trim().is_empty() {
            anyhow::bail!("Lavalink host cannot be empty");
        }

        if self.reconnect_attempts == 0 {
            anyhow::bail!("Reconnect attempts must be greater than 0");
        }

        if self.cleanup_interval.is_zero() {
            anyhow::bail!("Cleanup interval must be greater than 0");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        Ok(())
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The Lavalink password is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Lavalink: {}://{}:{}\n  \
            Storage: {:?} en {}\n  \
            Queues: {} vol, {} max, expiry {}, cleanup {}\n  \
            Reconnect: {} intentos, backoff {}\n  \
            Workers: {}",
            if self.lavalink_secure { "https" } else { "http" },
            self.lavalink_host,
            self.lavalink_port,
            self.storage_backend,
            self.data_dir.display(),
            self.default_volume,
            self.max_queue_length,
            humantime::format_duration(self.queue_expiry),
            humantime::format_duration(self.cleanup_interval),
            self.reconnect_attempts,
            humantime::format_duration(self.reconnect_backoff),
            self.worker_threads,
        )
    }

    pub fn lavalink(&self) -> LavalinkConfig {
        LavalinkConfig {
            host: self.lavalink_host.clone(),
            port: self.lavalink_port,
            password: self.lavalink_password.clone(),
            secure: self.lavalink_secure,
        }
    }

    /// Defaults for guilds that never saved their own settings.
    pub fn guild_settings(&self) -> GuildSettings {
        GuildSettings {
            max_queue_length: self.max_queue_length,
            default_volume: self.default_volume,
            ..Default::default()
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            backoff: self.reconnect_backoff,
        }
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            lavalink_host: "localhost".to_string(),
            lavalink_port: 2333,
            lavalink_password: "youshallnotpass".to_string(),
            lavalink_secure: false,

            data_dir: "./data".into(),
            storage_backend: StorageBackend::Json,

            default_volume: 100,
            max_queue_length: 1000,
            queue_expiry: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),

            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_secs(5),

            worker_threads: num_cpus::get(),
        }
    }
}
