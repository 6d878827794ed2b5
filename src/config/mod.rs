use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

// Главная структура конфигурации - контейнер для всех настроек
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub reservations: ReservationConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

// Настройки приложения
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub environment: String,
    pub rust_log: String,
    pub log_format: LogFormat,
}

// Настройки базы данных
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub acquire_timeout_ms: u64,
    pub lock_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Сколько транзакция ждет блокировку строки, прежде чем сдаться с конфликтом.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

// Redis опционален: без REDIS_URL кеш броней выключен
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub cache_ttl_seconds: u64,
}

// Сроки удержания брони и остановки очереди уведомлений
#[derive(Debug, Clone, Deserialize)]
pub struct ReservationConfig {
    pub hold_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub notification_shutdown_grace_ms: u64,
}

impl ReservationConfig {
    pub fn hold_ttl(&self) -> Duration {
        Duration::from_secs(self.hold_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }

    pub fn notification_shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.notification_shutdown_grace_ms)
    }
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            hold_ttl_seconds: 900,
            sweep_interval_seconds: 60,
            notification_shutdown_grace_ms: 2000,
        }
    }
}

fn parsed<T: FromStr>(name: &'static str, default: &str) -> Result<T, ConfigError> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    value
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value })
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn log_format(value: &str) -> Result<LogFormat, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "pretty" | "text" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        _ => Err(ConfigError::Invalid {
            name: "LOG_FORMAT",
            value: value.to_string(),
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = ReservationConfig::default();

        Ok(Config {
            app: AppConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: parsed("PORT", "8000")?,
                environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
                rust_log: env::var("RUST_LOG")
                    .unwrap_or_else(|_| "seat_reservation=debug,tower_http=debug".to_string()),
                log_format: log_format(
                    &env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
                )?,
            },
            database: DatabaseConfig {
                url: required("DATABASE_URL")?,
                pool_size: parsed("DB_POOL_SIZE", "20")?,
                acquire_timeout_ms: parsed("DB_ACQUIRE_TIMEOUT_MS", "5000")?,
                lock_timeout_ms: parsed("DB_LOCK_TIMEOUT_MS", "5000")?,
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
                cache_ttl_seconds: parsed("CACHE_TTL_SECONDS", "30")?,
            },
            reservations: ReservationConfig {
                hold_ttl_seconds: parsed(
                    "HOLD_TTL_SECONDS",
                    &defaults.hold_ttl_seconds.to_string(),
                )?,
                sweep_interval_seconds: parsed(
                    "SWEEP_INTERVAL_SECONDS",
                    &defaults.sweep_interval_seconds.to_string(),
                )?,
                notification_shutdown_grace_ms: parsed(
                    "NOTIFICATION_SHUTDOWN_GRACE_MS",
                    &defaults.notification_shutdown_grace_ms.to_string(),
                )?,
            },
        })
    }
}
