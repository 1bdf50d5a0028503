use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub port: u16,

    pub pool: PoolConfig,
    pub retry_defaults: RetryDefaultsConfig,
    pub scheduler: SchedulerConfig,
    pub network_monitor: NetworkMonitorConfig,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub enabled: bool,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub health_check_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryDefaultsConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
    pub wait_for_network: bool,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_timezone: String,
}

#[derive(Debug, Clone)]
pub struct NetworkMonitorConfig {
    pub probe_hosts: Vec<(String, u16)>,
    pub poll_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,

            pool: PoolConfig {
                enabled: parse_bool_env("POOL_ENABLED", true),
                max_connections: parse_env("POOL_MAX_CONNECTIONS", 8)?,
                idle_timeout: Duration::from_secs(parse_env("POOL_IDLE_TIMEOUT_SECS", 300)?),
                health_check_interval: Duration::from_secs(parse_env(
                    "POOL_HEALTH_CHECK_INTERVAL_SECS",
                    60,
                )?),
            },

            retry_defaults: RetryDefaultsConfig {
                max_attempts: parse_env("RETRY_MAX_ATTEMPTS", 5)?,
                initial_delay: Duration::from_millis(parse_env("RETRY_INITIAL_DELAY_MS", 500)?),
                max_delay: Duration::from_millis(parse_env("RETRY_MAX_DELAY_MS", 60_000)?),
                multiplier: env::var("RETRY_MULTIPLIER")
                    .unwrap_or_else(|_| "2.0".to_string())
                    .parse()
                    .context("RETRY_MULTIPLIER must be a float")?,
                jitter: parse_bool_env("RETRY_JITTER", true),
                wait_for_network: parse_bool_env("RETRY_WAIT_FOR_NETWORK", true),
            },

            scheduler: SchedulerConfig {
                default_timezone: env::var("SCHEDULER_DEFAULT_TIMEZONE")
                    .unwrap_or_else(|_| "UTC".to_string()),
            },

            network_monitor: NetworkMonitorConfig {
                probe_hosts: parse_probe_hosts(
                    &env::var("NETWORK_PROBE_HOSTS")
                        .unwrap_or_else(|_| "1.1.1.1:53,1.1.1.1:443".to_string()),
                )?,
                poll_interval: Duration::from_millis(parse_env(
                    "NETWORK_POLL_INTERVAL_MS",
                    1_000,
                )?),
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v.parse().map_err(|e| anyhow::anyhow!("{key} invalid: {e}")),
        Err(_) => Ok(default),
    }
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

fn parse_probe_hosts(raw: &str) -> Result<Vec<(String, u16)>> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|entry| {
            let (host, port) = entry
                .trim()
                .rsplit_once(':')
                .context("NETWORK_PROBE_HOSTS entries must be host:port")?;
            Ok((host.to_string(), port.parse().context("invalid port")?))
        })
        .collect()
}
