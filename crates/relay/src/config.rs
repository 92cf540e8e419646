// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Pool sizing lives in `db::pool::PoolConfig`.

use std::{net::SocketAddr, time::Duration};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DATABASE_URL: &str = "sqlite://chat.db";
const DEFAULT_RECOVERY_WINDOW_SECS: u64 = 120;

/// Output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

impl LogFormat {
    fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Plain
        }
    }
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// SQLite connection string for the message log.
    pub database_url: String,
    /// Log filter directive (e.g. `info`, `parley_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// How long a dropped connection can be resumed with its token.
    pub recovery_window: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PARLEY_RELAY_HOST` | `0.0.0.0` |
    /// | `PARLEY_RELAY_PORT` | `3000` |
    /// | `PARLEY_RELAY_DATABASE_URL` | `sqlite://chat.db` |
    /// | `PARLEY_RELAY_LOG_FILTER` | `info` |
    /// | `PARLEY_RELAY_LOG_FORMAT` | `plain` |
    /// | `PARLEY_RELAY_RECOVERY_WINDOW_SECS` | `120` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PARLEY_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("PARLEY_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let database_url = env("PARLEY_RELAY_DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DATABASE_URL.into());

        let log_filter = env("PARLEY_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = env("PARLEY_RELAY_LOG_FORMAT")
            .map(|v| LogFormat::parse(&v))
            .unwrap_or(LogFormat::Plain);

        let recovery_window_secs = env("PARLEY_RELAY_RECOVERY_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RECOVERY_WINDOW_SECS);

        Self {
            listen_addr,
            database_url,
            log_filter,
            log_format,
            recovery_window: Duration::from_secs(recovery_window_secs),
        }
    }
}
