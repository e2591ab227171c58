//! Environment-based configuration with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Complete server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logger: LoggerConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Database backend selection. Only SQLite is compiled into this build;
/// the other drivers parse but are rejected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbDriver {
    Sqlite,
    Postgres,
    Mysql,
}

impl FromStr for DbDriver {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(DbDriver::Sqlite),
            "postgres" => Ok(DbDriver::Postgres),
            "mysql" => Ok(DbDriver::Mysql),
            other => Err(format!("unsupported database driver: {other}")),
        }
    }
}

impl std::fmt::Display for DbDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DbDriver::Sqlite => "sqlite",
            DbDriver::Postgres => "postgres",
            DbDriver::Mysql => "mysql",
        };
        f.write_str(s)
    }
}

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub driver: DbDriver,
    pub dsn: String,
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// debug, info, warn, error
    pub level: String,
    /// json or console
    pub format: String,
}

impl Config {
    /// Read configuration from environment variables, falling back to
    /// defaults. Malformed values fall back rather than fail: a server
    /// that cannot parse a timeout should still come up.
    pub fn load() -> Self {
        Self {
            server: ServerConfig {
                host: get_env("SERVER_HOST", "0.0.0.0"),
                port: get_parsed_env("SERVER_PORT", 8080),
                read_timeout: get_duration_env("SERVER_READ_TIMEOUT", Duration::from_secs(15)),
                write_timeout: get_duration_env("SERVER_WRITE_TIMEOUT", Duration::from_secs(15)),
                shutdown_timeout: get_duration_env(
                    "SERVER_SHUTDOWN_TIMEOUT",
                    Duration::from_secs(10),
                ),
            },
            database: DatabaseConfig {
                driver: env::var("DB_DRIVER")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(DbDriver::Sqlite),
                dsn: get_env("DB_DSN", "kubesmith.db"),
            },
            logger: LoggerConfig {
                level: get_env("LOG_LEVEL", "info"),
                format: get_env("LOG_FORMAT", "console"),
            },
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

fn get_parsed_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_duration_env(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Parse `15s`, `2m`, `1h`, or a bare number of seconds.
fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (number, unit) = match value.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let number: u64 = number.trim().parse().ok()?;

    match unit {
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 3600)),
        "ms" => Some(Duration::from_millis(number)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("nope"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn driver_parsing() {
        assert_eq!("sqlite".parse::<DbDriver>().unwrap(), DbDriver::Sqlite);
        assert_eq!("postgres".parse::<DbDriver>().unwrap(), DbDriver::Postgres);
        assert_eq!("mysql".parse::<DbDriver>().unwrap(), DbDriver::Mysql);
        assert!("oracle".parse::<DbDriver>().is_err());
    }

    #[test]
    fn defaults_are_sensible() {
        // Environment may be dirty in CI; only check keys that are very
        // unlikely to be set.
        let config = Config::load();
        assert!(!config.server.host.is_empty());
        assert!(config.server.port > 0);
    }

    #[test]
    fn bind_addr_formatting() {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
            read_timeout: Duration::from_secs(15),
            write_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(10),
        };
        assert_eq!(server.bind_addr(), "127.0.0.1:9000");
    }
}
