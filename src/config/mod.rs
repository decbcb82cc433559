/// Configuration management for the Flowrunner engine
///
/// Handles server configuration, database connection, scheduler tuning and
/// the optional mail relay.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Execution and reconciliation tuning
    pub scheduler: SchedulerConfig,
    /// Outbound mail relay
    pub mail: MailConfig,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx SQLite URL (default: "sqlite://data/flowrunner.db")
    pub url: String,
    /// Connection pool size
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between reconciliation passes
    pub reconcile_interval_secs: u64,
    /// Upper bound on runs executing at the same time
    pub max_concurrent_runs: usize,
    /// Mark runs left `running` by a previous process as failed on startup
    pub recover_stale_runs: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailConfig {
    /// HTTP relay endpoint; email nodes simulate sends when unset
    pub endpoint: Option<String>,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWRUNNER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("FLOWRUNNER_PORT", 3004),
            },
            database: DatabaseConfig {
                url: std::env::var("FLOWRUNNER_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/flowrunner.db".to_string()),
                max_connections: env_parse("FLOWRUNNER_DB_MAX_CONNECTIONS", 5),
            },
            scheduler: SchedulerConfig {
                reconcile_interval_secs: env_parse("FLOWRUNNER_RECONCILE_INTERVAL_SECS", 300),
                max_concurrent_runs: env_parse("FLOWRUNNER_MAX_CONCURRENT_RUNS", 32),
                recover_stale_runs: env_parse("FLOWRUNNER_RECOVER_STALE_RUNS", true),
            },
            mail: MailConfig {
                endpoint: std::env::var("FLOWRUNNER_MAIL_ENDPOINT")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
            },
            log_level: std::env::var("FLOWRUNNER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Read and parse an env var, falling back on absence or parse failure
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparsable_values_fall_back() {
        std::env::set_var("FLOWRUNNER_TEST_PORT_GARBAGE", "not-a-port");
        assert_eq!(env_parse("FLOWRUNNER_TEST_PORT_GARBAGE", 3004u16), 3004);
        assert!(env_parse("FLOWRUNNER_TEST_UNSET_KEY", true));
    }
}
