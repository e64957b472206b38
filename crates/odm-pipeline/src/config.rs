//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/odm";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default root for staging files and artifact bundles.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default webhook POST timeout in seconds.
pub const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Default number of resource pipelines run concurrently by `run-all`.
pub const DEFAULT_MAX_WORKERS: usize = 1;

/// Default schema holding destination tables.
pub const DEFAULT_LOAD_SCHEMA: &str = "core";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub notify: NotifyConfig,
    pub max_workers: usize,
    pub load_schema: String,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// Filesystem locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub artifacts_dir: PathBuf,
}

impl StorageConfig {
    /// Staging and artifact directories under `data_dir`
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            staging_dir: data_dir.join("staging"),
            artifacts_dir: data_dir.join("artifacts"),
            data_dir,
        }
    }
}

/// Webhook delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Prefix for download URLs in webhook payloads
    pub public_base_url: String,
    pub timeout_secs: u64,
}

impl NotifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            public_base_url: String::new(),
            timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let data_dir =
            PathBuf::from(std::env::var("ODM_DATA_DIR").unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string()));
        let defaults = StorageConfig::under(&data_dir);

        let config = Config {
            database: DatabaseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DATABASE_MAX_CONNECTIONS),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", DEFAULT_DATABASE_MIN_CONNECTIONS),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
            },
            storage: StorageConfig {
                staging_dir: std::env::var("ODM_STAGING_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.staging_dir),
                artifacts_dir: std::env::var("ODM_ARTIFACTS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.artifacts_dir),
                data_dir,
            },
            notify: NotifyConfig {
                public_base_url: std::env::var("ODM_PUBLIC_BASE_URL")
                    .unwrap_or_default()
                    .trim_end_matches('/')
                    .to_string(),
                timeout_secs: env_or("ODM_WEBHOOK_TIMEOUT_SECS", DEFAULT_WEBHOOK_TIMEOUT_SECS),
            },
            max_workers: env_or("ODM_MAX_WORKERS", DEFAULT_MAX_WORKERS),
            load_schema: std::env::var("ODM_LOAD_SCHEMA")
                .unwrap_or_else(|_| DEFAULT_LOAD_SCHEMA.to_string()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.max_workers == 0 {
            anyhow::bail!("ODM_MAX_WORKERS must be at least 1");
        }

        // every worker holds its own connection
        if (self.database.max_connections as usize) < self.max_workers {
            anyhow::bail!(
                "Database max_connections ({}) must be at least ODM_MAX_WORKERS ({})",
                self.database.max_connections,
                self.max_workers
            );
        }

        if self.notify.timeout_secs == 0 {
            anyhow::bail!("ODM_WEBHOOK_TIMEOUT_SECS must be greater than 0");
        }

        if !is_identifier(&self.load_schema) {
            anyhow::bail!("ODM_LOAD_SCHEMA '{}' is not a valid identifier", self.load_schema);
        }

        Ok(())
    }

    /// Worker count for `run-all`, capped by the connection pool size
    pub fn workers(&self, requested: Option<usize>) -> usize {
        let pool = self.database.max_connections as usize;
        let workers = requested.unwrap_or(self.max_workers).max(1);
        if workers > pool {
            warn!(
                requested = workers,
                max_connections = pool,
                "More workers than database connections, capping to the pool size"
            );
            return pool;
        }
        workers
    }
}

/// Plain SQL identifier: letters, digits and underscores, not starting with a digit
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: 4,
                min_connections: 1,
                connect_timeout_secs: 5,
            },
            storage: StorageConfig::under("/tmp/odm"),
            notify: NotifyConfig::default(),
            max_workers: 2,
            load_schema: "core".to_string(),
        }
    }

    #[test]
    fn test_storage_layout() {
        let storage = StorageConfig::under("/srv/odm");
        assert_eq!(storage.staging_dir, PathBuf::from("/srv/odm/staging"));
        assert_eq!(storage.artifacts_dir, PathBuf::from("/srv/odm/artifacts"));
    }

    #[test]
    fn test_validate() {
        assert!(config().validate().is_ok());

        let mut c = config();
        c.max_workers = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.max_workers = 8;
        assert!(c.validate().is_err());

        let mut c = config();
        c.notify.timeout_secs = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.load_schema = "core; drop".to_string();
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_workers_capped_by_pool() {
        let c = config();
        assert_eq!(c.workers(None), 2);
        assert_eq!(c.workers(Some(3)), 3);
        assert_eq!(c.workers(Some(64)), 4);
        assert_eq!(c.workers(Some(0)), 1);
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("orders_2024"));
        assert!(is_identifier("_tmp"));
        assert!(!is_identifier("2024_orders"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
