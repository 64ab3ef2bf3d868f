use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub visitor: VisitorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Allowed CORS origins. Empty means any origin (credentials are never allowed).
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// SQLite busy timeout applied to every connection before use.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// How long a request waits for a pooled connection before failing.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("hooklog.db")
}
fn default_pool_size() -> usize {
    8
}
fn default_busy_timeout_ms() -> u64 {
    5000
}
fn default_acquire_timeout_ms() -> u64 {
    30000
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_max_payload_bytes() -> usize {
    65536
}

/// Column used to order list and export results, newest first.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    Id,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: u32,
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,
    #[serde(default = "default_export_batch_size")]
    pub export_batch_size: usize,
    #[serde(default)]
    pub sort_key: SortKey,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            export_batch_size: default_export_batch_size(),
            sort_key: SortKey::default(),
        }
    }
}

fn default_limit() -> u32 {
    50
}
fn default_max_limit() -> u32 {
    200
}
fn default_export_batch_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct VisitorConfig {
    /// Let `visitor_info.ip` from the request body override the resolved client IP.
    /// The body is client-controlled, so enabling this allows spoofed locations.
    #[serde(default = "default_trust_client_ip")]
    pub trust_client_ip: bool,
}

impl Default for VisitorConfig {
    fn default() -> Self {
        Self {
            trust_client_ip: default_trust_client_ip(),
        }
    }
}

fn default_trust_client_ip() -> bool {
    true
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.database.pool_size == 0 {
            return Err("database.pool_size must be at least 1".to_string());
        }
        if self.query.max_limit == 0 {
            return Err("query.max_limit must be at least 1".to_string());
        }
        if self.query.default_limit == 0 || self.query.default_limit > self.query.max_limit {
            return Err(format!(
                "query.default_limit must be between 1 and query.max_limit ({})",
                self.query.max_limit
            ));
        }
        if self.query.export_batch_size == 0 {
            return Err("query.export_batch_size must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // HOOKLOG__SERVER__PORT=9000, HOOKLOG__VISITOR__TRUST_CLIENT_IP=false, ...
        builder = builder.add_source(
            Environment::with_prefix("HOOKLOG")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.query.default_limit, 50);
        assert_eq!(config.query.max_limit, 200);
        assert_eq!(config.query.sort_key, SortKey::CreatedAt);
        assert!(config.visitor.trust_client_ip);
    }

    #[test]
    fn test_default_limit_above_max_rejected() {
        let mut config = AppConfig::default();
        config.query.default_limit = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let mut config = AppConfig::default();
        config.database.pool_size = 0;
        assert!(config.validate().is_err());
    }
}
