use crate::config::DatabaseConfig;
use deadpool_sqlite::{Config, Pool, PoolConfig, Runtime, Timeouts};
use rusqlite::Connection;
use std::time::Duration;

/// Settings SQLite keeps per connection, so every pooled connection needs them.
const CONNECTION_PRAGMAS: &str = "
    PRAGMA synchronous = NORMAL;
    PRAGMA cache_size = -16384;
    PRAGMA temp_store = MEMORY;
    PRAGMA wal_autocheckpoint = 1000;
";

/// Database-wide PRAGMAs (persisted in the file) plus the per-connection ones.
pub fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch(CONNECTION_PRAGMAS)
}

/// Prepare a pooled connection for use.
pub fn apply_connection_pragmas(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(CONNECTION_PRAGMAS)
}

/// Create a deadpool-sqlite connection pool. Every pool operation is bounded by the
/// configured acquire timeout so no request waits forever on a saturated pool.
pub fn create_pool(config: &DatabaseConfig) -> Result<Pool, deadpool_sqlite::CreatePoolError> {
    let db_path = config.path.clone();

    // Set restrictive file permissions on the database file (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if db_path.exists() {
            if let Err(e) =
                std::fs::set_permissions(&db_path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(error = %e, "failed to set database file permissions");
            }
        }
    }

    let mut timeouts = Timeouts::default();
    timeouts.wait = Some(config.acquire_timeout());
    timeouts.create = Some(config.acquire_timeout());
    timeouts.recycle = Some(config.acquire_timeout());

    let mut pool_config = PoolConfig::new(config.pool_size);
    pool_config.timeouts = timeouts;

    let mut cfg = Config::new(db_path);
    cfg.pool = Some(pool_config);
    cfg.create_pool(Runtime::Tokio1)
}

/// Initialize the pool: get a connection and apply pragmas + run migrations.
pub async fn init_pool(pool: &Pool) -> Result<(), Box<dyn std::error::Error>> {
    let conn = pool.get().await?;
    conn.interact(|conn| {
        apply_pragmas(conn)?;
        crate::storage::migrations::run_migrations(conn)?;
        Ok::<_, rusqlite::Error>(())
    })
    .await
    .map_err(|e| format!("interact error: {e}"))??;
    Ok(())
}
