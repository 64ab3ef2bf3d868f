pub mod collection;
pub mod events;
pub mod migrations;
pub mod sqlite;
pub mod visitors;

use crate::config::DatabaseConfig;
use crate::config::QueryConfig;
use deadpool_sqlite::Pool;
use events::EventStore;
use visitors::VisitorStore;

/// Store handle shared by every request. Built once in `main` and injected via state.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
    pub events: EventStore,
    pub visitors: VisitorStore,
}

impl Store {
    pub fn new(pool: Pool, database: &DatabaseConfig, query: &QueryConfig) -> Self {
        let busy_timeout = database.busy_timeout();
        Self {
            events: EventStore::new(pool.clone(), query.sort_key, busy_timeout),
            visitors: VisitorStore::new(pool.clone(), query.sort_key, busy_timeout),
            pool,
        }
    }

    /// True when a connection can be acquired and answers a trivial query.
    pub async fn ping(&self) -> bool {
        let Ok(conn) = self.pool.get().await else {
            return false;
        };
        matches!(
            conn.interact(|conn| conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)))
                .await,
            Ok(Ok(1))
        )
    }
}
