use crate::config::SortKey;
use crate::error::{AppError, AppResult};
use crate::query::filter::{Condition, FilterSpec, Limit, Pagination};
use crate::storage::sqlite::apply_connection_pragmas;
use deadpool_sqlite::Pool;
use futures::stream::{self, Stream};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, Row};
use std::marker::PhantomData;
use std::time::Duration;

/// Position of a record in the newest-first ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: i64,
    pub id: i64,
}

/// A row type stored in its own table.
pub trait Record: Sized + Send + 'static {
    /// Human-readable name used in error messages.
    const NAME: &'static str;
    const TABLE: &'static str;
    const COLUMNS: &'static str;

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
    fn cursor(&self) -> Cursor;
}

/// Parse a JSON document stored as TEXT.
pub(crate) fn json_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// WHERE clause under construction, with positional parameters.
#[derive(Debug, Default)]
pub(crate) struct SqlWhere {
    clauses: Vec<String>,
    values: Vec<Value>,
}

impl SqlWhere {
    pub(crate) fn from_filter(filter: &FilterSpec) -> Self {
        let mut sql = Self::default();
        for condition in filter.conditions() {
            match condition {
                Condition::Equals { field, value } => {
                    let n = sql.bind(Value::Text(value.clone()));
                    sql.clauses.push(format!("{} = ?{n}", field.column()));
                }
                Condition::Range { field, from, to } => {
                    if let Some(from) = from {
                        let n = sql.bind(Value::Integer(*from));
                        sql.clauses.push(format!("{} >= ?{n}", field.column()));
                    }
                    if let Some(to) = to {
                        let n = sql.bind(Value::Integer(*to));
                        sql.clauses.push(format!("{} <= ?{n}", field.column()));
                    }
                }
                Condition::Contains { fields, needle } => {
                    if fields.is_empty() {
                        continue;
                    }
                    let n = sql.bind(Value::Text(format!("%{}%", escape_like(needle))));
                    let any = fields
                        .iter()
                        .map(|f| format!("{} LIKE ?{n} ESCAPE '\\'", f.column()))
                        .collect::<Vec<_>>()
                        .join(" OR ");
                    sql.clauses.push(format!("({any})"));
                }
            }
        }
        sql
    }

    /// Bind a value and return its 1-based parameter index.
    pub(crate) fn bind(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len()
    }

    pub(crate) fn push(&mut self, clause: String) {
        self.clauses.push(clause);
    }

    pub(crate) fn to_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    pub(crate) fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// SQLite LIKE is case-insensitive for ASCII; escape its wildcards so `q` matches literally.
fn escape_like(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len());
    for c in needle.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn order_by(sort: SortKey) -> &'static str {
    match sort {
        SortKey::CreatedAt => " ORDER BY created_at DESC, id DESC",
        SortKey::Id => " ORDER BY id DESC",
    }
}

/// Typed handle on one table. Cheap to clone: the pool is reference counted.
pub struct Collection<R> {
    pool: Pool,
    sort: SortKey,
    busy_timeout: Duration,
    _record: PhantomData<fn() -> R>,
}

impl<R> Clone for Collection<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            sort: self.sort,
            busy_timeout: self.busy_timeout,
            _record: PhantomData,
        }
    }
}

impl<R: Record> Collection<R> {
    pub fn new(pool: Pool, sort: SortKey, busy_timeout: Duration) -> Self {
        Self {
            pool,
            sort,
            busy_timeout,
            _record: PhantomData,
        }
    }

    /// Run `f` on a pooled connection. Acquiring the connection is bounded by the pool
    /// timeouts and every statement by the SQLite busy timeout. Per-connection PRAGMAs
    /// are applied on every call.
    pub(crate) async fn interact<T, F>(&self, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.pool.get().await?;
        let busy_timeout = self.busy_timeout;
        let result = conn
            .interact(move |conn| {
                apply_connection_pragmas(conn, busy_timeout)?;
                f(conn)
            })
            .await??;
        Ok(result)
    }

    fn count_query(filter: &FilterSpec) -> (String, Vec<Value>) {
        let filter_sql = SqlWhere::from_filter(filter);
        let sql = format!("SELECT COUNT(*) FROM {}{}", R::TABLE, filter_sql.to_sql());
        (sql, filter_sql.into_values())
    }

    fn list_query(&self, filter: &FilterSpec, page: Pagination) -> (String, Vec<Value>) {
        let mut filter_sql = SqlWhere::from_filter(filter);
        let limit = match page.limit {
            Limit::Bounded(n) => n as i64,
            // SQLite treats a negative LIMIT as unbounded.
            Limit::All => -1,
        };
        let limit_n = filter_sql.bind(Value::Integer(limit));
        let offset_n = filter_sql.bind(Value::Integer(page.offset));
        let sql = format!(
            "SELECT {} FROM {}{}{} LIMIT ?{limit_n} OFFSET ?{offset_n}",
            R::COLUMNS,
            R::TABLE,
            filter_sql.to_sql(),
            order_by(self.sort),
        );
        (sql, filter_sql.into_values())
    }

    pub async fn count(&self, filter: &FilterSpec) -> AppResult<i64> {
        let (sql, values) = Self::count_query(filter);
        self.interact(move |conn| {
            conn.query_row(&sql, params_from_iter(values), |row| row.get(0))
        })
        .await
    }

    /// One page of matching records, newest first.
    pub async fn list(&self, filter: &FilterSpec, page: Pagination) -> AppResult<Vec<R>> {
        let (sql, values) = self.list_query(filter, page);
        self.interact(move |conn| select_rows(conn, &sql, values)).await
    }

    /// Total match count and one page, read inside a single transaction so both
    /// see the same snapshot.
    pub async fn list_page(
        &self,
        filter: &FilterSpec,
        page: Pagination,
    ) -> AppResult<(i64, Vec<R>)> {
        let (count_sql, count_values) = Self::count_query(filter);
        let (list_sql, list_values) = self.list_query(filter, page);
        self.interact(move |conn| {
            let tx = conn.transaction()?;
            let total =
                tx.query_row(&count_sql, params_from_iter(count_values), |row| row.get(0))?;
            let rows = select_rows(&tx, &list_sql, list_values)?;
            tx.commit()?;
            Ok((total, rows))
        })
        .await
    }

    pub async fn find_by_id(&self, id: i64) -> AppResult<Option<R>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?1", R::COLUMNS, R::TABLE);
        self.interact(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query_map([id], R::from_row)?;
            rows.next().transpose()
        })
        .await
    }

    /// Every matching record in list order, fetched in batches of `batch_size` using
    /// keyset pagination so only one batch is held in memory at a time.
    pub fn export(
        &self,
        filter: FilterSpec,
        batch_size: usize,
    ) -> impl Stream<Item = AppResult<Vec<R>>> + Send + 'static {
        let collection = self.clone();
        let batch_size = batch_size.max(1);
        stream::try_unfold(ExportState::Start, move |state| {
            next_batch(collection.clone(), filter.clone(), state, batch_size)
        })
    }

    async fn page_after(
        &self,
        filter: FilterSpec,
        after: Option<Cursor>,
        batch_size: usize,
    ) -> AppResult<Vec<R>> {
        let mut filter_sql = SqlWhere::from_filter(&filter);
        if let Some(cursor) = after {
            let id_n = filter_sql.bind(Value::Integer(cursor.id));
            match self.sort {
                SortKey::CreatedAt => {
                    let ts_n = filter_sql.bind(Value::Integer(cursor.created_at));
                    filter_sql.push(format!(
                        "(created_at < ?{ts_n} OR (created_at = ?{ts_n} AND id < ?{id_n}))"
                    ));
                }
                SortKey::Id => filter_sql.push(format!("id < ?{id_n}")),
            }
        }
        let limit_n = filter_sql.bind(Value::Integer(batch_size as i64));
        let sql = format!(
            "SELECT {} FROM {}{}{} LIMIT ?{limit_n}",
            R::COLUMNS,
            R::TABLE,
            filter_sql.to_sql(),
            order_by(self.sort),
        );
        let values = filter_sql.into_values();

        self.interact(move |conn| select_rows(conn, &sql, values)).await
    }

    /// Delete one record; `NotFound` when no row has this id.
    pub async fn delete_by_id(&self, id: i64) -> AppResult<usize> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", R::TABLE);
        let deleted = self
            .interact(move |conn| conn.execute(&sql, [id]))
            .await?;
        if deleted == 0 {
            return Err(AppError::NotFound(format!("{} not found", R::NAME)));
        }
        tracing::info!(table = R::TABLE, id, "deleted record");
        Ok(deleted)
    }

    /// Delete every record matching `filter`. Refuses to run unless `confirm` is set,
    /// since an empty filter matches the whole table.
    pub async fn delete_by_filter(&self, filter: &FilterSpec, confirm: bool) -> AppResult<usize> {
        if !confirm {
            return Err(AppError::Unconfirmed(
                "Set confirm=true to execute delete".to_string(),
            ));
        }
        let filter_sql = SqlWhere::from_filter(filter);
        let sql = format!("DELETE FROM {}{}", R::TABLE, filter_sql.to_sql());
        let values = filter_sql.into_values();

        let deleted = self
            .interact(move |conn| conn.execute(&sql, params_from_iter(values)))
            .await?;
        tracing::info!(table = R::TABLE, deleted, "bulk delete");
        Ok(deleted)
    }
}

fn select_rows<R: Record>(
    conn: &Connection,
    sql: &str,
    values: Vec<Value>,
) -> rusqlite::Result<Vec<R>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values), R::from_row)?;
    rows.collect()
}

enum ExportState {
    Start,
    After(Cursor),
    Done,
}

async fn next_batch<R: Record>(
    collection: Collection<R>,
    filter: FilterSpec,
    state: ExportState,
    batch_size: usize,
) -> AppResult<Option<(Vec<R>, ExportState)>> {
    let after = match state {
        ExportState::Start => None,
        ExportState::After(cursor) => Some(cursor),
        ExportState::Done => return Ok(None),
    };

    let batch = collection.page_after(filter, after, batch_size).await?;
    let next = match batch.last() {
        None => return Ok(None),
        Some(_) if batch.len() < batch_size => ExportState::Done,
        Some(last) => ExportState::After(last.cursor()),
    };
    Ok(Some((batch, next)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::filter::{Field, EVENT_SEARCH_FIELDS};

    #[test]
    fn test_empty_filter_has_no_where() {
        let sql = SqlWhere::from_filter(&FilterSpec::new());
        assert_eq!(sql.to_sql(), "");
        assert!(sql.into_values().is_empty());
    }

    #[test]
    fn test_filter_translation() {
        let filter = FilterSpec::new()
            .equals(Field::EventType, "login")
            .range(Field::CreatedAt, Some(10), Some(20))
            .contains(EVENT_SEARCH_FIELDS, "50%_off");
        let sql = SqlWhere::from_filter(&filter);
        assert_eq!(
            sql.to_sql(),
            " WHERE event_type = ?1 AND created_at >= ?2 AND created_at <= ?3 \
             AND (payload LIKE ?4 ESCAPE '\\' OR user_agent LIKE ?4 ESCAPE '\\')"
        );
        assert_eq!(
            sql.into_values(),
            vec![
                Value::Text("login".to_string()),
                Value::Integer(10),
                Value::Integer(20),
                Value::Text("%50\\%\\_off%".to_string()),
            ]
        );
    }

    #[test]
    fn test_open_range_binds_one_bound() {
        let filter = FilterSpec::new().range(Field::CreatedAt, None, Some(99));
        let sql = SqlWhere::from_filter(&filter);
        assert_eq!(sql.to_sql(), " WHERE created_at <= ?1");
    }

    #[tokio::test]
    async fn test_every_pooled_connection_gets_pragmas() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let database = crate::config::DatabaseConfig {
            path: tmp.path().to_path_buf(),
            pool_size: 4,
            ..Default::default()
        };
        let pool = crate::storage::sqlite::create_pool(&database).unwrap();
        crate::storage::sqlite::init_pool(&pool).await.unwrap();
        let events: Collection<crate::types::WebhookEvent> =
            Collection::new(pool, SortKey::CreatedAt, database.busy_timeout());

        // Hold each connection briefly so the calls spread over the whole pool.
        let calls = (0..4).map(|_| {
            events.interact(|conn| {
                std::thread::sleep(Duration::from_millis(50));
                let synchronous: i64 =
                    conn.query_row("PRAGMA synchronous", [], |row| row.get(0))?;
                let temp_store: i64 = conn.query_row("PRAGMA temp_store", [], |row| row.get(0))?;
                Ok((synchronous, temp_store))
            })
        });
        for result in futures::future::join_all(calls).await {
            // NORMAL = 1, MEMORY = 2
            assert_eq!(result.unwrap(), (1, 2));
        }
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a\\b"), "a\\\\b");
        assert_eq!(escape_like("plain"), "plain");
    }
}
