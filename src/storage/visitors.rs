use crate::error::AppResult;
use crate::storage::collection::{json_column, Collection, Cursor, Record};
use crate::types::{NewVisitorEvent, UpsertAction, UpsertOutcome, VisitorEvent};
use rusqlite::{params, Row};

pub type VisitorStore = Collection<VisitorEvent>;

/// Stored in place of a missing IP so (page, ip) stays unique for anonymous pings.
const UNKNOWN_IP: &str = "";

impl Record for VisitorEvent {
    const NAME: &'static str = "Visitor event";
    const TABLE: &'static str = "public_events";
    const COLUMNS: &'static str = "id, page, ref, ip, user_agent, payload, created_at, hits";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let ip: String = row.get(3)?;
        Ok(VisitorEvent {
            id: row.get(0)?,
            page: row.get(1)?,
            referrer: row.get(2)?,
            ip: (ip != UNKNOWN_IP).then_some(ip),
            user_agent: row.get(4)?,
            payload: json_column(row, 5)?,
            created_at: row.get(6)?,
            hits: row.get(7)?,
        })
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

impl Collection<VisitorEvent> {
    /// Insert the ping, or overwrite the existing row for the same (page, ip).
    ///
    /// A single `INSERT .. ON CONFLICT .. RETURNING` statement, so concurrent pings for
    /// one key can never create two rows. `hits` starts at 1, which tells a fresh insert
    /// apart from an update without a second query.
    pub async fn upsert(&self, event: NewVisitorEvent) -> AppResult<UpsertOutcome> {
        let payload = event.payload.to_string();
        let ip = event.ip.unwrap_or_else(|| UNKNOWN_IP.to_string());
        let page = event.page;

        let (id, hits): (i64, i64) = self
            .interact(move |conn| {
                conn.query_row(
                    "INSERT INTO public_events (page, ref, ip, user_agent, payload, created_at, hits)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                     ON CONFLICT (page, ip) DO UPDATE SET
                        ref        = excluded.ref,
                        user_agent = excluded.user_agent,
                        payload    = excluded.payload,
                        created_at = excluded.created_at,
                        hits       = hits + 1
                     RETURNING id, hits",
                    params![
                        page,
                        event.referrer,
                        ip,
                        event.user_agent,
                        payload,
                        event.created_at,
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .await?;

        let action = if hits == 1 {
            UpsertAction::Created
        } else {
            UpsertAction::Updated
        };
        tracing::debug!(id, hits, ?action, "tracked visitor");
        Ok(UpsertOutcome { id, action })
    }
}
