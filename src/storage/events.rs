use crate::error::AppResult;
use crate::storage::collection::{json_column, Collection, Cursor, Record};
use crate::types::{NewWebhookEvent, WebhookEvent};
use rusqlite::{params, Row};

pub type EventStore = Collection<WebhookEvent>;

impl Record for WebhookEvent {
    const NAME: &'static str = "Event";
    const TABLE: &'static str = "webhook_events";
    const COLUMNS: &'static str = "id, event_type, user_id, ip, user_agent, payload, created_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(WebhookEvent {
            id: row.get(0)?,
            event_type: row.get(1)?,
            user_id: row.get(2)?,
            ip: row.get(3)?,
            user_agent: row.get(4)?,
            payload: json_column(row, 5)?,
            created_at: row.get(6)?,
        })
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

impl Collection<WebhookEvent> {
    /// Append an event and return its store-assigned id.
    pub async fn insert(&self, event: NewWebhookEvent) -> AppResult<i64> {
        let payload = event.payload.to_string();
        let id = self
            .interact(move |conn| {
                conn.query_row(
                    "INSERT INTO webhook_events (event_type, user_id, ip, user_agent, payload, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     RETURNING id",
                    params![
                        event.event_type,
                        event.user_id,
                        event.ip,
                        event.user_agent,
                        payload,
                        event.created_at,
                    ],
                    |row| row.get(0),
                )
            })
            .await?;
        tracing::debug!(id, "stored webhook event");
        Ok(id)
    }
}
