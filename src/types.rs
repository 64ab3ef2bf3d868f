use serde::{Deserialize, Serialize};

/// Stored webhook event. Immutable once written.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Webhook event ready to be inserted (id is assigned by the store).
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub event_type: String,
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

/// Stored visitor ping, unique per (page, ip).
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VisitorEvent {
    pub id: i64,
    #[serde(rename = "path")]
    pub page: String,
    #[serde(rename = "ref")]
    pub referrer: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: i64,
    pub hits: i64,
}

impl VisitorEvent {
    /// The visitor metadata originally submitted by the frontend.
    pub fn visitor_info(&self) -> serde_json::Value {
        self.payload
            .get("data")
            .and_then(|d| d.get("meta"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

/// Visitor ping ready to be upserted.
#[derive(Debug, Clone)]
pub struct NewVisitorEvent {
    pub page: String,
    pub referrer: Option<String>,
    pub ip: Option<String>,
    pub user_agent: String,
    pub payload: serde_json::Value,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpsertAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub action: UpsertAction,
}

/// POST /hook body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HookBody {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
}

/// POST /public body.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackBody {
    pub path: String,
    #[serde(default = "empty_object")]
    pub visitor_info: serde_json::Value,
    #[serde(default, rename = "ref")]
    pub referrer: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Query parameters accepted by the webhook event list/export/delete endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct EventQueryParams {
    pub event_type: Option<String>,
    pub user_id: Option<String>,
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
    pub q: Option<String>,
    pub offset: Option<i64>,
    /// A number, or `all` for no limit.
    pub limit: Option<String>,
    pub fmt: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

/// Query parameters accepted by the visitor list/export/delete endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct VisitorQueryParams {
    pub page: Option<String>,
    pub ip: Option<String>,
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
    pub q: Option<String>,
    #[serde(default)]
    pub include_payload: bool,
    pub offset: Option<i64>,
    pub limit: Option<String>,
    pub fmt: Option<String>,
    #[serde(default)]
    pub confirm: bool,
}

/// Envelope returned by every list endpoint.
#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub total: i64,
    pub count: usize,
    pub offset: i64,
    pub limit: i64,
    pub items: Vec<T>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub status: String,
    pub db_ok: bool,
    pub ts: i64,
}
