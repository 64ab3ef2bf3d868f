use crate::app::AppState;
use crate::error::{AppError, AppResult, LoggedQuery};
use crate::query::export::{export_response, ExportFormat, ExportRow};
use crate::query::filter::{build_event_filter, build_visitor_filter, Pagination};
use crate::types::{
    EventQueryParams, HealthResponse, ListResponse, VisitorQueryParams, WebhookEvent,
};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

/// Ids are assigned from 1; anything else can never match a record.
fn parse_id(raw: &str) -> AppResult<i64> {
    match raw.trim().parse::<i64>() {
        Ok(id) if id >= 1 => Ok(id),
        _ => Err(AppError::Validation(format!(
            "id must be a positive integer, got {raw:?}"
        ))),
    }
}

/// GET / - Liveness plus a store round-trip.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db_ok = state.store.ping().await;
    Json(HealthResponse {
        ok: true,
        status: if db_ok {
            "ok".into()
        } else {
            "degraded".into()
        },
        db_ok,
        ts: chrono::Utc::now().timestamp(),
    })
}

/// GET /events - Paginated webhook events, newest first.
pub async fn list_events(
    State(state): State<Arc<AppState>>,
    LoggedQuery(params): LoggedQuery<EventQueryParams>,
) -> AppResult<Json<ListResponse<WebhookEvent>>> {
    let page = Pagination::parse(params.offset, params.limit.as_deref(), &state.config.query)?;
    let filter = build_event_filter(&params);
    let (total, items) = state.store.events.list_page(&filter, page).await?;

    Ok(Json(ListResponse {
        total,
        count: items.len(),
        offset: page.offset,
        limit: page.effective_limit(total),
        items,
    }))
}

/// GET /events/export - Every matching webhook event as JSON or CSV.
pub async fn export_events(
    State(state): State<Arc<AppState>>,
    LoggedQuery(params): LoggedQuery<EventQueryParams>,
) -> AppResult<Response> {
    let format = ExportFormat::parse(params.fmt.as_deref())?;
    let filter = build_event_filter(&params);
    tracing::info!(?format, conditions = filter.conditions().len(), "exporting webhook events");
    export_response(
        &state.store.events,
        filter,
        format,
        false,
        state.config.query.export_batch_size,
        "events_export",
    )
    .await
}

/// DELETE /events/{id}
pub async fn delete_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let id = parse_id(&id)?;
    let deleted = state.store.events.delete_by_id(id).await?;
    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

/// DELETE /events - Bulk delete by filter; requires `confirm=true`.
pub async fn delete_events(
    State(state): State<Arc<AppState>>,
    LoggedQuery(params): LoggedQuery<EventQueryParams>,
) -> AppResult<Json<serde_json::Value>> {
    let filter = build_event_filter(&params);
    let deleted = state
        .store
        .events
        .delete_by_filter(&filter, params.confirm)
        .await?;
    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

/// GET /public - Paginated visitor pings, newest first.
pub async fn list_visitors(
    State(state): State<Arc<AppState>>,
    LoggedQuery(params): LoggedQuery<VisitorQueryParams>,
) -> AppResult<Json<ListResponse<serde_json::Value>>> {
    let page = Pagination::parse(params.offset, params.limit.as_deref(), &state.config.query)?;
    let filter = build_visitor_filter(&params);
    let (total, rows) = state.store.visitors.list_page(&filter, page).await?;
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| row.json_item(params.include_payload))
        .collect::<AppResult<_>>()?;

    Ok(Json(ListResponse {
        total,
        count: items.len(),
        offset: page.offset,
        limit: page.effective_limit(total),
        items,
    }))
}

/// GET /public/export
pub async fn export_visitors(
    State(state): State<Arc<AppState>>,
    LoggedQuery(params): LoggedQuery<VisitorQueryParams>,
) -> AppResult<Response> {
    let format = ExportFormat::parse(params.fmt.as_deref())?;
    let filter = build_visitor_filter(&params);
    tracing::info!(?format, conditions = filter.conditions().len(), "exporting visitor events");
    export_response(
        &state.store.visitors,
        filter,
        format,
        params.include_payload,
        state.config.query.export_batch_size,
        "public_events_export",
    )
    .await
}

/// DELETE /public/{id}
pub async fn delete_visitor(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let id = parse_id(&id)?;
    let deleted = state.store.visitors.delete_by_id(id).await?;
    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

/// DELETE /public - Bulk delete by filter; requires `confirm=true`.
pub async fn delete_visitors(
    State(state): State<Arc<AppState>>,
    LoggedQuery(params): LoggedQuery<VisitorQueryParams>,
) -> AppResult<Json<serde_json::Value>> {
    let filter = build_visitor_filter(&params);
    let deleted = state
        .store
        .visitors
        .delete_by_filter(&filter, params.confirm)
        .await?;
    Ok(Json(json!({ "ok": true, "deleted": deleted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_id() {
        assert_eq!(parse_id("42").unwrap(), 42);
        assert_eq!(parse_id(" 7 ").unwrap(), 7);
        for bad in ["0", "-3", "abc", "", "1.5"] {
            assert!(
                matches!(parse_id(bad), Err(AppError::Validation(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
