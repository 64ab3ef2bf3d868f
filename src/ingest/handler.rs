use crate::app::AppState;
use crate::error::{AppError, AppResult, LoggedJson};
use crate::ingest::client::{parse_ip, ClientContext};
use crate::types::{HookBody, NewVisitorEvent, NewWebhookEvent, TrackBody};
use axum::extract::State;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

fn validate_hook(body: &HookBody) -> AppResult<()> {
    if body.event_type.trim().is_empty() {
        return Err(AppError::Validation("type is required".to_string()));
    }
    Ok(())
}

/// POST /hook - Store one webhook event.
pub async fn ingest_hook(
    State(state): State<Arc<AppState>>,
    client: ClientContext,
    LoggedJson(body): LoggedJson<HookBody>,
) -> AppResult<Json<serde_json::Value>> {
    validate_hook(&body)?;

    let payload = serde_json::to_value(&body)
        .map_err(|e| AppError::Internal(format!("payload encode failed: {e}")))?;
    let event = NewWebhookEvent {
        event_type: body.event_type,
        user_id: body.user_id,
        ip: client.ip,
        user_agent: Some(client.user_agent),
        payload,
        created_at: chrono::Utc::now().timestamp(),
    };

    let id = state.store.events.insert(event).await?;
    Ok(Json(json!({ "ok": true, "stored": true, "id": id })))
}

/// IP that keys a visitor ping. A valid `visitor_info.ip` wins when the client is trusted.
fn visitor_ip(
    visitor_info: &serde_json::Value,
    server_ip: Option<&str>,
    trust_client: bool,
) -> Option<String> {
    let claimed = trust_client
        .then(|| visitor_info.get("ip").and_then(|ip| ip.as_str()))
        .flatten()
        .and_then(parse_ip);
    claimed.or_else(|| server_ip.map(str::to_string))
}

/// POST /public - Record a page visit, one record per (path, ip).
pub async fn track_visitor(
    State(state): State<Arc<AppState>>,
    client: ClientContext,
    LoggedJson(body): LoggedJson<TrackBody>,
) -> AppResult<Json<serde_json::Value>> {
    let page = body.path.trim();
    if page.is_empty() {
        return Err(AppError::Validation("path is required".to_string()));
    }
    let page = page.to_string();

    let ip = visitor_ip(
        &body.visitor_info,
        client.ip.as_deref(),
        state.config.visitor.trust_client_ip,
    );
    if ip != client.ip {
        tracing::debug!(server_ip = ?client.ip, client_ip = ?ip, "using client-supplied ip");
    }

    // The observed address stays under `client` even when the key uses the claimed one.
    let payload = json!({
        "path": page,
        "ref": body.referrer,
        "data": {
            "meta": body.visitor_info,
            "client": { "ip": client.ip, "user_agent": client.user_agent },
        },
    });

    let outcome = state
        .store
        .visitors
        .upsert(NewVisitorEvent {
            page: page.clone(),
            referrer: body.referrer,
            ip,
            user_agent: client.user_agent,
            payload,
            created_at: chrono::Utc::now().timestamp(),
        })
        .await?;

    Ok(Json(json!({
        "ok": true,
        "id": outcome.id,
        "action": outcome.action,
        "path": page,
        "visitor_info": body.visitor_info,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_requires_type() {
        let body = HookBody {
            event_type: "  ".to_string(),
            user_id: None,
            data: json!({}),
        };
        assert!(matches!(validate_hook(&body), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_hook_payload_keeps_submitted_shape() {
        let body: HookBody =
            serde_json::from_value(json!({"type": "signup", "user_id": "u1"})).unwrap();
        let payload = serde_json::to_value(&body).unwrap();
        assert_eq!(payload, json!({"type": "signup", "user_id": "u1", "data": {}}));
    }

    #[test]
    fn test_visitor_ip_prefers_valid_client_claim() {
        let info = json!({"ip": " 9.9.9.9 "});
        assert_eq!(
            visitor_ip(&info, Some("1.2.3.4"), true).as_deref(),
            Some("9.9.9.9")
        );
    }

    #[test]
    fn test_visitor_ip_ignores_invalid_or_untrusted_claim() {
        let junk = json!({"ip": "not-an-ip"});
        assert_eq!(visitor_ip(&junk, Some("1.2.3.4"), true).as_deref(), Some("1.2.3.4"));

        let valid = json!({"ip": "9.9.9.9"});
        assert_eq!(visitor_ip(&valid, Some("1.2.3.4"), false).as_deref(), Some("1.2.3.4"));

        let numeric = json!({"ip": 42});
        assert_eq!(visitor_ip(&numeric, None, true), None);
    }
}
