use crate::config::AppConfig;
use crate::ingest::handler as ingest_handler;
use crate::query::handler as query_handler;
use crate::storage::Store;
use axum::extract::DefaultBodyLimit;
use axum::handler::Handler;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared by every handler.
pub struct AppState {
    pub store: Store,
    pub config: AppConfig,
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(origin = %origin, error = %e, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

/// Build the full HTTP surface. Serve it with connect info so the peer address
/// is available to the client extractor.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);
    let max_payload_bytes = state.config.ingest.max_payload_bytes;

    Router::new()
        .route("/", get(query_handler::health))
        .route(
            "/hook",
            post(ingest_handler::ingest_hook.layer(DefaultBodyLimit::max(max_payload_bytes))),
        )
        .route(
            "/events",
            get(query_handler::list_events).delete(query_handler::delete_events),
        )
        .route("/events/export", get(query_handler::export_events))
        .route("/events/{id}", delete(query_handler::delete_event))
        .route(
            "/public",
            get(query_handler::list_visitors)
                .post(ingest_handler::track_visitor.layer(DefaultBodyLimit::max(max_payload_bytes)))
                .delete(query_handler::delete_visitors),
        )
        .route("/public/export", get(query_handler::export_visitors))
        .route("/public/{id}", delete(query_handler::delete_visitor))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
