//! # vg-hub: The "Watch" of VIGIL
//!
//! Host events come in, connectors turn them into records, the store keeps
//! them, and the query DSL reads them back out.
//!
//! ```text
//! event ──▶ Dispatcher ──▶ Connector handler ──▶ Logger ──▶ LogSink (SqliteStore)
//! query args ──▶ RecordQuery ──▶ compiled SQL ──▶ SqliteStore ──▶ records + total
//! ```

pub mod api;
pub mod config;
pub mod connectors;
pub mod dispatch;
pub mod logger;
pub mod sink;

use std::sync::Arc;

use axum::routing::{delete, get, post, put};
use axum::Router;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use vg_store::SqliteStore;

use config::HubConfig;
use connectors::registry::{Discovery, LoadReport, RegistryContext};
use logger::Logger;

pub struct AppState {
    pub registry: Arc<Mutex<RegistryContext>>,
    pub store: Arc<SqliteStore>,
    pub config: HubConfig,
}

impl AppState {
    /// Wire the logger to `store`, then load the discovered connectors
    /// allowed by the config.
    pub fn new(config: HubConfig, store: Arc<SqliteStore>, discovery: &Discovery) -> (Self, LoadReport) {
        let logger = Logger::new(store.clone()).with_exclusions(config.exclude.clone());
        let mut registry = RegistryContext::new(Arc::new(logger));
        let report = registry.load_all(discovery, &config.connectors.active);
        let state = Self {
            registry: Arc::new(Mutex::new(registry)),
            store,
            config,
        };
        (state, report)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/records/query", post(api::query_records))
        .route("/api/records", delete(api::reset_records))
        .route("/api/records/purge", post(api::purge_records))
        .route("/api/connectors", get(api::list_connectors))
        .route("/api/connectors/active", put(api::set_active_connectors))
        .route("/api/connectors/:slug/reload", post(api::reload_connector))
        .route("/api/events/:event", post(api::fire_event))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
