//! # API Handlers
//!
//! Axum handlers for reading the audit trail, managing connectors and
//! firing host events.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vg_core::{Actor, Record, RecordId};
use vg_query::record::RecordQuery;
use vg_store::StoreError;

use crate::connectors::registry::{ActiveReport, CommitReport, ConnectorInfo, Labels};
use crate::connectors::ActionLink;
use crate::dispatch::FireReport;
use crate::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn storage_error(e: StoreError) -> (StatusCode, String) {
    tracing::error!("Store error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Run synchronous SQLite work off the async workers.
async fn blocking<T, F>(task: F) -> Result<T, (StatusCode, String)>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task).await.map_err(|e| {
        tracing::error!("Blocking task failed: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Record>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<serde_json::Map<String, Value>>>,
    pub total: u64,
    pub query_time_ms: u64,
    /// Action links per record id.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<RecordId, Vec<ActionLink>>,
}

/// Raw query args in, matching records out. A `fields` arg switches the
/// response to projected `rows`.
pub async fn query_records(
    State(state): State<Arc<AppState>>,
    Json(args): Json<Value>,
) -> ApiResult<RecordsResponse> {
    let query = RecordQuery::from_args(&args);
    let store = state.store.clone();

    if args.get("fields").is_some() {
        let page = blocking(move || store.query_rows(&query))
            .await?
            .map_err(storage_error)?;
        return Ok(Json(RecordsResponse {
            records: None,
            rows: Some(page.rows),
            total: page.total,
            query_time_ms: page.query_time_ms,
            links: BTreeMap::new(),
        }));
    }

    let page = blocking(move || store.query(&query))
        .await?
        .map_err(storage_error)?;
    let registry = state.registry.lock().await;
    let links = page
        .records
        .iter()
        .map(|record| (record.id, registry.action_links(record)))
        .filter(|(_, links)| !links.is_empty())
        .collect();

    Ok(Json(RecordsResponse {
        records: Some(page.records),
        rows: None,
        total: page.total,
        query_time_ms: page.query_time_ms,
        links,
    }))
}

pub async fn reset_records(
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, (StatusCode, String)> {
    let store = state.store.clone();
    blocking(move || store.reset()).await?.map_err(storage_error)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: usize,
    pub retention_days: u32,
}

pub async fn purge_records(State(state): State<Arc<AppState>>) -> ApiResult<PurgeResponse> {
    let days = state.config.storage.retention_days;
    if days == 0 {
        return Ok(Json(PurgeResponse {
            purged: 0,
            retention_days: 0,
        }));
    }
    let store = state.store.clone();
    let purged = blocking(move || store.purge_older_than(days, Utc::now()))
        .await?
        .map_err(storage_error)?;
    Ok(Json(PurgeResponse {
        purged,
        retention_days: days,
    }))
}

// =============================================================================
// Connectors
// =============================================================================

#[derive(Debug, Serialize)]
pub struct ConnectorsResponse {
    pub connectors: Vec<ConnectorInfo>,
    pub labels: Labels,
}

pub async fn list_connectors(State(state): State<Arc<AppState>>) -> Json<ConnectorsResponse> {
    let registry = state.registry.lock().await;
    Json(ConnectorsResponse {
        connectors: registry.connectors(),
        labels: registry.labels().clone(),
    })
}

#[derive(Debug, Deserialize)]
pub struct ActiveRequest {
    pub active: Vec<String>,
}

pub async fn set_active_connectors(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ActiveRequest>,
) -> Json<ActiveReport> {
    let mut registry = state.registry.lock().await;
    Json(registry.set_active(&req.active))
}

pub async fn reload_connector(
    State(state): State<Arc<AppState>>,
    Path(slug): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let mut registry = state.registry.lock().await;
    registry
        .reload(&slug)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct EventRequest {
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub actor: Actor,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub fired: FireReport,
    pub committed: CommitReport,
}

/// Fire one host event, then flush delayed logs as the end of the request.
///
/// Handlers write to the store, so both steps run on a blocking thread
/// holding the registry for their duration.
pub async fn fire_event(
    State(state): State<Arc<AppState>>,
    Path(event): Path<String>,
    Json(req): Json<EventRequest>,
) -> ApiResult<EventResponse> {
    let registry = state.registry.clone().lock_owned().await;
    let name = event.clone();
    let (fired, committed) = blocking(move || {
        let fired = registry.fire(&name, &req.payload, &req.actor);
        (fired, registry.commit_delayed())
    })
    .await?;
    tracing::debug!(
        "Event '{}': {} hooks, {} records",
        event,
        fired.invoked,
        committed.written.len()
    );
    Ok(Json(EventResponse { fired, committed }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::connectors::registry::Discovery;
    use serde_json::json;
    use vg_store::SqliteStore;

    fn state() -> Arc<AppState> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let (state, _) = AppState::new(HubConfig::default(), store, &Discovery::builtin());
        Arc::new(state)
    }

    async fn fire(state: &Arc<AppState>, event: &str, payload: Value, actor: Actor) -> EventResponse {
        let Json(response) = fire_event(
            State(state.clone()),
            Path(event.to_string()),
            Json(EventRequest { payload, actor }),
        )
        .await
        .unwrap();
        response
    }

    #[tokio::test]
    async fn test_fire_then_query_with_links() {
        let state = state();
        let admin = Actor::user(1, "administrator");
        let response = fire(
            &state,
            "user_register",
            json!({ "user_id": 7, "display_name": "Alice", "role": "editor" }),
            admin,
        )
        .await;
        assert_eq!(response.fired.invoked, 1);

        let Json(page) = query_records(State(state.clone()), Json(json!({ "connector": "users" })))
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        let records = page.records.unwrap();
        assert_eq!(records[0].action, "created");
        assert_eq!(page.links[&records[0].id][0].label, "Edit User");
    }

    #[tokio::test]
    async fn test_delayed_settings_committed_per_request() {
        let state = state();
        let response = fire(
            &state,
            "update_option",
            json!({ "option": "blogname", "old_value": "A", "value": "B" }),
            Actor::system(),
        )
        .await;
        assert_eq!(response.committed.written.len(), 1);
        assert_eq!(state.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_projection_returns_rows() {
        let state = state();
        fire(
            &state,
            "wp_login",
            json!({ "user_id": 2, "display_name": "Bob" }),
            Actor::system(),
        )
        .await;
        let Json(page) = query_records(
            State(state.clone()),
            Json(json!({ "fields": ["summary"] })),
        )
        .await
        .unwrap();
        assert!(page.records.is_none());
        assert_eq!(page.rows.unwrap()[0]["summary"], json!("Bob logged in"));
    }

    #[tokio::test]
    async fn test_set_active_and_reload() {
        let state = state();
        let Json(report) = set_active_connectors(
            State(state.clone()),
            Json(ActiveRequest {
                active: vec!["settings".into()],
            }),
        )
        .await;
        assert_eq!(report.unregistered, vec!["users"]);

        let response = fire(&state, "wp_login", json!({ "user_id": 2 }), Actor::system()).await;
        assert_eq!(response.fired.invoked, 0);

        let status = reload_connector(State(state.clone()), Path("settings".into()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let missing = reload_connector(State(state.clone()), Path("nope".into())).await;
        assert_eq!(missing.unwrap_err().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_events_all_written() {
        let state = state();
        let mut tasks = Vec::new();
        for user_id in 1..=8 {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                fire(&state, "wp_login", json!({ "user_id": user_id }), Actor::system()).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().fired.invoked, 1);
        }

        let Json(page) = query_records(State(state.clone()), Json(json!({ "records_per_page": -1 })))
            .await
            .unwrap();
        assert_eq!(page.total, 8);
    }

    #[tokio::test]
    async fn test_reset_and_purge() {
        let state = state();
        fire(&state, "wp_login", json!({ "user_id": 2 }), Actor::system()).await;

        let Json(purge) = purge_records(State(state.clone())).await.unwrap();
        assert_eq!(purge.purged, 0);
        assert_eq!(purge.retention_days, 30);

        let status = reset_records(State(state.clone())).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_connectors() {
        let state = state();
        let Json(response) = list_connectors(State(state)).await;
        assert_eq!(response.connectors.len(), 2);
        assert!(response.connectors.iter().all(|c| c.active));
        assert_eq!(response.labels.connector("settings"), "Settings");
    }
}
