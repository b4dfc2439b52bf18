//! Axum JSON surface for dexops. Handlers are thin: parse, delegate, serialize.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dexops_core::{BatchRange, QueryError, StatField, TopQuery};
use dexops_storage::{Session, Store, StoreError};
use dexops_sync::{ServiceConfig, SyncEngine, SyncError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "dexops-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub engine: SyncEngine,
}

impl AppState {
    pub fn new(store: Store, engine: SyncEngine) -> Self {
        Self { store, engine }
    }
}

#[derive(Debug, Deserialize)]
struct CreatePokemonBody {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BatchQuery {
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct TopQueryParams {
    stat: String,
    limit: Option<i64>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/pokemon", get(list_pokemon_handler).post(create_pokemon_handler))
        .route("/sync/pokemon/batch", post(sync_batch_handler))
        .route("/sync/pokemon/{id}", post(sync_one_handler))
        .route("/analytics/top", get(top_by_stat_handler))
        .route("/analytics/types", get(type_distribution_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(config: &ServiceConfig) -> anyhow::Result<()> {
    let store = Store::open(&config.store_config()).await?;
    store.migrate().await?;
    let engine = SyncEngine::from_config(config)?;

    let listener = TcpListener::bind(config.bind_addr()).await?;
    info!(
        addr = %listener.local_addr()?,
        catalog = engine.catalog_label(),
        "dexops web listening"
    );
    axum::serve(listener, app(AppState::new(store.clone(), engine)))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn list_pokemon_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut session = match open_session(&state).await {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    match session.list_pokemon().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn create_pokemon_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreatePokemonBody>,
) -> Response {
    let mut session = match open_session(&state).await {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    match state.engine.create_by_name(&mut session, &body.name).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn sync_one_handler(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    let mut session = match open_session(&state).await {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    match state.engine.sync_one(&mut session, id).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn sync_batch_handler(State(state): State<Arc<AppState>>, Query(query): Query<BatchQuery>) -> Response {
    let range = match BatchRange::new(query.start, query.end) {
        Ok(range) => range,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, err.to_string()),
    };
    let mut session = match open_session(&state).await {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    Json(state.engine.sync_batch(&mut session, range).await).into_response()
}

async fn top_by_stat_handler(State(state): State<Arc<AppState>>, Query(params): Query<TopQueryParams>) -> Response {
    let query = match TopQuery::parse(&params.stat, params.limit) {
        Ok(query) => query,
        Err(err) => return query_error(err),
    };
    let mut session = match open_session(&state).await {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    match session.top_by_stat(&query).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn type_distribution_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut session = match open_session(&state).await {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    match session.type_distribution().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => store_error(err),
    }
}

async fn open_session(state: &AppState) -> Result<Session, Response> {
    state.store.session().await.map_err(store_error)
}

fn error_body(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::InvalidId(_) | SyncError::InvalidName(_) => StatusCode::BAD_REQUEST,
        SyncError::Catalog(inner) if inner.is_not_found() => StatusCode::NOT_FOUND,
        SyncError::Catalog(_) | SyncError::Record(_) => StatusCode::BAD_GATEWAY,
        SyncError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
        SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    }
    error_body(status, err.to_string())
}

fn store_error(err: StoreError) -> Response {
    sync_error(SyncError::Store(err))
}

/// Bad stat or limit is a client error (400), not a 200 body. An unknown stat
/// still carries the structured payload: the rejected value plus every valid
/// stat name.
fn query_error(err: QueryError) -> Response {
    let body = match &err {
        QueryError::InvalidStat { stat } => json!({
            "error": err.to_string(),
            "invalid_stat": stat,
            "valid_stats": StatField::column_names(),
        }),
        QueryError::LimitOutOfRange { .. } => json!({ "error": err.to_string() }),
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path as StdPath, PathBuf};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request};
    use dexops_catalog::{FixtureCatalog, HttpCatalog, HttpCatalogConfig};
    use dexops_core::CatalogRecord;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    fn fixtures_dir() -> PathBuf {
        StdPath::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog")
    }

    async fn app_with(catalog: FixtureCatalog) -> Router {
        let store = Store::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        app(AppState::new(store, SyncEngine::new(Arc::new(catalog))))
    }

    async fn fixture_app() -> Router {
        app_with(FixtureCatalog::load_dir(fixtures_dir()).unwrap()).await
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, value)
    }

    fn record(id: i64, name: &str, attack: i64) -> CatalogRecord {
        serde_json::from_value(json!({
            "id": id,
            "name": name,
            "stats": [{"base_stat": attack, "stat": {"name": "attack"}}],
            "types": [{"slot": 1, "type": {"name": "normal"}}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = fixture_app().await;
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn sync_one_inserts_then_reports_existing() {
        let app = fixture_app().await;
        let (status, body) = send(&app, "POST", "/sync/pokemon/25", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"status": "inserted", "id": 25, "name": "pikachu", "types": ["electric"], "attack": 55})
        );

        let (status, body) = send(&app, "POST", "/sync/pokemon/25", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "already_exists", "id": 25, "name": "pikachu"}));
    }

    #[tokio::test]
    async fn sync_errors_map_to_client_statuses() {
        let app = fixture_app().await;

        let (status, body) = send(&app, "POST", "/sync/pokemon/999999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("999999"));

        let (status, _) = send(&app, "POST", "/sync/pokemon/0", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "POST", "/sync/pokemon/pikachu", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, listed) = send(&app, "GET", "/pokemon", None).await;
        assert_eq!(listed, json!([]));
    }

    #[tokio::test]
    async fn create_by_name_rejects_path_like_names() {
        let app = fixture_app().await;
        for name in ["../pokemon-species/25", "pikachu?limit=1", "pika#chu", "   "] {
            let (status, body) = send(&app, "POST", "/pokemon", Some(json!({ "name": name }))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{name}");
            assert!(body["error"].as_str().unwrap().contains("name"), "{body}");
        }
        let (_, created) = send(&app, "POST", "/pokemon", Some(json!({"name": "Pikachu"}))).await;
        assert_eq!(created["status"], "inserted");
        let (_, rows) = send(&app, "GET", "/pokemon", None).await;
        assert_eq!(rows.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_name_under_a_different_id_is_a_conflict() {
        let catalog =
            FixtureCatalog::from_records([record(1, "twin", 10), record(2, "twin", 20)]).unwrap();
        let app = app_with(catalog).await;

        let (status, _) = send(&app, "POST", "/sync/pokemon/1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, "POST", "/sync/pokemon/2", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("twin"), "{body}");
    }

    #[tokio::test]
    async fn rejected_upstream_records_are_bad_gateway() {
        let catalog = FixtureCatalog::from_records([record(3, "broken", -5)]).unwrap();
        let app = app_with(catalog).await;

        let (status, body) = send(&app, "POST", "/sync/pokemon/3", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("negative"), "{body}");
        let (_, listed) = send(&app, "GET", "/pokemon", None).await;
        assert_eq!(listed, json!([]));
    }

    #[tokio::test]
    async fn unreachable_catalog_is_bad_gateway() {
        // grab a free port, then release it so connections are refused
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let catalog = HttpCatalog::new(HttpCatalogConfig {
            base_url: format!("http://127.0.0.1:{port}/api/v2"),
            timeout: Duration::from_secs(2),
            user_agent: None,
        })
        .unwrap();
        let store = Store::in_memory().await.unwrap();
        store.migrate().await.unwrap();
        let router = app(AppState::new(store, SyncEngine::new(Arc::new(catalog))));

        let (status, body) = send(&router, "POST", "/sync/pokemon/25", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(body["error"].as_str().unwrap().contains("catalog request failed"), "{body}");
    }

    #[tokio::test]
    async fn batch_sync_reports_counts_and_failures() {
        let app = fixture_app().await;
        let (status, body) = send(&app, "POST", "/sync/pokemon/batch?start=1&end=6", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 6);
        assert_eq!(body["inserted"], 4);
        assert_eq!(body["skipped"], 0);
        assert_eq!(body["failed"], 2);
        let failed_ids = body["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["id"].as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(failed_ids, vec![3, 5]);

        let (_, again) = send(&app, "POST", "/sync/pokemon/batch?start=1&end=6", None).await;
        assert_eq!(again["inserted"], 0);
        assert_eq!(again["skipped"], 4);
    }

    #[tokio::test]
    async fn batch_sync_rejects_bad_ranges() {
        let app = fixture_app().await;
        let (status, body) = send(&app, "POST", "/sync/pokemon/batch?start=9&end=3", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("greater than"));

        let (status, _) = send(&app, "POST", "/sync/pokemon/batch?start=1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn create_by_name_then_list() {
        let app = fixture_app().await;
        let (status, body) = send(&app, "POST", "/pokemon", Some(json!({"name": "Bulbasaur"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "inserted");
        assert_eq!(body["id"], 1);

        let (status, listed) = send(&app, "GET", "/pokemon", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = listed.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], "bulbasaur");
        assert_eq!(rows[0]["types"], json!(["grass", "poison"]));
        assert_eq!(rows[0]["special_attack"], 65);

        let (status, _) = send(&app, "POST", "/pokemon", Some(json!({"name": "agumon"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn top_by_stat_orders_by_requested_stat() {
        let catalog =
            FixtureCatalog::from_records([record(1, "mid", 80), record(2, "high", 120), record(3, "low", 45)]).unwrap();
        let app = app_with(catalog).await;
        send(&app, "POST", "/sync/pokemon/batch?start=1&end=3", None).await;

        let (status, body) = send(&app, "GET", "/analytics/top?stat=attack&limit=3", None).await;
        assert_eq!(status, StatusCode::OK);
        let values = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["value"].as_i64().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(values, vec![120, 80, 45]);
        assert_eq!(body[0]["name"], "high");
        assert_eq!(body[0]["stat"], "attack");

        let (_, default_limit) = send(&app, "GET", "/analytics/top?stat=attack", None).await;
        assert_eq!(default_limit.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn top_by_stat_rejects_unknown_stat_and_out_of_range_limit() {
        let app = fixture_app().await;

        let (status, body) = send(&app, "GET", "/analytics/top?stat=charisma&limit=10", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["invalid_stat"], "charisma");
        assert!(body["error"].as_str().unwrap().contains("charisma"));
        assert_eq!(
            body["valid_stats"],
            json!(["hp", "attack", "defense", "special_attack", "special_defense", "speed"])
        );

        let (status, body) = send(&app, "GET", "/analytics/top?stat=speed&limit=200", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("200"));
    }

    #[tokio::test]
    async fn type_distribution_counts_synced_types() {
        let app = fixture_app().await;
        send(&app, "POST", "/sync/pokemon/batch?start=1&end=4", None).await;

        let (status, body) = send(&app, "GET", "/analytics/types", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!([
                {"type": "grass", "count": 2},
                {"type": "poison", "count": 2},
                {"type": "fire", "count": 1}
            ])
        );
    }
}
