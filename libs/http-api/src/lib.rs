//! HTTP API: click counter endpoints, topic inspection and read access
//! to the aggregation state.

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use pipeline::Engine;
use streamfold_api::{
    AggregateState, ErrorKind, LogError, LogInspector, LogPublisher, LogQuery, RecordKind,
};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("bind api :{port}: {source}")]
    Bind { port: u16, source: std::io::Error },

    #[error("axum serve: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn LogInspector>,
    pub publisher: Arc<dyn LogPublisher>,
    pub engine: Arc<Engine>,
    /// Пользователь по умолчанию для click-endpoint'ов.
    pub default_user: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/clicks/count", get(handle_click_count))
        .route("/register-click", post(handle_register_click))
        .route("/api/topics", get(handle_list_topics))
        .route("/api/topics/{name}", get(handle_query_topic))
        .route("/api/aggregates/{key}", get(handle_aggregate))
        .route("/api/stats", get(handle_stats))
        .with_state(state)
}

/// HTTP сервер до отмены `shutdown`.
pub async fn run(port: u16, state: AppState, shutdown: CancellationToken) -> Result<(), ServeError> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|source| ServeError::Bind { port, source })?;
    tracing::info!(port, "http api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ServeError::Serve)?;

    tracing::info!("http api stopped");
    Ok(())
}

fn log_error_response(e: LogError) -> Response {
    let status = match e.kind() {
        ErrorKind::Config | ErrorKind::Logic => StatusCode::BAD_REQUEST,
        ErrorKind::Io | ErrorKind::Format => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, format!("error: {}", e.message())).into_response()
}

fn require_clicks(state: &AppState) -> Result<(), Response> {
    let kind = state.engine.pipeline().kind();
    if kind != RecordKind::Click {
        return Err((
            StatusCode::NOT_FOUND,
            format!("click endpoints are not served by the {kind} pipeline"),
        )
            .into_response());
    }
    Ok(())
}

// --- GET /clicks/count?user= ---

#[derive(Deserialize)]
struct UserParams {
    user: Option<String>,
}

async fn handle_click_count(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Response {
    if let Err(resp) = require_clicks(&state) {
        return resp;
    }
    let user = params.user.unwrap_or_else(|| state.default_user.clone());
    let count = state
        .engine
        .store()
        .get(&user)
        .map(|v| v.state.count())
        .unwrap_or(0);
    format!("Total Clicks: {count}").into_response()
}

// --- POST /register-click?user= ---

async fn handle_register_click(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Response {
    if let Err(resp) = require_clicks(&state) {
        return resp;
    }
    let user = params.user.unwrap_or_else(|| state.default_user.clone());
    let topic = &state.engine.config().input_topic;

    match state.publisher.publish(topic, &user, user.clone().into_bytes()).await {
        Ok(ack) => {
            tracing::debug!(%user, partition = ack.partition, offset = ack.offset, "click registered");
            axum::Json(ack).into_response()
        }
        Err(e) => {
            tracing::error!(%user, topic = %topic, error = ?e, "click publish failed");
            log_error_response(e)
        }
    }
}

// --- REST: GET /api/topics ---

async fn handle_list_topics(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.log.topics())
}

// --- REST: GET /api/topics/{name}?partition=&from=&limit= ---

#[derive(Deserialize)]
struct TopicQueryParams {
    partition: Option<u32>,
    from: Option<u64>,
    limit: Option<usize>,
}

async fn handle_query_topic(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<TopicQueryParams>,
) -> Response {
    if state.log.partitions(&name).is_none() {
        return (StatusCode::NOT_FOUND, format!("error: topic '{name}' not found")).into_response();
    }
    let query = LogQuery {
        partition: params.partition,
        from_offset: params.from,
        limit: params.limit,
    };
    match state.log.query(&name, &query).await {
        Ok(records) => axum::Json(records).into_response(),
        Err(e) => log_error_response(e),
    }
}

// --- REST: GET /api/aggregates/{key} ---

#[derive(Serialize)]
struct AggregateView {
    key: String,
    version: u64,
    state: AggregateState,
    output: String,
}

async fn handle_aggregate(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let engine = &state.engine;
    match engine.store().get(&key) {
        Some(v) => axum::Json(AggregateView {
            output: engine.pipeline().project(&v.state),
            key,
            version: v.version,
            state: v.state,
        })
        .into_response(),
        None => (StatusCode::NOT_FOUND, format!("error: no aggregate for '{key}'")).into_response(),
    }
}

// --- REST: GET /api/stats ---

#[derive(Serialize)]
struct StatsView {
    kind: RecordKind,
    input_topic: String,
    keys: usize,
    epoch: u64,
    #[serde(flatten)]
    counters: pipeline::StatsSnapshot,
}

async fn handle_stats(State(state): State<AppState>) -> impl IntoResponse {
    let engine = &state.engine;
    axum::Json(StatsView {
        kind: engine.pipeline().kind(),
        input_topic: engine.config().input_topic.clone(),
        keys: engine.store().len(),
        epoch: engine.epoch(),
        counters: engine.stats().snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::http::Request;
    use pipeline::config::PipelineConfig;
    use state_store::MemoryCheckpointStore;
    use storage_memory::MemoryStorage;
    use streamfold_api::{LogStorage, RawRecord};
    use tower::ServiceExt;
    use topic_engine::{Topic, TopicRegistry};

    async fn app(kind: RecordKind, input: &str) -> (Router, Arc<TopicRegistry>, Arc<Engine>) {
        let storages: Vec<Arc<dyn LogStorage>> = (0..2)
            .map(|_| Arc::new(MemoryStorage::new(1000)) as Arc<dyn LogStorage>)
            .collect();
        let topic = Topic::new(input.to_string(), storages).unwrap();
        topic.init().await.unwrap();
        let mut registry = TopicRegistry::new();
        registry.register(topic);
        let registry = Arc::new(registry);

        let engine = Arc::new(
            Engine::new(
                PipelineConfig::new(kind, input),
                Arc::new(MemoryCheckpointStore::new()),
                None,
            )
            .unwrap(),
        );
        let state = AppState {
            log: registry.clone(),
            publisher: registry.clone(),
            engine: engine.clone(),
            default_user: "user1".into(),
        };
        (router(state), registry, engine)
    }

    async fn call(app: &Router, method: &str, uri: &str) -> (StatusCode, String) {
        let req = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn click(partition: u32, offset: u64, user: &str) -> RawRecord {
        RawRecord {
            partition,
            offset,
            ts_ms: 0,
            key: user.into(),
            payload: user.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn click_count_reads_state_store() {
        let (app, _, engine) = app(RecordKind::Click, "clicks").await;
        assert_eq!(call(&app, "GET", "/clicks/count").await.1, "Total Clicks: 0");

        for offset in 0..3 {
            engine.pipeline().process(engine.store(), &click(0, offset, "user1"));
        }
        engine.pipeline().process(engine.store(), &click(1, 0, "user2"));

        let (status, body) = call(&app, "GET", "/clicks/count").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Total Clicks: 3");
        assert_eq!(call(&app, "GET", "/clicks/count?user=user2").await.1, "Total Clicks: 1");
    }

    #[tokio::test]
    async fn register_click_publishes_to_input_topic() {
        let (app, registry, _) = app(RecordKind::Click, "clicks").await;

        let (status, _) = call(&app, "POST", "/register-click").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(&app, "POST", "/register-click?user=alice").await;
        assert_eq!(status, StatusCode::OK);

        let records = registry.query("clicks", &LogQuery::default()).await.unwrap();
        let mut users: Vec<String> = records.iter().map(|r| r.payload_lossy().into_owned()).collect();
        users.sort();
        assert_eq!(users, vec!["alice", "user1"]);
        assert!(records.iter().all(|r| r.key == r.payload_lossy()));
    }

    #[tokio::test]
    async fn click_routes_need_click_pipeline() {
        let (app, _, _) = app(RecordKind::Weather, "weather-data").await;
        assert_eq!(call(&app, "GET", "/clicks/count").await.0, StatusCode::NOT_FOUND);
        assert_eq!(call(&app, "POST", "/register-click").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn aggregate_view_includes_projection() {
        let (app, _, engine) = app(RecordKind::Weather, "weather-data").await;
        let raw = RawRecord {
            partition: 0,
            offset: 0,
            ts_ms: 0,
            key: "StationA".into(),
            payload: b"StationA,35.0,60.0".to_vec(),
        };
        engine.pipeline().process(engine.store(), &raw);

        let (status, body) = call(&app, "GET", "/api/aggregates/StationA").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["state"]["kind"], "weather");
        assert_eq!(json["state"]["temp_sum"], 95.0);
        assert_eq!(
            json["output"],
            "Température Moyenne = 95.00°F, Humidité Moyenne = 60.00%"
        );

        assert_eq!(call(&app, "GET", "/api/aggregates/Nowhere").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn topics_are_listed_and_queried() {
        let (app, registry, _) = app(RecordKind::Click, "clicks").await;
        registry.publish("clicks", "user1", b"user1".to_vec()).await.unwrap();

        let (_, body) = call(&app, "GET", "/api/topics").await;
        assert_eq!(body, r#"["clicks"]"#);

        let (status, body) = call(&app, "GET", "/api/topics/clicks?limit=10").await;
        assert_eq!(status, StatusCode::OK);
        let records: Vec<RawRecord> = serde_json::from_str(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"user1");

        assert_eq!(call(&app, "GET", "/api/topics/missing").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn stats_report_counters_and_phases() {
        let (app, _, _) = app(RecordKind::Click, "clicks").await;
        let (status, body) = call(&app, "GET", "/api/stats").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["kind"], "click");
        assert_eq!(json["received"], 0);
        assert_eq!(json["workers"], serde_json::json!(["idle", "idle"]));
    }
}
