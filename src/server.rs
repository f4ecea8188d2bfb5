use crate::anomaly::AnomalyKind;
use crate::gateway::{Gateway, Health};
use crate::patterns::TemplateId;
use crate::query::{EventFilter, TimeRange};
use crate::record::Severity;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

type Shared = State<Arc<Gateway>>;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/ingest", post(ingest))
        .route("/v1/events", get(events))
        .route("/v1/summaries", get(summaries))
        .route("/v1/alerts", get(alerts))
        .route("/v1/templates", get(templates))
        .route("/v1/templates/:id", get(template))
        .route("/v1/stats", get(stats))
        .with_state(gateway)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(gateway: Arc<Gateway>, listener: TcpListener, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "listening");
    }
    axum::serve(listener, router(gateway)).with_graceful_shutdown(shutdown).await
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({"message": "Welcome to Logcraft AI API"}))
}

async fn health(State(gw): Shared) -> Response {
    let health = gw.health();
    let status = match health {
        Health::Ok => StatusCode::OK,
        Health::Unrecoverable { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(health)).into_response()
}

#[derive(Debug, Deserialize)]
struct IngestRequest {
    lines: Vec<String>,
    #[serde(default)]
    source: Option<String>,
}

async fn ingest(State(gw): Shared, Json(req): Json<IngestRequest>) -> Response {
    let result = tokio::task::spawn_blocking(move || gw.ingest_batch(&req.lines, req.source.as_deref())).await;
    match result {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => {
            error!(error = %err, "ingest task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("join error: {err}")})),
            )
                .into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    kind: Option<AnomalyKind>,
    template: Option<u64>,
    min_severity: Option<Severity>,
    min_magnitude: Option<f64>,
}

async fn events(State(gw): Shared, Query(q): Query<EventsQuery>) -> impl IntoResponse {
    let filter = EventFilter {
        kind: q.kind,
        template: q.template.map(TemplateId),
        min_magnitude: q.min_magnitude,
        min_severity: q.min_severity,
    };
    Json(gw.query_events(TimeRange::from_bounds(q.start, q.end), &filter))
}

#[derive(Debug, Default, Deserialize)]
struct RangeQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn summaries(State(gw): Shared, Query(q): Query<RangeQuery>) -> impl IntoResponse {
    Json(gw.query_summaries(TimeRange::from_bounds(q.start, q.end)))
}

#[derive(Debug, Default, Deserialize)]
struct AlertsQuery {
    #[serde(default)]
    after: u64,
}

async fn alerts(State(gw): Shared, Query(q): Query<AlertsQuery>) -> impl IntoResponse {
    Json(gw.poll_alerts(q.after))
}

#[derive(Debug, Default, Deserialize)]
struct TemplatesQuery {
    limit: Option<usize>,
}

async fn templates(State(gw): Shared, Query(q): Query<TemplatesQuery>) -> impl IntoResponse {
    Json(gw.templates(q.limit))
}

async fn template(State(gw): Shared, Path(id): Path<u64>) -> Response {
    match gw.template(TemplateId(id)) {
        Some(t) => (StatusCode::OK, Json(t)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "template not found", "id": id})),
        )
            .into_response(),
    }
}

async fn stats(State(gw): Shared) -> impl IntoResponse {
    Json(gw.stats())
}
