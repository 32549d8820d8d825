use axum::{
    extract::{Path, Query, State as AxumState},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::metrics::LatencySnapshot;
use crate::{now_ms, Engine};
use paydirt_types::{CreateSessionRequest, EngineError, GameConfig, SelectRequest};

const READY_TIMEOUT: Duration = Duration::from_secs(2);

/// Simple health response for basic liveness checks.
#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

/// Readiness response for load balancer probes.
#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

/// Detailed health response for monitoring dashboards.
#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    uptime_seconds: u64,
    cache_mode: &'static str,
    stream_depth: usize,
    realtime_windows: usize,
    engine: crate::EngineMetricsSnapshot,
    http: crate::HttpMetricsSnapshot,
    system: crate::SystemMetricsSnapshot,
    version: &'static str,
}

#[derive(Serialize)]
struct RoundResponse {
    round: u32,
}

#[derive(Serialize)]
struct AdminGameResponse {
    ok: bool,
    game_id: String,
}

#[derive(Deserialize)]
pub(super) struct MetricsQuery {
    game_id: String,
    country: Option<String>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub(super) struct RealtimeQuery {
    game_id: String,
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::SessionNotFound | EngineError::GameNotFound => StatusCode::NOT_FOUND,
        EngineError::Expired => StatusCode::GONE,
        EngineError::RegionBlocked { .. } => StatusCode::FORBIDDEN,
        EngineError::RoundOver { .. }
        | EngineError::InvalidBid { .. }
        | EngineError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
        EngineError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_body(code: &str, message: &str) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "error": { "code": code, "message": message } }))
}

/// Render an operation failure as the error envelope. Policy rejections are
/// expected outcomes and pass through without a log line; store failures are
/// logged here and surfaced as an opaque 500.
fn error_response(err: EngineError) -> Response {
    if let EngineError::Store { message } = &err {
        tracing::error!("Storage failure surfaced to a request: {message}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body(err.code(), "internal error"),
        )
            .into_response();
    }
    (status_for(&err), error_body(err.code(), &err.to_string())).into_response()
}

/// Basic health check endpoint. Always returns ok if the service can respond;
/// used for liveness checks and load balancer probes.
pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

/// Readiness probe: the store worker must answer a ping within the timeout.
pub(super) async fn ready(AxumState(engine): AxumState<Arc<Engine>>) -> Response {
    match tokio::time::timeout(READY_TIMEOUT, engine.ready()).await {
        Ok(Ok(())) => Json(ReadyResponse {
            ready: true,
            reason: None,
        })
        .into_response(),
        Ok(Err(_)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                reason: Some("store_unavailable"),
            }),
        )
            .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                ready: false,
                reason: Some("store_timeout"),
            }),
        )
            .into_response(),
    }
}

/// Detailed health status for monitoring dashboards: uptime, the metric
/// snapshots, and the live depths of the stream and counter map.
pub(super) async fn health(AxumState(engine): AxumState<Arc<Engine>>) -> Response {
    let healthy = tokio::time::timeout(READY_TIMEOUT, engine.ready())
        .await
        .map(|ping| ping.is_ok())
        .unwrap_or(false);
    let response = HealthResponse {
        healthy,
        uptime_seconds: engine.uptime().as_secs(),
        cache_mode: engine.cache_mode(),
        stream_depth: engine.stream_depth().await,
        realtime_windows: engine.counter_windows(),
        engine: engine.engine_metrics_snapshot(),
        http: engine.http_metrics_snapshot(),
        system: engine.system_metrics_snapshot(),
        version: env!("CARGO_PKG_VERSION"),
    };

    let http_status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, Json(response)).into_response()
}

pub(super) async fn create_session(
    AxumState(engine): AxumState<Arc<Engine>>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let start = Instant::now();
    let response = match engine.create_session(request, now_ms()).await {
        Ok(created) => Json(created).into_response(),
        Err(err) => error_response(err),
    };
    engine.http_metrics().record_create_session(start.elapsed());
    response
}

pub(super) async fn get_session(
    AxumState(engine): AxumState<Arc<Engine>>,
    Path(session_id): Path<String>,
) -> Response {
    let start = Instant::now();
    let response = match engine.get_session(&session_id, now_ms()).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    };
    engine.http_metrics().record_get_session(start.elapsed());
    response
}

pub(super) async fn new_round(
    AxumState(engine): AxumState<Arc<Engine>>,
    Path(session_id): Path<String>,
) -> Response {
    match engine.new_round(&session_id, now_ms()).await {
        Ok(round) => Json(RoundResponse { round }).into_response(),
        Err(err) => error_response(err),
    }
}

/// Idempotent delete: a missing or already-expired session is still a 204.
pub(super) async fn invalidate_session(
    AxumState(engine): AxumState<Arc<Engine>>,
    Path(session_id): Path<String>,
) -> Response {
    match engine.invalidate_session(&session_id, now_ms()).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

pub(super) async fn select(
    AxumState(engine): AxumState<Arc<Engine>>,
    Json(request): Json<SelectRequest>,
) -> Response {
    let start = Instant::now();
    let response = match engine.select(request, now_ms()).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(err),
    };
    engine.http_metrics().record_select(start.elapsed());
    response
}

pub(super) async fn query_metrics(
    AxumState(engine): AxumState<Arc<Engine>>,
    Query(query): Query<MetricsQuery>,
) -> Response {
    let start = Instant::now();
    let response = match engine
        .query_metrics(
            &query.game_id,
            query.start_date,
            query.end_date,
            query.country.as_deref(),
            now_ms(),
        )
        .await
    {
        Ok(metrics) => Json(metrics).into_response(),
        Err(err) => error_response(err),
    };
    engine.http_metrics().record_query_metrics(start.elapsed());
    response
}

pub(super) async fn query_realtime(
    AxumState(engine): AxumState<Arc<Engine>>,
    Query(query): Query<RealtimeQuery>,
) -> Response {
    let start = Instant::now();
    let response = Json(engine.realtime_stats(&query.game_id, now_ms())).into_response();
    engine.http_metrics().record_query_realtime(start.elapsed());
    response
}

/// Upsert seam for the authoring system: stores a validated config snapshot.
pub(super) async fn upsert_game(
    headers: HeaderMap,
    AxumState(engine): AxumState<Arc<Engine>>,
    Json(config): Json<GameConfig>,
) -> Response {
    if let Some(status) = admin_auth_error(&headers) {
        return (
            status,
            error_body("UNAUTHORIZED", "missing or invalid admin token"),
        )
            .into_response();
    }
    let game_id = config.game_id.clone();
    match engine.upsert_game(config, now_ms()).await {
        Ok(()) => Json(AdminGameResponse { ok: true, game_id }).into_response(),
        Err(err) => error_response(err),
    }
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(engine): AxumState<Arc<Engine>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(engine.http_metrics_snapshot()).into_response()
}

pub(super) async fn system_metrics(
    headers: HeaderMap,
    AxumState(engine): AxumState<Arc<Engine>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(engine.system_metrics_snapshot()).into_response()
}

pub(super) async fn prometheus_metrics(
    headers: HeaderMap,
    AxumState(engine): AxumState<Arc<Engine>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    let body = render_prometheus_metrics(&engine).await;
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str())
    {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

/// Validates admin authentication via x-admin-token header or Bearer token.
/// Uses the ADMIN_AUTH_TOKEN environment variable; if not set, all admin
/// access is blocked.
fn admin_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("ADMIN_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return Some(StatusCode::UNAUTHORIZED);
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_token = headers
        .get("x-admin-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str())
    {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}

async fn render_prometheus_metrics(engine: &Engine) -> String {
    let counts = engine.engine_metrics_snapshot();
    let http = engine.http_metrics_snapshot();
    let system = engine.system_metrics_snapshot();
    let stream_depth = engine.stream_depth().await;
    let realtime_windows = engine.counter_windows();

    let mut out = String::new();

    append_histogram(
        &mut out,
        "paydirt_http_create_session_latency_ms",
        &http.create_session,
    );
    append_histogram(
        &mut out,
        "paydirt_http_get_session_latency_ms",
        &http.get_session,
    );
    append_histogram(&mut out, "paydirt_http_select_latency_ms", &http.select);
    append_histogram(
        &mut out,
        "paydirt_http_query_metrics_latency_ms",
        &http.query_metrics,
    );
    append_histogram(
        &mut out,
        "paydirt_http_query_realtime_latency_ms",
        &http.query_realtime,
    );
    append_counter(
        &mut out,
        "paydirt_http_reject_origin_total",
        http.rejected_origin,
    );
    append_counter(
        &mut out,
        "paydirt_http_reject_rate_limit_total",
        http.rejected_rate_limit,
    );
    append_counter(
        &mut out,
        "paydirt_http_reject_body_limit_total",
        http.rejected_body_limit,
    );

    append_counter(
        &mut out,
        "paydirt_sessions_created_total",
        counts.sessions_created,
    );
    append_counter(
        &mut out,
        "paydirt_sessions_reused_total",
        counts.sessions_reused,
    );
    append_counter(
        &mut out,
        "paydirt_sessions_invalidated_total",
        counts.sessions_invalidated,
    );
    append_counter(
        &mut out,
        "paydirt_sessions_swept_total",
        counts.sessions_swept,
    );
    append_counter(
        &mut out,
        "paydirt_spins_accepted_total",
        counts.spins_accepted,
    );
    append_counter(
        &mut out,
        "paydirt_rejected_round_over_total",
        counts.rejected_round_over,
    );
    append_counter(
        &mut out,
        "paydirt_rejected_invalid_bid_total",
        counts.rejected_invalid_bid,
    );
    append_counter(
        &mut out,
        "paydirt_rejected_region_blocked_total",
        counts.rejected_region_blocked,
    );
    append_counter(
        &mut out,
        "paydirt_fallback_selections_total",
        counts.fallback_selections,
    );
    append_counter(
        &mut out,
        "paydirt_balance_write_failures_total",
        counts.balance_write_failures,
    );
    append_counter(
        &mut out,
        "paydirt_stream_published_total",
        counts.stream_published,
    );
    append_counter(&mut out, "paydirt_stream_acked_total", counts.stream_acked);
    append_counter(
        &mut out,
        "paydirt_stream_redelivered_total",
        counts.stream_redelivered,
    );
    append_counter(
        &mut out,
        "paydirt_stream_trimmed_total",
        counts.stream_trimmed,
    );
    append_counter(&mut out, "paydirt_cache_hits_total", counts.cache_hits);
    append_counter(&mut out, "paydirt_cache_misses_total", counts.cache_misses);
    append_counter(&mut out, "paydirt_cache_errors_total", counts.cache_errors);
    append_counter(
        &mut out,
        "paydirt_aggregator_runs_total",
        counts.aggregator_runs,
    );
    append_counter(
        &mut out,
        "paydirt_aggregator_failures_total",
        counts.aggregator_failures,
    );
    append_gauge(
        &mut out,
        "paydirt_aggregator_last_run_ms",
        counts.aggregator_last_run_ms,
    );

    append_gauge(&mut out, "paydirt_stream_depth", stream_depth);
    append_gauge(&mut out, "paydirt_realtime_windows", realtime_windows);
    append_gauge(&mut out, "paydirt_uptime_seconds", engine.uptime().as_secs());

    append_gauge(&mut out, "paydirt_system_rss_bytes", system.rss_bytes);
    append_gauge(
        &mut out,
        "paydirt_system_virtual_bytes",
        system.virtual_bytes,
    );
    append_gauge(
        &mut out,
        "paydirt_system_cpu_usage_percent",
        system.cpu_usage_percent,
    );

    out
}

fn append_counter(out: &mut String, name: &str, value: u64) {
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn append_gauge(out: &mut String, name: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn append_histogram(out: &mut String, name: &str, snapshot: &LatencySnapshot) {
    let _ = writeln!(out, "# TYPE {name} histogram");
    let mut cumulative = 0u64;
    for (bucket, count) in snapshot.buckets_ms.iter().zip(snapshot.counts.iter()) {
        cumulative = cumulative.saturating_add(*count);
        let _ = writeln!(out, "{name}_bucket{{le=\"{bucket}\"}} {cumulative}");
    }
    cumulative = cumulative.saturating_add(snapshot.overflow);
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");
    let _ = writeln!(out, "{name}_count {}", snapshot.count);
    let sum = snapshot.avg_ms * snapshot.count as f64;
    let _ = writeln!(out, "{name}_sum {sum}");
}
