use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use paydirt_server::{Api, Engine, EngineConfig};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| "paydirt-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("paydirt-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_tunables() {
        let args = Args::parse_from([
            "paydirt-server",
            "--session-ttl-seconds",
            "60",
            "--starting-balance",
            "500",
            "--rng-seed",
            "7",
            "--stream-max-len",
            "32",
            "--cache-redis-url",
            "redis://localhost:6379",
        ]);
        let config = build_config(&args);
        assert_eq!(config.session_ttl_seconds, Some(60));
        assert_eq!(config.starting_balance, Some(500));
        assert_eq!(config.rng_seed, Some(7));
        assert_eq!(config.stream_max_len, Some(32));
        assert_eq!(
            config.cache_redis_url.as_deref(),
            Some("redis://localhost:6379")
        );
    }

    #[test]
    fn zero_disables_rate_limits_and_body_cap() {
        let args = Args::parse_from([
            "paydirt-server",
            "--http-rate-limit-per-second",
            "0",
            "--http-rate-limit-burst",
            "0",
            "--select-rate-limit-per-minute",
            "0",
            "--select-rate-limit-burst",
            "0",
            "--http-body-limit-bytes",
            "0",
        ]);
        let config = build_config(&args);
        assert_eq!(config.http_rate_limit_per_second, None);
        assert_eq!(config.http_rate_limit_burst, None);
        assert_eq!(config.select_rate_limit_per_minute, None);
        assert_eq!(config.select_rate_limit_burst, None);
        assert_eq!(config.http_body_limit_bytes, None);
    }

    #[test]
    fn defaults_survive_when_flags_are_omitted() {
        let args = Args::parse_from(["paydirt-server"]);
        let config = build_config(&args);
        assert_eq!(config.session_ttl_seconds, Some(4 * 60 * 60));
        assert_eq!(config.starting_balance, Some(100_000));
        assert!(config.db_path.is_none());
        assert!(config.rng_seed.is_none());
        assert_eq!(config.metrics_range_days, Some(7));
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Path to the SQLite database (a throwaway temp file when omitted).
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Session lifetime in seconds (default: 14400).
    #[arg(long)]
    session_ttl_seconds: Option<u64>,

    /// Demo credits granted to a fresh session, in minor units (default: 100000).
    #[arg(long)]
    starting_balance: Option<u64>,

    /// Interval between expired-session sweeps in seconds (default: 600).
    #[arg(long)]
    session_sweep_interval_seconds: Option<u64>,

    /// Maximum spin events retained in the stream (default: 10000).
    #[arg(long)]
    stream_max_len: Option<usize>,

    /// Maximum age of retained stream events in seconds (default: 3600).
    #[arg(long)]
    stream_max_age_seconds: Option<u64>,

    /// Delivery lease before an unacked event is redelivered, in seconds (default: 30).
    #[arg(long)]
    stream_redelivery_seconds: Option<u64>,

    /// Consumer poll interval in milliseconds (default: 500).
    #[arg(long)]
    consumer_poll_ms: Option<u64>,

    /// Maximum events consumed per poll (default: 100).
    #[arg(long)]
    consumer_batch_size: Option<usize>,

    /// Interval between daily-metric aggregation runs in seconds (default: 3600).
    #[arg(long)]
    aggregate_interval_seconds: Option<u64>,

    /// Lifetime of a real-time counter window in seconds (default: 90000).
    #[arg(long)]
    counter_ttl_seconds: Option<u64>,

    /// Seed for the reward RNG; makes outcomes deterministic.
    #[arg(long)]
    rng_seed: Option<u64>,

    /// Redis URL for the session cache (in-memory when omitted).
    #[arg(long)]
    cache_redis_url: Option<String>,

    /// Redis key prefix for cached sessions.
    #[arg(long)]
    cache_redis_prefix: Option<String>,

    /// Default metrics query range in days (default: 7).
    #[arg(long)]
    metrics_range_days: Option<u32>,

    /// Max queued store requests (0 uses default).
    #[arg(long)]
    store_buffer: Option<usize>,

    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Select endpoint rate limit per IP in requests per minute (default: 300).
    #[arg(long)]
    select_rate_limit_per_minute: Option<u64>,

    /// Select endpoint rate limit burst size (default: 20).
    #[arg(long)]
    select_rate_limit_burst: Option<u32>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args) -> EngineConfig {
    let defaults = EngineConfig::default();
    EngineConfig {
        db_path: args.db_path.clone(),
        session_ttl_seconds: args.session_ttl_seconds.or(defaults.session_ttl_seconds),
        starting_balance: args.starting_balance.or(defaults.starting_balance),
        session_sweep_interval_seconds: args
            .session_sweep_interval_seconds
            .or(defaults.session_sweep_interval_seconds),
        stream_max_len: args.stream_max_len.or(defaults.stream_max_len),
        stream_max_age_seconds: args
            .stream_max_age_seconds
            .or(defaults.stream_max_age_seconds),
        stream_redelivery_seconds: args
            .stream_redelivery_seconds
            .or(defaults.stream_redelivery_seconds),
        consumer_poll_ms: args.consumer_poll_ms.or(defaults.consumer_poll_ms),
        consumer_batch_size: args.consumer_batch_size.or(defaults.consumer_batch_size),
        aggregate_interval_seconds: args
            .aggregate_interval_seconds
            .or(defaults.aggregate_interval_seconds),
        counter_ttl_seconds: args.counter_ttl_seconds.or(defaults.counter_ttl_seconds),
        http_rate_limit_per_second: map_optional_limit(
            args.http_rate_limit_per_second,
            defaults.http_rate_limit_per_second,
        ),
        http_rate_limit_burst: map_optional_limit(
            args.http_rate_limit_burst,
            defaults.http_rate_limit_burst,
        ),
        select_rate_limit_per_minute: map_optional_limit(
            args.select_rate_limit_per_minute,
            defaults.select_rate_limit_per_minute,
        ),
        select_rate_limit_burst: map_optional_limit(
            args.select_rate_limit_burst,
            defaults.select_rate_limit_burst,
        ),
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            defaults.http_body_limit_bytes,
        ),
        store_buffer: map_optional_limit(args.store_buffer, defaults.store_buffer),
        cache_redis_url: args.cache_redis_url.clone(),
        cache_redis_prefix: args
            .cache_redis_prefix
            .clone()
            .or_else(|| defaults.cache_redis_prefix.clone()),
        metrics_range_days: args.metrics_range_days.or(defaults.metrics_range_days),
        rng_seed: args.rng_seed,
    }
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn require_positive_u64(var: &str) -> Result<()> {
    let value = require_env(var)?;
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("Invalid {var}: {value}"))?;
    if parsed == 0 {
        anyhow::bail!("Invalid {var}: {value}");
    }
    Ok(())
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }

    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_env("ADMIN_AUTH_TOKEN")?;
    require_env("METRICS_AUTH_TOKEN")?;
    require_positive_u64("RATE_LIMIT_HTTP_PER_SEC")?;
    require_positive_u64("RATE_LIMIT_HTTP_BURST")?;
    require_positive_u64("RATE_LIMIT_SELECT_PER_MIN")?;
    require_positive_u64("RATE_LIMIT_SELECT_BURST")?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing()?;

    ensure_production_env()?;

    let config = build_config(&args);
    let engine = Arc::new(Engine::new_with_config(config).context("failed to start engine")?);
    let jobs = engine.start_jobs();

    let api = Api::new(engine);
    let app = api.router();

    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    jobs.stop();
    Ok(())
}
