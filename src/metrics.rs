//! Prometheus metrics for the retrieval loop.
//!
//! Exposes:
//! - `graphrag_turn_duration_seconds` (histogram)
//! - `graphrag_turn_total` (counter with status)
//! - `graphrag_turn_inflight` (gauge)
//! - `graphrag_backend_calls_total` (counter by backend and outcome)
//! - `graphrag_backend_retries_total` (counter by backend)
//! - `graphrag_vector_fallbacks_total` (counter by rejected search mode)
//! - `graphrag_graph_lookups_total` (counter by lookup outcome)
//! - process metrics via `process` collector

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use prometheus::process_collector::ProcessCollector;
use prometheus::{
    default_registry, register_histogram, register_int_counter_vec, register_int_gauge, Encoder,
    Histogram, IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

static PROCESS_COLLECTOR: Lazy<()> = Lazy::new(|| {
    if let Err(err) = default_registry().register(Box::new(ProcessCollector::for_self())) {
        warn!("Failed to register process collector: {}", err);
    }
});

static TURN_DURATION: Lazy<Histogram> = Lazy::new(|| {
    // Exponential buckets from 10ms up to ~80 seconds.
    let buckets =
        prometheus::exponential_buckets(0.01, 2.0, 14).expect("failed to create histogram buckets");
    register_histogram!(
        "graphrag_turn_duration_seconds",
        "Retrieval turn duration in seconds",
        buckets
    )
    .expect("failed to register turn duration histogram")
});

static TURN_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "graphrag_turn_total",
        "Total retrieval turns by final status",
        &["status"]
    )
    .expect("failed to register turn counter")
});

static TURN_INFLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("graphrag_turn_inflight", "Number of in-flight turns")
        .expect("failed to register inflight gauge")
});

static BACKEND_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "graphrag_backend_calls_total",
        "Backend calls by backend and outcome",
        &["backend", "outcome"]
    )
    .expect("failed to register backend call counter")
});

static BACKEND_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "graphrag_backend_retries_total",
        "Backend call retries after transient failures",
        &["backend"]
    )
    .expect("failed to register retry counter")
});

static VECTOR_FALLBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "graphrag_vector_fallbacks_total",
        "Vector searches demoted to semantic mode",
        &["rejected_mode"]
    )
    .expect("failed to register fallback counter")
});

static GRAPH_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "graphrag_graph_lookups_total",
        "Entity lookups issued by the graph expander",
        &["outcome"]
    )
    .expect("failed to register lookup counter")
});

/// Ensure collectors are registered.
fn init_collectors() {
    Lazy::force(&PROCESS_COLLECTOR);
    Lazy::force(&TURN_DURATION);
    Lazy::force(&TURN_TOTAL);
    Lazy::force(&TURN_INFLIGHT);
    Lazy::force(&BACKEND_CALLS);
    Lazy::force(&BACKEND_RETRIES);
    Lazy::force(&VECTOR_FALLBACKS);
    Lazy::force(&GRAPH_LOOKUPS);
}

/// Increment inflight gauge for a turn.
pub fn record_turn_start() {
    init_collectors();
    TURN_INFLIGHT.inc();
}

/// Record turn completion with duration and final status.
pub fn record_turn_result(duration: Duration, status: &str) {
    init_collectors();
    TURN_INFLIGHT.dec();
    TURN_DURATION.observe(duration.as_secs_f64());
    TURN_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_backend_call(backend: &str, success: bool) {
    init_collectors();
    BACKEND_CALLS
        .with_label_values(&[backend, if success { "ok" } else { "error" }])
        .inc();
}

pub fn record_retry(backend: &str) {
    init_collectors();
    BACKEND_RETRIES.with_label_values(&[backend]).inc();
}

pub fn record_fallback(rejected_mode: &str) {
    init_collectors();
    VECTOR_FALLBACKS.with_label_values(&[rejected_mode]).inc();
}

/// `outcome` is one of `hit`, `miss`, `error`.
pub fn record_lookup(outcome: &str) {
    init_collectors();
    GRAPH_LOOKUPS.with_label_values(&[outcome]).inc();
}

fn plain_response(status: StatusCode, body: Full<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}

async fn metrics_response() -> Result<Response<Full<Bytes>>, Infallible> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", err);
        return Ok(plain_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            Full::from("encode error"),
        ));
    }

    let mut response = plain_response(StatusCode::OK, Full::from(buffer));
    if let Ok(content_type) = hyper::header::HeaderValue::from_str(encoder.format_type()) {
        response
            .headers_mut()
            .insert(hyper::header::CONTENT_TYPE, content_type);
    }
    Ok(response)
}

async fn handle_request(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    match req.uri().path() {
        "/metrics" => metrics_response().await,
        _ => Ok(plain_response(StatusCode::NOT_FOUND, Full::new(Bytes::new()))),
    }
}

async fn serve(addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Prometheus metrics endpoint started");

    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service_fn(handle_request);
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                warn!(?peer, "Metrics connection error: {}", err);
            }
        });
    }
}

/// Spawn the metrics HTTP endpoint on the given address.
pub fn spawn_metrics_server(addr: SocketAddr) {
    init_collectors();
    tokio::spawn(async move {
        if let Err(err) = serve(addr).await {
            error!(%addr, "Metrics server failed: {}", err);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn records_turn_metrics() {
        let before = TURN_TOTAL.with_label_values(&["test_status_complete"]).get();

        record_turn_start();
        record_turn_result(Duration::from_millis(120), "test_status_complete");

        assert_eq!(
            TURN_TOTAL.with_label_values(&["test_status_complete"]).get(),
            before + 1
        );
        assert!(TURN_DURATION.get_sample_count() >= 1);
    }

    #[test]
    fn backend_calls_tracked_by_outcome() {
        let backend = "test_backend_outcomes";

        record_backend_call(backend, true);
        record_backend_call(backend, true);
        record_backend_call(backend, false);

        assert_eq!(BACKEND_CALLS.with_label_values(&[backend, "ok"]).get(), 2);
        assert_eq!(BACKEND_CALLS.with_label_values(&[backend, "error"]).get(), 1);
    }

    #[test]
    fn retries_fallbacks_and_lookups_counted() {
        record_retry("test_retry_backend");
        record_fallback("test_hybrid");
        record_lookup("test_hit");
        record_lookup("test_hit");

        assert_eq!(BACKEND_RETRIES.with_label_values(&["test_retry_backend"]).get(), 1);
        assert_eq!(VECTOR_FALLBACKS.with_label_values(&["test_hybrid"]).get(), 1);
        assert_eq!(GRAPH_LOOKUPS.with_label_values(&["test_hit"]).get(), 2);
    }

    #[test]
    fn init_collectors_can_be_called_multiple_times() {
        init_collectors();
        init_collectors();
    }

    #[tokio::test]
    async fn metrics_response_contains_registered_metrics() {
        record_backend_call("test_metrics_response", true);

        let response = metrics_response().await.expect("metrics response");
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .expect("content type")
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("text/"));

        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect metrics body")
            .to_bytes();
        let text = String::from_utf8(body_bytes.to_vec()).expect("utf-8 metrics body");
        assert!(text.contains("graphrag_backend_calls_total"));
        assert!(text.contains("test_metrics_response"));
        assert!(text.contains("graphrag_turn_inflight"));
    }
}
