use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use std::time::Duration;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static EVENTS_SUBMITTED: OnceLock<IntCounterVec> = OnceLock::new();
static EVENTS_REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static CLASSIFICATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static LEASE_DECISIONS: OnceLock<IntCounterVec> = OnceLock::new();
static SESSIONS_RECLAIMED: OnceLock<IntCounter> = OnceLock::new();
static QUERY_EMBEDDING_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static SEARCH_LATENCY: OnceLock<Histogram> = OnceLock::new();

/// Create and register every collector. Safe to call more than once.
pub fn init_metrics() {
    let events_submitted = EVENTS_SUBMITTED.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("events_submitted_total", "Events accepted onto the capture queue"),
            &["source"],
        )
        .expect("valid metric definition")
    });

    let events_rejected = EVENTS_REJECTED.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("events_rejected_total", "Events refused by capture"),
            &["source", "reason"],
        )
        .expect("valid metric definition")
    });

    let classifications = CLASSIFICATIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("classifications_total", "Classified events per method"),
            &["method"],
        )
        .expect("valid metric definition")
    });

    let lease_decisions = LEASE_DECISIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("lease_decisions_total", "Lease requests per outcome"),
            &["outcome"],
        )
        .expect("valid metric definition")
    });

    let sessions_reclaimed = SESSIONS_RECLAIMED.get_or_init(|| {
        IntCounter::new("sessions_reclaimed_total", "Stale sessions reclaimed by the sweeper")
            .expect("valid metric definition")
    });

    let query_embedding_failures = QUERY_EMBEDDING_FAILURES.get_or_init(|| {
        IntCounter::new(
            "query_embedding_failures_total",
            "Searches that fell back to keyword and centrality because the query could not be embedded",
        )
        .expect("valid metric definition")
    });

    let queue_depth = QUEUE_DEPTH.get_or_init(|| {
        IntGauge::new("capture_queue_depth", "Events waiting for a capture worker").expect("valid metric definition")
    });

    let search_latency = SEARCH_LATENCY.get_or_init(|| {
        Histogram::with_opts(
            HistogramOpts::new("search_latency_seconds", "Hybrid search latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        )
        .expect("valid metric definition")
    });

    REGISTRY.register(Box::new(events_submitted.clone())).ok();
    REGISTRY.register(Box::new(events_rejected.clone())).ok();
    REGISTRY.register(Box::new(classifications.clone())).ok();
    REGISTRY.register(Box::new(lease_decisions.clone())).ok();
    REGISTRY.register(Box::new(sessions_reclaimed.clone())).ok();
    REGISTRY.register(Box::new(query_embedding_failures.clone())).ok();
    REGISTRY.register(Box::new(queue_depth.clone())).ok();
    REGISTRY.register(Box::new(search_latency.clone())).ok();
}

pub fn record_event_submitted(source: &str) {
    if let Some(counter) = EVENTS_SUBMITTED.get() {
        counter.with_label_values(&[source]).inc();
    }
}

pub fn record_event_rejected(source: &str, reason: &str) {
    if let Some(counter) = EVENTS_REJECTED.get() {
        counter.with_label_values(&[source, reason]).inc();
    }
}

pub fn record_classification(method: &str) {
    if let Some(counter) = CLASSIFICATIONS.get() {
        counter.with_label_values(&[method]).inc();
    }
}

pub fn record_lease_decision(outcome: &str) {
    if let Some(counter) = LEASE_DECISIONS.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_session_reclaimed() {
    if let Some(counter) = SESSIONS_RECLAIMED.get() {
        counter.inc();
    }
}

pub fn record_query_embedding_failure() {
    if let Some(counter) = QUERY_EMBEDDING_FAILURES.get() {
        counter.inc();
    }
}

pub fn inc_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.inc();
    }
}

pub fn dec_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.dec();
    }
}

pub fn observe_search_latency(elapsed: Duration) {
    if let Some(histogram) = SEARCH_LATENCY.get() {
        histogram.observe(elapsed.as_secs_f64());
    }
}

/// Prometheus text exposition of the registry.
pub fn gather_text() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(feature = "cli")]
pub async fn get_metrics() -> axum::response::Response {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    match gather_text() {
        Ok(body) => (StatusCode::OK, [("content-type", "text/plain; version=0.0.4")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
