//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("penbox_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("penbox_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("penbox_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("penbox_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("penbox_signature_verifications_total", "HTTP signature verifications by result"),
        &["result"]
    ).expect("metric can be created");
    pub static ref DELIVERY_ATTEMPTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("penbox_delivery_attempts_total", "Outbound delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "penbox_delivery_duration_seconds",
            "Duration of a single delivery attempt in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref FOLLOWERS_TOTAL: IntGauge = IntGauge::new(
        "penbox_followers_total",
        "Total number of followers of local actors"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("penbox_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_RECEIVED.clone()))
        .expect("ACTIVITIES_RECEIVED can be registered");
    REGISTRY
        .register(Box::new(ACTIVITIES_SENT.clone()))
        .expect("ACTIVITIES_SENT can be registered");
    REGISTRY
        .register(Box::new(FEDERATION_REQUESTS_TOTAL.clone()))
        .expect("FEDERATION_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()))
        .expect("SIGNATURE_VERIFICATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_ATTEMPTS_TOTAL.clone()))
        .expect("DELIVERY_ATTEMPTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(FOLLOWERS_TOTAL.clone()))
        .expect("FOLLOWERS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
