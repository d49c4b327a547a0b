//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "lightpub_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Federation Metrics
    pub static ref ACTIVITYPUB_ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_activitypub_activities_received_total", "Total number of ActivityPub activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITYPUB_ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_activitypub_activities_sent_total", "Total number of ActivityPub activities sent"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_deliveries_total", "Total number of inbox deliveries attempted"),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "lightpub_delivery_duration_seconds",
            "Inbox delivery duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["status"]
    ).expect("metric can be created");
    pub static ref DELIVERIES_IN_FLIGHT: IntGauge = IntGauge::new(
        "lightpub_deliveries_in_flight",
        "Current number of inbox deliveries in flight"
    ).expect("metric can be created");
    pub static ref SIGNATURE_VERIFICATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_signature_verifications_total", "Total number of HTTP signature verifications"),
        &["result"]
    ).expect("metric can be created");
    pub static ref ACTOR_FETCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_actor_fetches_total", "Total number of remote actor fetches"),
        &["result"]
    ).expect("metric can be created");
    pub static ref FOLLOW_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_follow_transitions_total", "Total number of follow state transitions"),
        &["transition"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("lightpub_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(register_all);
}

fn register_all() {
    let collectors: Vec<(&str, Box<dyn prometheus::core::Collector>)> = vec![
        ("HTTP_REQUESTS_TOTAL", Box::new(HTTP_REQUESTS_TOTAL.clone())),
        (
            "HTTP_REQUEST_DURATION_SECONDS",
            Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()),
        ),
        (
            "ACTIVITYPUB_ACTIVITIES_RECEIVED",
            Box::new(ACTIVITYPUB_ACTIVITIES_RECEIVED.clone()),
        ),
        (
            "ACTIVITYPUB_ACTIVITIES_SENT",
            Box::new(ACTIVITYPUB_ACTIVITIES_SENT.clone()),
        ),
        ("DELIVERIES_TOTAL", Box::new(DELIVERIES_TOTAL.clone())),
        (
            "DELIVERY_DURATION_SECONDS",
            Box::new(DELIVERY_DURATION_SECONDS.clone()),
        ),
        ("DELIVERIES_IN_FLIGHT", Box::new(DELIVERIES_IN_FLIGHT.clone())),
        (
            "SIGNATURE_VERIFICATIONS_TOTAL",
            Box::new(SIGNATURE_VERIFICATIONS_TOTAL.clone()),
        ),
        ("ACTOR_FETCHES_TOTAL", Box::new(ACTOR_FETCHES_TOTAL.clone())),
        (
            "FOLLOW_TRANSITIONS_TOTAL",
            Box::new(FOLLOW_TRANSITIONS_TOTAL.clone()),
        ),
        ("ERRORS_TOTAL", Box::new(ERRORS_TOTAL.clone())),
    ];

    for (name, collector) in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::error!(metric = name, %error, "Failed to register metric");
        }
    }

    tracing::info!("Metrics registry initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_exposes_counters() {
        init_metrics();
        init_metrics();

        FOLLOW_TRANSITIONS_TOTAL.with_label_values(&["accept"]).inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"lightpub_follow_transitions_total".to_string()));
    }
}
