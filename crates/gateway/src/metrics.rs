use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static VISIBILITY_GATE_APPLIED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static AUDIT_WRITE_FAILURES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static MUTATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "podtrack_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create podtrack_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "podtrack_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create podtrack_gateway_http_request_duration_seconds"),
        )
    })
}

fn visibility_gate_applied_total() -> &'static IntCounterVec {
    VISIBILITY_GATE_APPLIED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "podtrack_gateway_visibility_gate_applied_total",
                    "Row searches scoped by the role visibility rule.",
                ),
                &["role"],
            )
            .expect("create podtrack_gateway_visibility_gate_applied_total"),
        )
    })
}

fn audit_write_failures_total() -> &'static IntCounter {
    AUDIT_WRITE_FAILURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "podtrack_gateway_audit_write_failures_total",
                "Mutations rejected because the audit row could not be written.",
            )
            .expect("create podtrack_gateway_audit_write_failures_total"),
        )
    })
}

fn mutations_total() -> &'static IntCounterVec {
    MUTATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "podtrack_gateway_mutations_total",
                    "Audited mutations by action and outcome.",
                ),
                &["action", "outcome"],
            )
            .expect("create podtrack_gateway_mutations_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_visibility_gate(role: &str) {
    visibility_gate_applied_total()
        .with_label_values(&[role])
        .inc();
}

pub fn inc_audit_write_failure() {
    audit_write_failures_total().inc();
}

pub fn observe_mutation(action: &str, outcome: &str) {
    mutations_total()
        .with_label_values(&[action, outcome])
        .inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = audit_write_failures_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
