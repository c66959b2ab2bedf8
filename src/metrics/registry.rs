use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the admin
/// `/metrics` endpoint. Install is idempotent; later calls reuse the
/// first recorder.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> Self {
        let handle = HANDLE
            .get_or_init(|| {
                let handle = PrometheusBuilder::new()
                    .set_buckets_for_metric(
                        metrics_exporter_prometheus::Matcher::Suffix(
                            "_duration_seconds".to_string(),
                        ),
                        LATENCY_BUCKETS,
                    )
                    .expect("valid matcher")
                    .install_recorder()
                    .expect("failed to install metrics recorder");
                describe_all();
                handle
            })
            .clone();
        Self { handle }
    }

    /// Render the Prometheus exposition format for the admin endpoint.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_all() {
    // request path
    describe_counter!(
        "portal_http_requests_total",
        Unit::Count,
        "Total HTTP requests dispatched through the proxy"
    );
    describe_histogram!(
        "portal_http_request_duration_seconds",
        Unit::Seconds,
        "Request duration from the client's perspective"
    );

    // connections
    describe_counter!(
        "portal_connections_total",
        Unit::Count,
        "Connections accepted per data plane"
    );
    describe_gauge!(
        "portal_connections_active",
        Unit::Count,
        "Active downstream connections per data plane"
    );
    describe_gauge!(
        "portal_tcp_connections_active",
        Unit::Count,
        "Active TCP pass-through connections per pattern"
    );

    // leases & routing
    describe_gauge!(
        "portal_leases_active",
        Unit::Count,
        "Live leases across all backends"
    );
    describe_counter!(
        "portal_lease_operations_total",
        Unit::Count,
        "Register/renew/unregister operations"
    );
    describe_counter!(
        "portal_lease_expirations_total",
        Unit::Count,
        "Leases removed by the expiry sweep"
    );
    describe_gauge!(
        "portal_forwarders_active",
        Unit::Count,
        "Forwarders currently installed in the router"
    );

    // certificates
    describe_counter!(
        "portal_cert_renewals_total",
        Unit::Count,
        "Certificate generations and refreshes by source"
    );
    describe_counter!(
        "portal_acme_orders_total",
        Unit::Count,
        "ACME order attempts"
    );

    // persistence
    describe_counter!(
        "portal_state_saves_total",
        Unit::Count,
        "State file writes"
    );
}
