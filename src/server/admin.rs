use super::PortalState;
use crate::proxy::{full_body, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};

/// Diagnostics surface on the admin port: health, readiness, Prometheus
/// metrics, and a JSON snapshot of live registrations.
pub fn handle_admin(
    req: Request<Incoming>,
    state: PortalState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .body(full_body(r#"{"status":"ok"}"#))
            .unwrap()),

        "/ready" | "/readyz" => Ok(Response::builder()
            .status(200)
            .body(full_body(format!(
                r#"{{"status":"ready","forwarders":{},"tcp_routes":{},"registrations":{}}}"#,
                state.router.len(),
                state.tcp.len(),
                state.state.registration_count(),
            )))
            .unwrap()),

        "/metrics" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap()),

        "/registrations" => {
            let leases: Vec<serde_json::Value> = state
                .leasor
                .all_leases()
                .into_iter()
                .map(|lease| {
                    serde_json::json!({
                        "pattern": lease.pattern,
                        "address": lease.address,
                        "port": lease.port,
                        "expires": humantime::format_rfc3339_seconds(lease.timeout).to_string(),
                    })
                })
                .collect();
            let routes: Vec<serde_json::Value> = state
                .router
                .snapshot()
                .into_iter()
                .map(|(pattern, upstream)| {
                    serde_json::json!({ "pattern": pattern, "upstream": upstream })
                })
                .collect();
            let body = serde_json::json!({
                "leases": leases,
                "forwarders": routes,
            });
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body.to_string()))
                .unwrap())
        }

        _ => Ok(Response::builder()
            .status(404)
            .body(full_body(r#"{"error":"not found"}"#))
            .unwrap()),
    }
}
