pub mod forwarder;
pub mod tcp;

pub use forwarder::Forwarder;

use crate::routing::{HttpRouter, RouteOutcome, ACME_CHALLENGE_PATH};
use bytes::Bytes;
use http::header::{HeaderValue, HOST, LOCATION, STRICT_TRANSPORT_SECURITY};
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Handle one data-plane request:
///
/// 1. answer ACME challenges from the carve-out (always plaintext-safe)
/// 2. select a forwarder by host + longest path match
/// 3. redirect plaintext requests unless the forwarder allows HTTP
/// 4. redirect bare directory paths to their trailing-slash form
/// 5. hand off to the forwarder
///
/// `secure` records whether the request arrived over the TLS listener.
pub async fn handle_request(
    req: Request<Incoming>,
    router: Arc<HttpRouter>,
    peer: SocketAddr,
    secure: bool,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let original_host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let host = original_host
        .split(':')
        .next()
        .unwrap_or("")
        .to_string();
    let path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    let hsts = secure && !router.any_allow_http();

    let mut pattern_label = String::new();
    let mut upstream_label = String::new();

    let mut response = if path.is_empty() {
        status_response(StatusCode::BAD_REQUEST)
    } else if let Some(token) = path.strip_prefix(ACME_CHALLENGE_PATH) {
        serve_acme_challenge(&router, &path, token).await
    } else {
        match router.select(&host, &path) {
            RouteOutcome::NotFound => {
                debug!("proxy: no forwarder matched, host={}, path={}", host, path);
                pattern_label = "_no_route".to_string();
                status_response(StatusCode::NOT_FOUND)
            }
            RouteOutcome::RedirectAppendSlash => {
                pattern_label = "_redirect".to_string();
                redirect_response(&format!("{}/", path))
            }
            RouteOutcome::Forward(fwd) => {
                pattern_label = fwd.pattern().raw().to_string();
                upstream_label = fwd.authority().to_string();
                if !secure && !fwd.allow_http() {
                    redirect_response(&https_location(&host, req.uri()))
                } else {
                    let headers = forwarder::forwarded_headers(
                        req.headers(),
                        &original_host,
                        peer,
                        secure,
                        fwd_strip_prefix(&fwd),
                    );
                    fwd.forward(req, headers).await
                }
            }
        }
    };

    if hsts {
        response.headers_mut().insert(
            STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=300"),
        );
    }

    let status = response.status().as_u16();
    let mut buf = itoa::Buffer::new();
    metrics::counter!(
        "portal_http_requests_total",
        "pattern" => pattern_label.clone(),
        "method" => method.clone(),
        "status_code" => buf.format(status).to_owned(),
    )
    .increment(1);
    metrics::histogram!(
        "portal_http_request_duration_seconds",
        "pattern" => pattern_label.clone(),
    )
    .record(start.elapsed().as_secs_f64());

    // Structured access log, one line per request at info level.
    tracing::info!(
        client_ip = %peer.ip(),
        method = %method,
        host = %host,
        path = %path,
        status = status,
        pattern = %pattern_label,
        upstream = %upstream_label,
        latency_ms = %start.elapsed().as_millis(),
        secure = secure,
        "access"
    );

    Ok(response)
}

fn fwd_strip_prefix(fwd: &Forwarder) -> Option<&str> {
    if fwd.strips_pattern() {
        Some(fwd.pattern().prefix())
    } else {
        None
    }
}

/// Rebuild the request target under the https scheme with the port dropped,
/// for the plaintext-rejection redirect.
fn https_location(host: &str, uri: &http::Uri) -> String {
    match uri.query() {
        Some(q) => format!("https://{}{}?{}", host, uri.path(), q),
        None => format!("https://{}{}", host, uri.path()),
    }
}

fn status_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .expect("static response")
}

fn redirect_response(location: &str) -> Response<BoxBody> {
    let mut builder = Response::builder().status(StatusCode::SEE_OTHER);
    if let Ok(v) = HeaderValue::from_str(location) {
        builder = builder.header(LOCATION, v);
    }
    builder.body(empty_body()).expect("static response")
}

/// Answer an ACME HTTP-01 probe: first from the in-memory token map filled
/// by in-flight orders, then from the certbot webroot if one is configured.
async fn serve_acme_challenge(
    router: &HttpRouter,
    request_path: &str,
    token: &str,
) -> Response<BoxBody> {
    if let Some(entry) = router.challenges().get(token) {
        return Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/plain")
            .body(full_body(entry.value().clone()))
            .expect("static response");
    }

    if let Some(webroot) = router.challenge_webroot() {
        if challenge_token_is_safe(token) {
            let file = webroot.join(&request_path[1..]);
            if let Ok(contents) = tokio::fs::read(&file).await {
                return Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/plain")
                    .body(full_body(contents))
                    .expect("static response");
            }
        }
    }

    status_response(StatusCode::NOT_FOUND)
}

/// Tokens are base64url; anything that could traverse out of the webroot
/// is rejected outright.
fn challenge_token_is_safe(token: &str) -> bool {
    !token.is_empty()
        && !token.starts_with('.')
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_https_location_strips_port_keeps_query() {
        let uri: http::Uri = "/app/x?a=1".parse().unwrap();
        assert_eq!(
            https_location("portal.example.com", &uri),
            "https://portal.example.com/app/x?a=1"
        );
        let bare: http::Uri = "/app".parse().unwrap();
        assert_eq!(https_location("portal", &bare), "https://portal/app");
    }

    #[test]
    fn test_acme_challenge_served_from_memory() {
        let router = HttpRouter::new(None, None);
        router
            .challenges()
            .insert("tok123".to_string(), "tok123.keyauth".to_string());

        let resp = tokio_test::block_on(serve_acme_challenge(
            &router,
            "/.well-known/acme-challenge/tok123",
            "tok123",
        ));
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = tokio_test::block_on(serve_acme_challenge(
            &router,
            "/.well-known/acme-challenge/missing",
            "missing",
        ));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_challenge_token_sanitizing() {
        assert!(challenge_token_is_safe("Ag3token-_X"));
        assert!(!challenge_token_is_safe(""));
        assert!(!challenge_token_is_safe("../../etc/passwd"));
        assert!(!challenge_token_is_safe(".hidden"));
        assert!(!challenge_token_is_safe("a/b"));
    }
}
