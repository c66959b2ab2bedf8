use crate::proxy::{empty_body, BoxBody};
use crate::routing::pattern::HttpPattern;
use http::header::{HeaderName, HeaderValue, HOST};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Runtime handler for one registered HTTP pattern.
///
/// All state is captured by value at registration time; a forwarder is
/// immutable for the lifetime of its lease. Replacement installs a new
/// forwarder rather than mutating this one.
pub struct Forwarder {
    pattern: HttpPattern,
    /// The owning lease; teardown only removes the forwarder when the
    /// evicted lease still owns the pattern.
    lease: crate::leasor::Lease,
    scheme: &'static str,
    authority: String,
    strip_pattern: bool,
    allow_http: bool,
    client: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl Forwarder {
    pub fn new(
        pattern: HttpPattern,
        lease: crate::leasor::Lease,
        https: bool,
        strip_pattern: bool,
        allow_http: bool,
        client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    ) -> Self {
        let authority = format!("{}:{}", lease.address, lease.port);
        Self {
            pattern,
            lease,
            scheme: if https { "https" } else { "http" },
            authority,
            strip_pattern,
            allow_http,
            client,
        }
    }

    pub fn pattern(&self) -> &HttpPattern {
        &self.pattern
    }

    pub fn lease(&self) -> &crate::leasor::Lease {
        &self.lease
    }

    pub fn lease_key(&self) -> String {
        self.lease.key()
    }

    pub fn allow_http(&self) -> bool {
        self.allow_http
    }

    pub fn strips_pattern(&self) -> bool {
        self.strip_pattern
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Send a request upstream, applying the per-forwarder director:
    /// path stripping, scheme/authority rewrite, and the forwarded-header
    /// set computed by the dispatcher.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        forwarded_headers: http::HeaderMap,
    ) -> Response<BoxBody> {
        let (parts, body) = req.into_parts();

        let path = parts.uri.path();
        let rewritten_path = if self.strip_pattern {
            self.pattern.strip(path)
        } else {
            path.to_string()
        };
        let upstream_uri = match parts.uri.query() {
            Some(q) => format!("{}://{}{}?{}", self.scheme, self.authority, rewritten_path, q),
            None => format!("{}://{}{}", self.scheme, self.authority, rewritten_path),
        };

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(&upstream_uri);
        for (name, value) in &forwarded_headers {
            builder = builder.header(name, value);
        }

        let upstream_req = match builder.body(body.boxed()) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    "proxy: failed to build upstream request, pattern={}, error={}",
                    self.pattern.raw(),
                    e
                );
                return error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        match self.client.request(upstream_req).await {
            Ok(resp) => {
                debug!(
                    "proxy: forwarded, pattern={}, upstream={}, status={}",
                    self.pattern.raw(),
                    self.authority,
                    resp.status()
                );
                resp.map(|b| b.boxed())
            }
            Err(e) => {
                warn!(
                    "proxy: upstream error, pattern={}, upstream={}, error={}",
                    self.pattern.raw(),
                    upstream_uri,
                    e
                );
                error_response(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

fn error_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .body(empty_body())
        .expect("static response")
}

/// Compute the header set sent upstream. Client-supplied `Forwarded` and
/// `X-Forwarded-*` headers are dropped so backends cannot be fed spoofed
/// origin information.
pub fn forwarded_headers(
    incoming: &http::HeaderMap,
    original_host: &str,
    peer: std::net::SocketAddr,
    secure: bool,
    strip_prefix: Option<&str>,
) -> http::HeaderMap {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFPORT: HeaderName = HeaderName::from_static("x-forwarded-for-port");
    static XPREFIX: HeaderName = HeaderName::from_static("x-forwarded-prefix");

    let mut headers = http::HeaderMap::with_capacity(incoming.len() + 5);
    for (name, value) in incoming {
        let lower = name.as_str();
        if lower == "forwarded" || lower.starts_with("x-forwarded-") {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // Keep the original Host on the upstream request; the backend sees the
    // public name while the URI authority targets its own address.
    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(HOST, v.clone());
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.insert(XFF.clone(), v);
    }
    headers.insert(
        XFP.clone(),
        HeaderValue::from_static(if secure { "https" } else { "http" }),
    );
    let mut buf = itoa::Buffer::new();
    if let Ok(v) = HeaderValue::from_str(buf.format(peer.port())) {
        headers.insert(XFPORT.clone(), v);
    }
    if let Some(prefix) = strip_prefix {
        if let Ok(v) = HeaderValue::from_str(prefix) {
            headers.insert(XPREFIX.clone(), v);
        }
    }

    headers
}

/// rustls client config for backend-facing connections: trusts the internal
/// CA roots and presents the portal identity for mutual TLS.
pub fn backend_tls_config(
    roots: Arc<RootCertStore>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
) -> crate::error::Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    match identity {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| crate::error::PortalError::Internal(format!("client identity: {e}"))),
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Build the hyper client carrying requests to one backend. Plain `http://`
/// goes through the inner connector directly; `https://` is terminated with
/// rustls using the supplied config. HTTP/2 is negotiated via ALPN.
pub fn build_backend_client(
    tls_config: rustls::ClientConfig,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .build(https)
}

/// Best-effort TLS handshake against `address:port` within `timeout`.
/// Used at registration time to decide the forwarding scheme for backends
/// that are already listening.
pub async fn probe_backend_tls(
    address: &str,
    port: u16,
    timeout: Duration,
    tls_config: Arc<rustls::ClientConfig>,
) -> bool {
    let address = address.to_string();
    let attempt = async move {
        let tcp = TcpStream::connect((address.as_str(), port)).await.ok()?;
        let server_name = ServerName::try_from(address.clone()).ok()?;
        let connector = tokio_rustls::TlsConnector::from(tls_config);
        connector.connect(server_name, tcp).await.ok()?;
        Some(())
    };
    matches!(tokio::time::timeout(timeout, attempt).await, Ok(Some(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "203.0.113.9:41852".parse().unwrap()
    }

    #[test]
    fn test_forwarded_headers_strip_spoofed() {
        let mut incoming = http::HeaderMap::new();
        incoming.insert("x-forwarded-for", "1.2.3.4".parse().unwrap());
        incoming.insert("x-forwarded-host", "evil.example.com".parse().unwrap());
        incoming.insert("forwarded", "for=1.2.3.4".parse().unwrap());
        incoming.insert("accept", "text/html".parse().unwrap());

        let headers = forwarded_headers(&incoming, "portal", peer(), true, None);
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "portal");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-for-port").unwrap(), "41852");
        assert!(headers.get("forwarded").is_none());
        assert_eq!(headers.get("accept").unwrap(), "text/html");
    }

    #[test]
    fn test_forwarded_headers_plaintext_and_prefix() {
        let incoming = http::HeaderMap::new();
        let headers = forwarded_headers(&incoming, "portal:8080", peer(), false, Some("/app"));
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-prefix").unwrap(), "/app");
        // Host survives with its non-standard port.
        assert_eq!(headers.get(HOST).unwrap(), "portal:8080");
    }
}
