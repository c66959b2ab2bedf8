mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::PortalState;

use crate::proxy;
use crate::routing::HttpRouter;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// How long in-flight connections get to finish after the quit signal.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Run the plaintext HTTP data plane with graceful shutdown.
///
/// Plaintext traffic mostly exists to answer ACME challenges and bounce
/// clients to HTTPS; forwarders opt in to plaintext with `allow_http`.
pub async fn run_http_server(
    listener: TcpListener,
    router: Arc<HttpRouter>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let active = Arc::new(AtomicI64::new(0));
    info!(
        "server: http listening, addr={}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: http: stop accepting, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: http: accept failed, error={}", e);
                metrics::counter!("portal_connections_total", "plane" => "http", "status" => "error")
                    .increment(1);
                continue;
            }
        };
        metrics::counter!("portal_connections_total", "plane" => "http", "status" => "accepted")
            .increment(1);
        metrics::gauge!("portal_connections_active", "plane" => "http").increment(1.0);
        active.fetch_add(1, Ordering::Relaxed);

        let router = router.clone();
        let active = active.clone();
        tokio::spawn(async move {
            serve_http_connection(stream, peer_addr, router, false).await;
            metrics::gauge!("portal_connections_active", "plane" => "http").decrement(1.0);
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    drain_connections(&active, "http").await;
    Ok(())
}

/// Run the HTTPS data plane: TLS handshake against the serving-certificate
/// chain, then the same dispatcher with `secure = true`. HTTP/2 is enabled
/// through ALPN in the server config.
pub async fn run_https_server(
    listener: TcpListener,
    tls: Arc<rustls::ServerConfig>,
    router: Arc<HttpRouter>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);
    let active = Arc::new(AtomicI64::new(0));
    info!(
        "server: https listening, addr={}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.notified() => {
                info!("server: https: stop accepting, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: https: accept failed, error={}", e);
                metrics::counter!("portal_connections_total", "plane" => "https", "status" => "error")
                    .increment(1);
                continue;
            }
        };
        metrics::counter!("portal_connections_total", "plane" => "https", "status" => "accepted")
            .increment(1);

        let acceptor = acceptor.clone();
        let router = router.clone();
        let active = active.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(
                        "server: https: handshake failed, peer={}, error={}",
                        peer_addr, e
                    );
                    return;
                }
            };
            metrics::gauge!("portal_connections_active", "plane" => "https").increment(1.0);
            active.fetch_add(1, Ordering::Relaxed);
            serve_http_connection(tls_stream, peer_addr, router, true).await;
            metrics::gauge!("portal_connections_active", "plane" => "https").decrement(1.0);
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    drain_connections(&active, "https").await;
    Ok(())
}

async fn serve_http_connection<S>(
    stream: S,
    peer_addr: SocketAddr,
    router: Arc<HttpRouter>,
    secure: bool,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req: Request<Incoming>| {
        let router = router.clone();
        async move { proxy::handle_request(req, router, peer_addr, secure).await }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await
    {
        if !e.to_string().contains("connection closed") {
            debug!(
                "server: connection error, peer={}, secure={}, error={}",
                peer_addr, secure, e
            );
        }
    }
}

/// Wait for in-flight connections to finish, up to `DRAIN_TIMEOUT`.
async fn drain_connections(active: &Arc<AtomicI64>, plane: &str) {
    if active.load(Ordering::Relaxed) == 0 {
        return;
    }
    info!(
        "server: {}: waiting for {} active connection(s) to drain",
        plane,
        active.load(Ordering::Relaxed)
    );
    let wait = async {
        while active.load(Ordering::Relaxed) > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, wait).await {
        Ok(_) => info!("server: {}: all connections drained", plane),
        Err(_) => info!(
            "server: {}: drain timeout ({}s), {} connection(s) still active",
            plane,
            DRAIN_TIMEOUT.as_secs(),
            active.load(Ordering::Relaxed)
        ),
    }
}

/// Run the diagnostics server (health, readiness, metrics, registrations).
pub async fn run_admin_server(listen: &str, state: PortalState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
