use crate::cert::CertificateAuthority;
use crate::error::{PortalError, Result as PortalResult};
use crate::leasor::{ClientLeasor, Lease};
use crate::proto;
use crate::proxy::forwarder::{
    backend_tls_config, build_backend_client, probe_backend_tls, Forwarder,
};
use crate::proxy::tcp::TcpProxy;
use crate::routing::{HttpRouter, HttpPattern, Pattern};
use crate::state::StateManager;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tonic::transport::server::Connected;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// The authenticated registration service: `Register`, `Renew`,
/// `Unregister`, and `MyHostname` over gRPC + TLS.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct PortalService {
    state: Arc<StateManager>,
    leasor: Arc<ClientLeasor>,
    router: Arc<HttpRouter>,
    tcp: Arc<TcpProxy>,
    ca: Arc<CertificateAuthority>,
    /// Serving TLS used by per-lease public TCP listeners.
    serving_tls: Arc<rustls::ServerConfig>,
    probe_timeout: Duration,
}

impl PortalService {
    pub fn new(
        state: Arc<StateManager>,
        leasor: Arc<ClientLeasor>,
        router: Arc<HttpRouter>,
        tcp: Arc<TcpProxy>,
        ca: Arc<CertificateAuthority>,
        serving_tls: Arc<rustls::ServerConfig>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            state,
            leasor,
            router,
            tcp,
            ca,
            serving_tls,
            probe_timeout,
        }
    }

    /// Replay persisted registrations. Runs before the RPC listener accepts
    /// calls so restored forwarders are routable first. Lease TTLs restart
    /// from now; clients renew on their own schedule.
    pub async fn restore(&self) {
        let registrations = self.state.registrations();
        if registrations.is_empty() {
            return;
        }
        info!("rpc: restoring {} registration(s)", registrations.len());
        for registration in registrations {
            let Some(mut request) = registration.request else {
                continue;
            };
            let Some(lease) = registration.lease else {
                continue;
            };
            // Reissue the same port across restarts.
            if request.fixed_port == 0 {
                request.fixed_port = lease.port;
            }
            let pattern = request.pattern.clone();
            match self
                .register_inner(request, lease.address.clone(), false)
                .await
            {
                Ok(_) => info!(
                    "rpc: restored registration, pattern={}, address={}, port={}",
                    pattern, lease.address, lease.port
                ),
                Err(e) => warn!(
                    "rpc: failed to restore registration, pattern={}, error={}",
                    pattern, e
                ),
            }
        }
    }

    fn authenticate<T>(&self, request: &Request<T>) -> std::result::Result<(), Status> {
        let value = request
            .metadata()
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("missing authorization token"))?;
        let token = value
            .to_str()
            .map_err(|_| Status::unauthenticated("malformed authorization token"))?;
        if self.state.token_matches(token) {
            Ok(())
        } else {
            Err(Status::unauthenticated("bad authorization token"))
        }
    }

    fn peer_ip<T>(&self, request: &Request<T>) -> std::result::Result<IpAddr, Status> {
        request
            .extensions()
            .get::<PeerAddr>()
            .map(|peer| peer.0.ip())
            .ok_or_else(|| Status::internal("connection without peer address"))
    }

    /// The backend address a registration binds to: the peer IP, unless the
    /// request carries a hostname override, which is resolved once here and
    /// never re-resolved at dispatch time.
    async fn resolve_address(
        &self,
        request: &proto::RegisterRequest,
        peer: IpAddr,
    ) -> PortalResult<String> {
        if request.hostname.is_empty() {
            return Ok(peer.to_string());
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((request.hostname.as_str(), 0))
            .await
            .map_err(|e| {
                PortalError::HostnameResolve(format!("{}: {e}", request.hostname))
            })?
            .collect();
        let resolved = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .ok_or_else(|| {
                PortalError::HostnameResolve(format!("{}: no addresses", request.hostname))
            })?;
        Ok(resolved.ip().to_string())
    }

    /// Shared registration path for live RPCs and state restore. When
    /// `persist` is false the registration is not re-written to disk.
    pub async fn register_inner(
        &self,
        request: proto::RegisterRequest,
        address: String,
        persist: bool,
    ) -> PortalResult<proto::Lease> {
        match Pattern::parse(&request.pattern)? {
            Pattern::Tcp(public_port) => {
                self.register_tcp(request, address, public_port, persist)
                    .await
            }
            Pattern::Http(_) => {
                let pattern = self.router.validate_pattern(&request.pattern)?;
                self.register_http(request, pattern, address, persist).await
            }
        }
    }

    async fn register_http(
        &self,
        request: proto::RegisterRequest,
        pattern: HttpPattern,
        address: String,
        persist: bool,
    ) -> PortalResult<proto::Lease> {
        // Lease replacement: an existing forwarder covering this exact
        // pattern is unregistered first, tearing down its routes.
        if let Some(existing) = self.router.get(pattern.raw()) {
            let old = existing.lease().clone();
            if let Some(leasor) = self.leasor.get(&old.address) {
                if let Err(e) = leasor.unregister(&old) {
                    debug!(
                        "rpc: stale forwarder had no lease, pattern={}, error={}",
                        old.pattern, e
                    );
                }
            }
        }

        let leasor = self.leasor.leasor_for(&address);
        let lease = leasor.register(&request.pattern, request.fixed_port)?;

        match self.finish_http_registration(&request, &pattern, &lease).await {
            Ok(lease_proto) => {
                if persist {
                    self.persist_registration(&request, &lease);
                }
                metrics::counter!("portal_lease_operations_total", "op" => "register", "result" => "success")
                    .increment(1);
                Ok(lease_proto)
            }
            Err(e) => {
                // Roll back: the port returns to the pool and the callbacks
                // tear down anything half-installed.
                let _ = leasor.unregister(&lease);
                metrics::counter!("portal_lease_operations_total", "op" => "register", "result" => "error")
                    .increment(1);
                Err(e)
            }
        }
    }

    async fn finish_http_registration(
        &self,
        request: &proto::RegisterRequest,
        pattern: &HttpPattern,
        lease: &Lease,
    ) -> PortalResult<proto::Lease> {
        let has_csr = !request.certificate_request.is_empty();

        let tls_config = backend_tls_config(
            self.state.trust_pool(),
            Some(self.ca.client_identity()?),
        )?;

        // A CSR implies the backend will serve TLS under a certificate we
        // sign. A fixed port means the backend is already listening, so a
        // best-effort handshake decides; random-port backends start after
        // this response returns and default to plaintext.
        let https = if has_csr {
            true
        } else if request.fixed_port != 0 {
            let probed = probe_backend_tls(
                &lease.address,
                lease.port,
                self.probe_timeout,
                Arc::new(tls_config.clone()),
            )
            .await;
            if !probed {
                warn!(
                    "rpc: tls probe failed, forwarding plaintext, address={}, port={}",
                    lease.address, lease.port
                );
            }
            probed
        } else {
            false
        };

        let forwarder = Arc::new(Forwarder::new(
            pattern.clone(),
            lease.clone(),
            https,
            request.strip_pattern,
            request.allow_http,
            build_backend_client(tls_config),
        ));
        self.router.insert(forwarder);

        let certificate = if has_csr {
            self.ca.sign_csr(&request.certificate_request)?
        } else {
            Vec::new()
        };

        Ok(lease_to_proto(lease, certificate))
    }

    async fn register_tcp(
        &self,
        request: proto::RegisterRequest,
        address: String,
        public_port: u16,
        persist: bool,
    ) -> PortalResult<proto::Lease> {
        // Replacement: release the lease currently bound to this pattern;
        // its callbacks close the old public listener.
        if let Some(old) = self.tcp.lease_for_pattern(&request.pattern) {
            if let Some(leasor) = self.leasor.get(&old.address) {
                if let Err(e) = leasor.unregister(&old) {
                    debug!(
                        "rpc: stale tcp route had no lease, pattern={}, error={}",
                        old.pattern, e
                    );
                }
            }
        }

        let leasor = self.leasor.leasor_for(&address);
        let lease = leasor.register(&request.pattern, request.fixed_port)?;

        let backend: SocketAddr = format!("{}:{}", address, lease.port)
            .parse()
            .map_err(|e| PortalError::Internal(format!("backend address: {e}")))?;

        let result = self
            .tcp
            .register(
                &request.pattern,
                public_port,
                backend,
                &lease,
                self.serving_tls.clone(),
            )
            .await;

        match result {
            Ok(()) => {
                let certificate = if request.certificate_request.is_empty() {
                    Vec::new()
                } else {
                    self.ca.sign_csr(&request.certificate_request)?
                };
                if persist {
                    self.persist_registration(&request, &lease);
                }
                metrics::counter!("portal_lease_operations_total", "op" => "register", "result" => "success")
                    .increment(1);
                Ok(lease_to_proto(&lease, certificate))
            }
            Err(e) => {
                let _ = leasor.unregister(&lease);
                metrics::counter!("portal_lease_operations_total", "op" => "register", "result" => "error")
                    .increment(1);
                Err(e)
            }
        }
    }

    /// Store the registration. Persistence failures are logged, never
    /// rolled back; the next successful save catches up.
    fn persist_registration(&self, request: &proto::RegisterRequest, lease: &Lease) {
        let registration = proto::Registration {
            request: Some(request.clone()),
            lease: Some(lease_to_proto(lease, Vec::new())),
        };
        if let Err(e) = self.state.upsert_registration(registration) {
            warn!("rpc: persisting registration failed: {}", e);
        }
    }

    pub fn renew_inner(&self, lease: &Lease) -> PortalResult<proto::Lease> {
        let leasor = self
            .leasor
            .get(&lease.address)
            .ok_or(PortalError::Unregistered)?;
        let renewed = leasor.renew(lease)?;
        let key = renewed.key();

        // Re-sign when the original registration carried a CSR, so the
        // certificate's lifetime keeps tracking the lease.
        let mut certificate = Vec::new();
        if let Some(registration) = self.state.registration(&key) {
            if let Some(original) = registration.request {
                if !original.certificate_request.is_empty() {
                    certificate = self.ca.sign_csr(&original.certificate_request)?;
                }
            }
        }

        if let Err(e) = self
            .state
            .renew_registration(&key, unix_seconds(renewed.timeout))
        {
            warn!("rpc: persisting renewal failed, key={}, error={}", key, e);
        }
        metrics::counter!("portal_lease_operations_total", "op" => "renew", "result" => "success")
            .increment(1);
        Ok(lease_to_proto(&renewed, certificate))
    }

    pub fn unregister_inner(&self, lease: &Lease) -> PortalResult<proto::Lease> {
        let leasor = self
            .leasor
            .get(&lease.address)
            .ok_or(PortalError::Unregistered)?;
        // Cancellation callbacks tear down the forwarder or TCP listener
        // and drop the in-memory registration.
        let removed = leasor.unregister(lease)?;
        if let Err(e) = self.state.remove_registration(&removed.key()) {
            warn!("rpc: persisting unregister failed: {}", e);
        }
        metrics::counter!("portal_lease_operations_total", "op" => "unregister", "result" => "success")
            .increment(1);

        let mut proto_lease = lease_to_proto(&removed, Vec::new());
        proto_lease.timeout = unix_seconds(SystemTime::now());
        Ok(proto_lease)
    }

    /// Serve the RPC surface over TLS on `listener`, presenting the current
    /// internal-CA leaf. Handshakes happen before connections are handed to
    /// tonic, so the certificate rotates without restarting the server.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: Arc<Notify>,
    ) -> anyhow::Result<()> {
        let resolver = CaLeafResolver {
            ca: self.ca.clone(),
        };
        let mut tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        tls_config.alpn_protocols = vec![b"h2".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let (conn_tx, conn_rx) = tokio::sync::mpsc::channel::<std::io::Result<TlsConn>>(64);

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_shutdown.notified() => return,
                    accepted = listener.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("rpc: accept failed, error={}", e);
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let conn_tx = conn_tx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls_stream) => {
                            let _ = conn_tx
                                .send(Ok(TlsConn {
                                    inner: tls_stream,
                                    peer,
                                }))
                                .await;
                        }
                        Err(e) => {
                            debug!("rpc: tls handshake failed, peer={}, error={}", peer, e);
                        }
                    }
                });
            }
        });

        let incoming = tokio_stream::wrappers::ReceiverStream::new(conn_rx);
        tonic::transport::Server::builder()
            .add_service(proto::portal_server::PortalServer::new(self.clone()))
            .serve_with_incoming_shutdown(incoming, async move {
                shutdown.notified().await;
            })
            .await?;
        Ok(())
    }
}

#[tonic::async_trait]
impl proto::portal_server::Portal for PortalService {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> std::result::Result<Response<proto::Lease>, Status> {
        self.authenticate(&request)?;
        let peer = self.peer_ip(&request)?;
        let register_request = request.into_inner();

        let address = self.resolve_address(&register_request, peer).await?;
        info!(
            "rpc: register, pattern={}, address={}, fixed_port={}",
            register_request.pattern, address, register_request.fixed_port
        );
        let lease = self
            .register_inner(register_request, address, true)
            .await?;
        Ok(Response::new(lease))
    }

    async fn renew(
        &self,
        request: Request<proto::Lease>,
    ) -> std::result::Result<Response<proto::Lease>, Status> {
        self.authenticate(&request)?;
        let lease = lease_from_proto(&request.into_inner());
        debug!(
            "rpc: renew, pattern={}, address={}, port={}",
            lease.pattern, lease.address, lease.port
        );
        let renewed = self.renew_inner(&lease)?;
        Ok(Response::new(renewed))
    }

    async fn unregister(
        &self,
        request: Request<proto::Lease>,
    ) -> std::result::Result<Response<proto::Lease>, Status> {
        self.authenticate(&request)?;
        let lease = lease_from_proto(&request.into_inner());
        info!(
            "rpc: unregister, pattern={}, address={}, port={}",
            lease.pattern, lease.address, lease.port
        );
        let removed = self.unregister_inner(&lease)?;
        Ok(Response::new(removed))
    }

    async fn my_hostname(
        &self,
        request: Request<proto::Empty>,
    ) -> std::result::Result<Response<proto::Hostname>, Status> {
        self.authenticate(&request)?;
        let peer = self.peer_ip(&request)?;
        Ok(Response::new(proto::Hostname {
            hostname: peer.to_string(),
        }))
    }
}

/// Presents the rotating internal-CA leaf on every RPC handshake.
struct CaLeafResolver {
    ca: Arc<CertificateAuthority>,
}

impl std::fmt::Debug for CaLeafResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CaLeafResolver")
    }
}

impl rustls::server::ResolvesServerCert for CaLeafResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        Some(self.ca.certified_key())
    }
}

/// Peer address attached to each RPC connection.
#[derive(Clone, Copy, Debug)]
pub struct PeerAddr(pub SocketAddr);

/// A TLS-wrapped RPC connection handed to tonic.
pub struct TlsConn {
    inner: tokio_rustls::server::TlsStream<TcpStream>,
    peer: SocketAddr,
}

impl Connected for TlsConn {
    type ConnectInfo = PeerAddr;

    fn connect_info(&self) -> Self::ConnectInfo {
        PeerAddr(self.peer)
    }
}

impl AsyncRead for TlsConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub fn unix_seconds(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn from_unix_seconds(seconds: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(seconds.max(0) as u64)
}

pub fn lease_to_proto(lease: &Lease, certificate: Vec<u8>) -> proto::Lease {
    proto::Lease {
        pattern: lease.pattern.clone(),
        address: lease.address.clone(),
        port: lease.port as u32,
        timeout: unix_seconds(lease.timeout),
        certificate,
    }
}

pub fn lease_from_proto(lease: &proto::Lease) -> Lease {
    Lease {
        pattern: lease.pattern.clone(),
        address: lease.address.clone(),
        port: lease.port as u16,
        timeout: from_unix_seconds(lease.timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_proto_round_trip() {
        let lease = Lease {
            pattern: "/hello/".into(),
            address: "10.0.0.5".into(),
            port: 2051,
            timeout: from_unix_seconds(1_900_000_000),
        };
        let proto_lease = lease_to_proto(&lease, vec![9, 9]);
        assert_eq!(proto_lease.port, 2051);
        assert_eq!(proto_lease.timeout, 1_900_000_000);
        assert_eq!(proto_lease.certificate, vec![9, 9]);

        let back = lease_from_proto(&proto_lease);
        assert_eq!(back, lease);
    }
}
