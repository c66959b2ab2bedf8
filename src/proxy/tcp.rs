use crate::error::{PortalError, Result};
use crate::leasor::Lease;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Raw TCP pass-through for `:tcp:<port>` registrations.
///
/// Each registration opens a public TLS listener; accepted connections are
/// unwrapped and spliced byte-for-byte onto a plaintext connection to the
/// backend. The lease's cancellation closes the listener synchronously.
pub struct TcpProxy {
    bind: String,
    routes: DashMap<String, TcpRoute>,
}

struct TcpRoute {
    lease: Lease,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TcpProxy {
    pub fn new(bind: &str) -> Self {
        Self {
            bind: bind.to_string(),
            routes: DashMap::new(),
        }
    }

    /// Open the public listener for `pattern` and start its accept loop.
    /// Replacing an existing lease with the same pattern tears the old
    /// listener down first so the port can be rebound.
    pub async fn register(
        &self,
        pattern: &str,
        public_port: u16,
        backend: SocketAddr,
        lease: &Lease,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<()> {
        if let Some((_, old)) = self.routes.remove(pattern) {
            old.cancel.cancel();
            old.task.abort();
            // The old listener must be dropped before rebinding its port.
            let _ = old.task.await;
        }

        let addr: SocketAddr = format!("{}:{}", self.bind, public_port)
            .parse()
            .map_err(|e| PortalError::Internal(format!("bad tcp listen address: {e}")))?;

        // A replaced listener torn down through cancellation callbacks may
        // still hold the port for a moment; retry briefly before giving up.
        let mut listener = None;
        for attempt in 0..10 {
            match TcpListener::bind(addr).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < 9 => {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
                Err(e) => return Err(PortalError::Internal(format!("bind {addr}: {e}"))),
            }
        }
        let listener = listener.ok_or_else(|| {
            PortalError::Internal(format!("bind {addr}: address still in use"))
        })?;

        info!(
            "tcp: listener opened, pattern={}, public_port={}, backend={}",
            pattern, public_port, backend
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            listener,
            TlsAcceptor::from(tls),
            backend,
            pattern.to_string(),
            cancel.clone(),
        ));

        self.routes.insert(
            pattern.to_string(),
            TcpRoute {
                lease: lease.clone(),
                cancel,
                task,
            },
        );
        Ok(())
    }

    /// The lease currently holding `pattern`, if any. Replacement paths
    /// unregister it before rebinding the public port.
    pub fn lease_for_pattern(&self, pattern: &str) -> Option<Lease> {
        self.routes.get(pattern).map(|r| r.lease.clone())
    }

    /// Close the listener owned by `lease`. Invoked from leasor callbacks
    /// with the leasor lock held; only cancels, never blocks.
    pub fn remove_for_lease(&self, lease: &Lease) {
        let key = lease.key();
        if let Some((_, route)) = self
            .routes
            .remove_if(&lease.pattern, |_, r| r.lease.key() == key)
        {
            info!("tcp: listener closing, pattern={}", lease.pattern);
            route.cancel.cancel();
            route.task.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    backend: SocketAddr,
    pattern: String,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                info!("tcp: listener closed, pattern={}", pattern);
                return;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("tcp: accept failed, pattern={}, error={}", pattern, e);
                continue;
            }
        };
        metrics::counter!(
            "portal_connections_total",
            "plane" => "tcp",
            "status" => "accepted",
        )
        .increment(1);

        let acceptor = acceptor.clone();
        let pattern = pattern.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, acceptor, backend, pattern, cancel).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    backend: SocketAddr,
    pattern: String,
    cancel: CancellationToken,
) {
    let mut tls_stream = tokio::select! {
        _ = cancel.cancelled() => return,
        handshake = acceptor.accept(stream) => match handshake {
            Ok(s) => s,
            Err(e) => {
                warn!("tcp: handshake failed, pattern={}, peer={}, error={}", pattern, peer, e);
                return;
            }
        },
    };

    let mut backend_stream = tokio::select! {
        _ = cancel.cancelled() => return,
        connected = TcpStream::connect(backend) => match connected {
            Ok(s) => s,
            Err(e) => {
                warn!("tcp: backend dial failed, pattern={}, backend={}, error={}", pattern, backend, e);
                return;
            }
        },
    };

    metrics::gauge!("portal_tcp_connections_active", "pattern" => pattern.clone()).increment(1.0);

    // Both directions copy independently; the first close (or the lease's
    // cancellation) takes the peer down with it.
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = tokio::io::copy_bidirectional(&mut tls_stream, &mut backend_stream) => {
            match result {
                Ok((to_backend, to_client)) => debug!(
                    "tcp: connection closed, pattern={}, peer={}, to_backend={}, to_client={}",
                    pattern, peer, to_backend, to_client
                ),
                Err(e) => debug!(
                    "tcp: connection errored, pattern={}, peer={}, error={}",
                    pattern, peer, e
                ),
            }
        }
    }

    metrics::gauge!("portal_tcp_connections_active", "pattern" => pattern).decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn self_signed_server_config() -> Arc<rustls::ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        let key_der = rustls_pki_types::PrivateKeyDer::Pkcs8(key.serialize_der().into());
        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key_der)
            .unwrap();
        Arc::new(config)
    }

    /// Certificate checks are irrelevant here; the test exercises the
    /// byte-splicing path, not the PKI.
    #[derive(Debug)]
    struct NoVerifier;

    impl rustls::client::danger::ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls_pki_types::CertificateDer<'_>,
            _intermediates: &[rustls_pki_types::CertificateDer<'_>],
            _server_name: &rustls_pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls_pki_types::UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
        {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls_pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls_pki_types::CertificateDer<'_>,
            _dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }

    fn lease_for(pattern: &str, port: u16) -> Lease {
        Lease {
            pattern: pattern.to_string(),
            address: "127.0.0.1".to_string(),
            port,
            timeout: SystemTime::now() + std::time::Duration::from_secs(60),
        }
    }

    async fn tls_connect(port: u16) -> tokio_rustls::client::TlsStream<TcpStream> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        connector
            .connect("localhost".try_into().unwrap(), tcp)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tls_unwrap_and_bidirectional_copy() {
        // Plaintext echo backend.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            stream.write_all(b"world").await.unwrap();
        });

        // Pick a free public port by binding and releasing.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public_port = probe.local_addr().unwrap().port();
        drop(probe);

        let proxy = TcpProxy::new("127.0.0.1");
        let pattern = format!(":tcp:{public_port}");
        proxy
            .register(
                &pattern,
                public_port,
                backend_addr,
                &lease_for(&pattern, backend_addr.port()),
                self_signed_server_config(),
            )
            .await
            .unwrap();

        let mut client = tls_connect(public_port).await;
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
    }

    #[tokio::test]
    async fn test_replacement_rebinds_same_port() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();

        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public_port = probe.local_addr().unwrap().port();
        drop(probe);

        let proxy = TcpProxy::new("127.0.0.1");
        let pattern = format!(":tcp:{public_port}");
        let config = self_signed_server_config();

        proxy
            .register(
                &pattern,
                public_port,
                backend_addr,
                &lease_for(&pattern, backend_addr.port()),
                config.clone(),
            )
            .await
            .unwrap();

        // Same pattern again: the old listener must release the port.
        proxy
            .register(
                &pattern,
                public_port,
                backend_addr,
                &lease_for(&pattern, backend_addr.port()),
                config,
            )
            .await
            .unwrap();
        assert_eq!(proxy.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_for_lease_checks_ownership() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let public_port = probe.local_addr().unwrap().port();
        drop(probe);

        let proxy = TcpProxy::new("127.0.0.1");
        let pattern = format!(":tcp:{public_port}");
        let lease = lease_for(&pattern, 50001);
        proxy
            .register(
                &pattern,
                public_port,
                "127.0.0.1:50001".parse().unwrap(),
                &lease,
                self_signed_server_config(),
            )
            .await
            .unwrap();

        let stale = Lease {
            port: 50002,
            ..lease.clone()
        };
        proxy.remove_for_lease(&stale);
        assert_eq!(proxy.len(), 1);

        proxy.remove_for_lease(&lease);
        assert_eq!(proxy.len(), 0);
    }
}
