use crate::cert::{AcmeClient, CertSource, CertificateAuthority, ServingContext, ServingEntry};
use crate::config::PortalConfig;
use crate::leasor::ClientLeasor;
use crate::metrics::Metrics;
use crate::proxy::tcp::TcpProxy;
use crate::routing::HttpRouter;
use crate::state::StateManager;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Shared portal state, cheaply cloneable. Built once at bootstrap and
/// handed (in whole or in part) to the servers, the RPC service, and the
/// background loops.
#[derive(Clone)]
pub struct PortalState {
    pub config: Arc<PortalConfig>,
    pub metrics: Metrics,
    pub state: Arc<StateManager>,
    pub leasor: Arc<ClientLeasor>,
    pub router: Arc<HttpRouter>,
    pub tcp: Arc<TcpProxy>,
    pub ca: Arc<CertificateAuthority>,
    pub serving: Arc<ServingContext>,
    pub acme: Option<Arc<AcmeClient>>,
}

impl PortalState {
    /// Wire up every component. `pipe_pairs` are inherited (cert, key)
    /// pipe file descriptors from the supervisor, in order.
    pub fn new(
        config: PortalConfig,
        pipe_pairs: Vec<(std::fs::File, std::fs::File)>,
    ) -> Result<Self> {
        let metrics = Metrics::install();

        let state = Arc::new(StateManager::open(&config.state.path)?);

        let leasor = Arc::new(ClientLeasor::new(
            config.leases.port_range_start,
            config.leases.port_range_end,
            config.leases.ttl(),
            config.leases.reserved_ports.clone(),
        ));

        let router = Arc::new(HttpRouter::new(
            config.server.default_host.clone(),
            config.tls.challenge_webroot.clone(),
        ));

        let tcp = Arc::new(TcpProxy::new(&config.server.bind));

        let ca = Arc::new(CertificateAuthority::new(
            config.leases.ca_ttl(),
            config.leases.ttl(),
        )?);
        // The freshly generated root joins the trust pool immediately so
        // backend transports built before the first rotation verify.
        state.add_root_ca(ca.cert_der()).ok();

        let mut entries: Vec<Arc<ServingEntry>> = Vec::new();
        for pair in &config.tls.certificates {
            entries.push(ServingEntry::new(CertSource::FilePair {
                cert: pair.cert.clone(),
                key: pair.key.clone(),
            }));
        }
        for (cert, key) in pipe_pairs {
            entries.push(ServingEntry::new(CertSource::PipePair {
                cert: std::sync::Mutex::new(cert),
                key: std::sync::Mutex::new(key),
            }));
        }
        for domain in &config.tls.acme.domains {
            entries.push(ServingEntry::new(CertSource::AcmeDomain(domain.clone())));
        }
        if entries.is_empty() && config.tls.self_signed_fallback {
            info!("server: no serving certificates configured, using self-signed fallback");
            entries.push(ServingEntry::new(CertSource::SelfSigned));
        }
        let serving = ServingContext::new(entries);

        let acme = if config.tls.acme.domains.is_empty() {
            None
        } else {
            Some(Arc::new(AcmeClient::new(
                state.clone(),
                router.challenges(),
                config
                    .tls
                    .acme
                    .contact
                    .clone()
                    .unwrap_or_default(),
                config.tls.acme.directory.clone(),
            )))
        };

        Ok(Self {
            config: Arc::new(config),
            metrics,
            state,
            leasor,
            router,
            tcp,
            ca,
            serving,
            acme,
        })
    }

    /// Hook lease cancellation into route teardown and persistence. Runs
    /// under the leasor lock, so the state removal defers its file write.
    pub fn wire_lease_teardown(&self) {
        let router = self.router.clone();
        let tcp = self.tcp.clone();
        let store = self.state.clone();
        self.leasor.on_cancel(Arc::new(move |lease, reason| {
            // A replacement eviction hands the port to a new lease under a
            // different pattern; the old pattern keeps forwarding to it.
            if reason != crate::leasor::CancelReason::Replaced {
                router.remove_for_lease(lease);
            }
            tcp.remove_for_lease(lease);
            store.remove_registration_deferred(&lease.key());
        }));
    }
}
