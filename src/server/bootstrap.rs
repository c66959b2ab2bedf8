use crate::cert::{refresh_delay, CertSource, ServingEntry};
use crate::config::PortalConfig;
use crate::rpc::PortalService;
use crate::server::{self, PortalState};
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
}

/// Portal lifecycle: load state → wire components → serve → shutdown.
///
/// Startup order matters: the HTTP plane comes up before serving
/// certificates load because ACME HTTP-01 challenges are answered over
/// plaintext, and the RPC server replays persisted registrations before it
/// accepts new calls.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Several rustls backends can end up linked in; pin ring explicitly.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = PortalConfig::load(&args.config_path)?;
    let (mut inherited_sockets, pipe_pairs) = inherited_fds();
    if !inherited_sockets.is_empty() || !pipe_pairs.is_empty() {
        info!(
            "server: inherited {} socket(s) and {} certificate pipe pair(s)",
            inherited_sockets.len(),
            pipe_pairs.len()
        );
    }

    let state = PortalState::new(config, pipe_pairs)?;
    let cfg = state.config.clone();

    let shutdown = Arc::new(Notify::new());

    // Evicted, expired, and unregistered leases tear down their routes and
    // drop the persisted registration.
    state.wire_lease_teardown();

    start_sweep_loop(&state, &shutdown);
    start_ca_renewal_loop(&state, &shutdown);
    start_deferred_saver(&state, &shutdown);

    // Listener acquisition: adopt pre-bound sockets from the supervisor
    // when their port matches, otherwise bind directly.
    let http_listener = acquire_listener(&mut inherited_sockets, &cfg.server.bind, cfg.server.http_port)?;
    let https_listener =
        acquire_listener(&mut inherited_sockets, &cfg.server.bind, cfg.server.https_port)?;
    drop(inherited_sockets);

    let http_handle = spawn_data_plane(
        "http",
        server::run_http_server(http_listener, state.router.clone(), shutdown.clone()),
        &shutdown,
    );

    // May drive ACME orders, which answer over the HTTP plane.
    load_serving_certificates(&state).await;
    start_cert_refresh_loops(&state, &shutdown);
    start_reload_signal(&state);

    let serving_tls = state.serving.server_config();

    // RPC: restore persisted registrations, then accept new calls.
    let service = PortalService::new(
        state.state.clone(),
        state.leasor.clone(),
        state.router.clone(),
        state.tcp.clone(),
        state.ca.clone(),
        serving_tls.clone(),
        state.config.tls.probe_timeout(),
    );
    service.restore().await;
    info!(
        "server: restored routing table, forwarders={}, tcp_routes={}",
        state.router.len(),
        state.tcp.len()
    );

    let rpc_addr: SocketAddr = format!("{}:{}", cfg.server.bind, cfg.server.rpc_port).parse()?;
    let rpc_listener = TcpListener::bind(rpc_addr).await?;
    info!("server: rpc listening, addr={}", rpc_addr);
    {
        let shutdown = shutdown.clone();
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.serve(rpc_listener, shutdown.clone()).await {
                error!("server: rpc server died, error={}", e);
                shutdown.notify_waiters();
            }
        });
    }

    let https_handle = spawn_data_plane(
        "https",
        server::run_https_server(
            https_listener,
            serving_tls,
            state.router.clone(),
            shutdown.clone(),
        ),
        &shutdown,
    );

    start_admin_server(&state, &shutdown);

    // The supervisor scans raw stdout for this marker; keep it off the
    // structured log stream.
    println!("**** Portal API token: {} ****", state.state.token());

    wait_for_shutdown(&shutdown).await;

    // Let the data planes finish draining.
    if let Err(e) = http_handle.await {
        error!("server: http task error: {}", e);
    }
    if let Err(e) = https_handle.await {
        error!("server: https task error: {}", e);
    }

    if let Err(e) = state.state.save() {
        warn!("state: final save failed: {}", e);
    }
    info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

// ---------------------------------------------------------------------------
// Inherited file descriptors — the privileged supervisor opens <1024 ports
// and hands them down, together with certificate pipe pairs.
// ---------------------------------------------------------------------------

/// `SPAWN_PORTS` counts inherited socket FDs starting at 3; `SPAWN_FILES`
/// counts regular-file FDs following them, consumed as (cert, key) pairs.
#[cfg(unix)]
fn inherited_fds() -> (
    Vec<std::net::TcpListener>,
    Vec<(std::fs::File, std::fs::File)>,
) {
    use std::os::unix::io::FromRawFd;

    let count = |name: &str| {
        std::env::var(name)
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(0)
    };
    let port_count = count("SPAWN_PORTS");
    let file_count = count("SPAWN_FILES");

    let mut sockets = Vec::new();
    for i in 0..port_count {
        sockets.push(unsafe { std::net::TcpListener::from_raw_fd(3 + i) });
    }

    let mut pipes = Vec::new();
    let base = 3 + port_count;
    let mut fd = base;
    while fd + 1 < base + file_count {
        let cert = unsafe { std::fs::File::from_raw_fd(fd) };
        let key = unsafe { std::fs::File::from_raw_fd(fd + 1) };
        pipes.push((cert, key));
        fd += 2;
    }
    (sockets, pipes)
}

#[cfg(not(unix))]
fn inherited_fds() -> (
    Vec<std::net::TcpListener>,
    Vec<(std::fs::File, std::fs::File)>,
) {
    (Vec::new(), Vec::new())
}

/// Adopt an inherited socket whose bound port matches, or bind directly.
fn acquire_listener(
    inherited: &mut Vec<std::net::TcpListener>,
    bind: &str,
    port: u16,
) -> Result<TcpListener> {
    if let Some(pos) = inherited
        .iter()
        .position(|l| l.local_addr().map(|a| a.port() == port).unwrap_or(false))
    {
        let listener = inherited.remove(pos);
        listener.set_nonblocking(true)?;
        info!("server: adopted inherited listener, port={}", port);
        return Ok(TcpListener::from_std(listener)?);
    }

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(listener)?)
}

// ---------------------------------------------------------------------------
// Loop owners — each function spawns a task owning one retry/interval loop.
// The leasor/cert/state modules only provide single-shot operations.
// ---------------------------------------------------------------------------

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` when the full duration elapsed.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

fn start_sweep_loop(state: &PortalState, shutdown: &Arc<Notify>) {
    let leasor = state.leasor.clone();
    let interval = state.config.leases.sweep_interval();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            let removed = leasor.sweep_all();
            if removed > 0 {
                info!("leasor: sweep removed {} expired lease(s)", removed);
            }
        }
    });
}

fn start_ca_renewal_loop(state: &PortalState, shutdown: &Arc<Notify>) {
    let ca = state.ca.clone();
    let store = state.state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(ca.renewal_interval(), &shutdown).await {
                return;
            }
            match ca.rotate() {
                Ok(der) => {
                    if let Err(e) = store.add_root_ca(der) {
                        warn!("ca: persisting rotated root failed: {}", e);
                    }
                }
                Err(e) => {
                    error!("ca: rotation failed: {}", e);
                    metrics::counter!("portal_cert_renewals_total", "source" => "internal_ca", "result" => "error")
                        .increment(1);
                }
            }
        }
    });
}

fn start_deferred_saver(state: &PortalState, shutdown: &Arc<Notify>) {
    let store = state.state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = store.save_requested() => {
                    if let Err(e) = store.save() {
                        warn!("state: deferred save failed: {}", e);
                    }
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

/// Initial pass over the serving-certificate chain. Pipe sources are read
/// by their refresh loops; everything else loads here so the HTTPS plane
/// starts with certificates installed.
async fn load_serving_certificates(state: &PortalState) {
    for entry in state.serving.entries() {
        match entry.source() {
            CertSource::FilePair { .. } => {
                if let Err(e) = entry.refresh_from_files() {
                    warn!("cert: initial load failed, source={:?}, error={}", entry.source(), e);
                }
            }
            CertSource::SelfSigned => {
                if let Err(e) = entry.refresh_self_signed() {
                    warn!("cert: fallback generation failed: {}", e);
                }
            }
            CertSource::AcmeDomain(domain) => {
                let Some(acme) = &state.acme else { continue };
                match acme.ensure_certificate(domain).await {
                    Ok(cached) => entry.install(cached),
                    Err(e) => warn!("acme: initial order failed, domain={}, error={}", domain, e),
                }
            }
            CertSource::PipePair { .. } => {}
        }
    }
}

fn start_cert_refresh_loops(state: &PortalState, shutdown: &Arc<Notify>) {
    for entry in state.serving.entries() {
        let entry = entry.clone();
        match entry.source() {
            CertSource::FilePair { .. } => {
                spawn_timed_refresh(entry, shutdown.clone(), |e| e.refresh_from_files())
            }
            CertSource::SelfSigned => {
                spawn_timed_refresh(entry, shutdown.clone(), |e| e.refresh_self_signed())
            }
            CertSource::AcmeDomain(domain) => {
                let Some(acme) = state.acme.clone() else { continue };
                let domain = domain.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let delay = next_refresh_delay(&entry);
                        if sleep_or_shutdown(delay, &shutdown).await {
                            return;
                        }
                        match acme.ensure_certificate(&domain).await {
                            Ok(cached) => entry.install(cached),
                            Err(e) => {
                                warn!("acme: refresh failed, domain={}, error={}", domain, e)
                            }
                        }
                    }
                });
            }
            CertSource::PipePair { .. } => {
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let blocking_entry = entry.clone();
                        let read = tokio::task::spawn_blocking(move || {
                            blocking_entry.refresh_from_pipes_blocking()
                        });
                        tokio::select! {
                            _ = shutdown.notified() => return,
                            joined = read => match joined {
                                Ok(Ok(())) => {
                                    metrics::counter!("portal_cert_renewals_total", "source" => "pipe", "result" => "success")
                                        .increment(1);
                                }
                                Ok(Err(e)) => {
                                    warn!("cert: pipe refresh failed: {}", e);
                                    metrics::counter!("portal_cert_renewals_total", "source" => "pipe", "result" => "error")
                                        .increment(1);
                                    if sleep_or_shutdown(std::time::Duration::from_secs(60), &shutdown).await {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    error!("cert: pipe refresh task panicked: {}", e);
                                    return;
                                }
                            },
                        }
                    }
                });
            }
        }
    }
}

fn spawn_timed_refresh(
    entry: Arc<ServingEntry>,
    shutdown: Arc<Notify>,
    refresh: fn(&ServingEntry) -> crate::error::Result<()>,
) {
    tokio::spawn(async move {
        let source = entry.source().label();
        loop {
            let delay = next_refresh_delay(&entry);
            if sleep_or_shutdown(delay, &shutdown).await {
                return;
            }
            match refresh(&entry) {
                Ok(()) => {
                    metrics::counter!("portal_cert_renewals_total", "source" => source, "result" => "success")
                        .increment(1);
                }
                Err(e) => {
                    warn!("cert: refresh failed, source={:?}, error={}", entry.source(), e);
                    metrics::counter!("portal_cert_renewals_total", "source" => source, "result" => "error")
                        .increment(1);
                }
            }
        }
    });
}

fn next_refresh_delay(entry: &ServingEntry) -> std::time::Duration {
    entry
        .cached()
        .map(|cached| refresh_delay(cached.not_after))
        .unwrap_or(std::time::Duration::from_secs(60))
}

/// SIGHUP re-reads file-backed certificates without a restart.
fn start_reload_signal(state: &PortalState) {
    #[cfg(unix)]
    {
        let serving = state.serving.clone();
        tokio::spawn(async move {
            let mut hangup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("server: SIGHUP handler unavailable: {}", e);
                        return;
                    }
                };
            while hangup.recv().await.is_some() {
                info!("cert: reload signal received, refreshing file-backed certificates");
                serving.refresh_file_backed();
            }
        });
    }
    #[cfg(not(unix))]
    let _ = state;
}

fn spawn_data_plane(
    name: &'static str,
    plane: impl std::future::Future<Output = Result<()>> + Send + 'static,
    shutdown: &Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = plane.await {
            // Data-plane death is fatal: collapse the whole process.
            error!("server: {} plane died, error={}", name, e);
            shutdown.notify_waiters();
        }
    })
}

fn start_admin_server(state: &PortalState, shutdown: &Arc<Notify>) {
    let s = state.clone();
    let admin_addr = format!("{}:{}", state.config.server.bind, state.config.server.admin_port);
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = server::run_admin_server(&admin_addr, s) => {
                if let Err(e) = result {
                    error!("server: admin failed, error={}", e);
                }
            }
            _ = shutdown.notified() => {}
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("server: received SIGINT, shutting down"),
        _ = terminate => info!("server: received SIGTERM, shutting down"),
        _ = shutdown.notified() => info!("server: internal shutdown requested"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}
