//! Lease lifecycle and crash-restore scenarios exercised through the
//! library API, without opening any listeners.

use portal::config::PortalConfig;
use portal::proto;
use portal::routing::RouteOutcome;
use portal::rpc::{lease_from_proto, PortalService};
use portal::server::PortalState;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn build_state(state_path: &Path) -> PortalState {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let mut config = PortalConfig::default();
    config.state.path = state_path.to_path_buf();
    // No ACME, no files: the serving chain is the self-signed fallback.
    config.tls.acme.domains.clear();

    let state = PortalState::new(config, Vec::new()).unwrap();
    state.wire_lease_teardown();
    state
}

fn build_service(state: &PortalState) -> PortalService {
    PortalService::new(
        state.state.clone(),
        state.leasor.clone(),
        state.router.clone(),
        state.tcp.clone(),
        state.ca.clone(),
        state.serving.server_config(),
        Duration::from_secs(1),
    )
}

fn register_request(pattern: &str) -> proto::RegisterRequest {
    proto::RegisterRequest {
        pattern: pattern.to_string(),
        fixed_port: 0,
        hostname: String::new(),
        strip_pattern: false,
        allow_http: false,
        certificate_request: Vec::new(),
    }
}

#[tokio::test]
async fn basic_lease_grants_pooled_port_and_routes() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir.path().join("state"));
    let service = build_service(&state);

    let lease = service
        .register_inner(register_request("/hello/"), "10.0.0.5".into(), true)
        .await
        .unwrap();

    assert!((2050..=4096).contains(&(lease.port as u16)));
    assert_eq!(lease.address, "10.0.0.5");
    assert!(lease.certificate.is_empty());

    // Roughly now + 24h.
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    assert!((lease.timeout - now - 86_400).abs() < 60);

    // The forwarder is live and routable.
    match state.router.select("portal", "/hello/world") {
        RouteOutcome::Forward(f) => {
            assert_eq!(f.authority(), format!("10.0.0.5:{}", lease.port));
            assert_eq!(f.scheme(), "http");
        }
        _ => panic!("expected a forwarder for /hello/world"),
    }

    // And the registration is persisted under its lease key.
    let key = format!("10.0.0.5:{}:/hello/", lease.port);
    assert!(state.state.registration(&key).is_some());
}

#[tokio::test]
async fn register_with_csr_returns_signed_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir.path().join("state"));
    let service = build_service(&state);

    let key = rcgen::KeyPair::generate().unwrap();
    let csr = rcgen::CertificateParams::new(vec!["10.0.0.5".to_string()])
        .unwrap()
        .serialize_request(&key)
        .unwrap()
        .der()
        .to_vec();

    let mut request = register_request("/secure/");
    request.certificate_request = csr;
    let lease = service
        .register_inner(request, "10.0.0.5".into(), true)
        .await
        .unwrap();

    assert!(!lease.certificate.is_empty());
    // Certificate outlives the lease.
    let (_, cert) = x509_parser::parse_x509_certificate(&lease.certificate).unwrap();
    assert!(cert.validity().not_after.timestamp() > lease.timeout);

    // A CSR implies an HTTPS backend.
    match state.router.select("portal", "/secure/x") {
        RouteOutcome::Forward(f) => assert_eq!(f.scheme(), "https"),
        _ => panic!("expected a forwarder for /secure/x"),
    }
}

#[tokio::test]
async fn renew_extends_and_unregister_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir.path().join("state"));
    let service = build_service(&state);

    let issued = service
        .register_inner(register_request("/app/"), "10.0.0.5".into(), true)
        .await
        .unwrap();
    let lease = lease_from_proto(&issued);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let renewed = service.renew_inner(&lease).unwrap();
    assert!(renewed.timeout >= issued.timeout);

    let removed = service.unregister_inner(&lease_from_proto(&renewed)).unwrap();
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    assert!((removed.timeout - now).abs() < 5);

    assert!(state.router.is_empty());
    assert!(state.leasor.all_leases().is_empty());
    assert_eq!(state.state.registration_count(), 0);

    // Renewing a dead lease is a clean NotFound-class error.
    assert!(service.renew_inner(&lease).is_err());
}

#[tokio::test]
async fn reregistering_pattern_replaces_forwarder() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir.path().join("state"));
    let service = build_service(&state);

    let first = service
        .register_inner(register_request("/a/"), "10.0.0.5".into(), true)
        .await
        .unwrap();
    let second = service
        .register_inner(register_request("/a/"), "10.0.0.5".into(), true)
        .await
        .unwrap();

    // Exactly one forwarder, bound to the later lease.
    assert_eq!(state.router.len(), 1);
    match state.router.select("portal", "/a/x") {
        RouteOutcome::Forward(f) => {
            assert_eq!(f.lease().port, second.port as u16);
        }
        _ => panic!("expected a forwarder for /a/x"),
    }
    // The older lease is gone.
    assert_ne!(first.port, second.port);
    assert_eq!(state.leasor.all_leases().len(), 1);
    assert_eq!(state.state.registration_count(), 1);
}

#[tokio::test]
async fn fixed_port_replacement_keeps_both_patterns() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir.path().join("state"));
    let service = build_service(&state);

    let mut req_a = register_request("/a/");
    req_a.fixed_port = 8080;
    service
        .register_inner(req_a, "10.0.0.5".into(), true)
        .await
        .unwrap();

    let mut req_b = register_request("/b/");
    req_b.fixed_port = 8080;
    service
        .register_inner(req_b, "10.0.0.5".into(), true)
        .await
        .unwrap();

    // Both patterns stay routable, both pointing at the shared port; only
    // the later lease survives.
    for path in ["/a/x", "/b/x"] {
        match state.router.select("portal", path) {
            RouteOutcome::Forward(f) => assert_eq!(f.authority(), "10.0.0.5:8080"),
            _ => panic!("expected a forwarder for {path}"),
        }
    }
    let leases = state.leasor.all_leases();
    assert_eq!(leases.len(), 1);
    assert_eq!(leases[0].pattern, "/b/");
}

#[tokio::test]
async fn empty_and_reserved_patterns_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(&dir.path().join("state"));
    let service = build_service(&state);

    assert!(service
        .register_inner(register_request(""), "10.0.0.5".into(), true)
        .await
        .is_err());
    assert!(service
        .register_inner(
            register_request("/.well-known/acme-challenge/"),
            "10.0.0.5".into(),
            true,
        )
        .await
        .is_err());
    assert!(state.router.is_empty());
    assert_eq!(state.state.registration_count(), 0);
}

#[tokio::test]
async fn crash_restore_replays_registrations_and_keeps_token() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state");

    let token_before;
    {
        let state = build_state(&state_path);
        let service = build_service(&state);
        token_before = state.state.token().to_string();

        for pattern in ["/one/", "/two/", "three.example.com/"] {
            service
                .register_inner(register_request(pattern), "10.0.0.5".into(), true)
                .await
                .unwrap();
        }
        assert_eq!(state.router.len(), 3);
    }

    // "Restart": rebuild everything from the state file.
    let state = build_state(&state_path);
    let service = build_service(&state);
    assert!(state.router.is_empty());

    service.restore().await;

    // All three forwarders are live before the RPC surface would accept
    // new calls, and the token survived the crash.
    assert_eq!(state.router.len(), 3);
    assert_eq!(state.state.token().to_string(), token_before);

    assert!(matches!(
        state.router.select("portal", "/one/x"),
        RouteOutcome::Forward(_)
    ));
    assert!(matches!(
        state.router.select("three.example.com", "/anything"),
        RouteOutcome::Forward(_)
    ));

    // Restored leases reuse their persisted ports.
    let leases = state.leasor.all_leases();
    assert_eq!(leases.len(), 3);
    for lease in leases {
        let key = lease.key();
        let stored = state.state.registration(&key).unwrap();
        assert_eq!(stored.lease.unwrap().port as u16, lease.port);
    }
}
