use super::types::*;

#[test]
fn test_defaults() {
    let cfg = PortalConfig::default();
    assert_eq!(cfg.server.http_port, 80);
    assert_eq!(cfg.server.https_port, 443);
    assert_eq!(cfg.server.rpc_port, 2048);
    assert_eq!(cfg.leases.port_range_start, 2050);
    assert_eq!(cfg.leases.port_range_end, 4096);
    assert_eq!(cfg.leases.ttl_secs, 86400);
    assert!(cfg.tls.self_signed_fallback);
    assert_eq!(cfg.tls.probe_timeout_secs, 6);
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
        [server]
        http_port = 8080
        https_port = 8443
        default_host = "example.com"

        [leases]
        port_range_start = 3000
        port_range_end = 3100
        reserved_ports = [3050]

        [tls]
        self_signed_fallback = false

        [[tls.certificates]]
        cert = "/etc/portal/cert.pem"
        key = "/etc/portal/key.pem"
    "#;
    let tmp = std::env::temp_dir().join("portal_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = PortalConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server.http_port, 8080);
    assert_eq!(cfg.server.https_port, 8443);
    assert_eq!(cfg.server.default_host.as_deref(), Some("example.com"));
    assert_eq!(cfg.leases.reserved_ports, vec![3050]);
    assert_eq!(cfg.tls.certificates.len(), 1);
    assert!(!cfg.tls.self_signed_fallback);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "server": { "rpc_port": 2049 },
        "leases": { "ttl_secs": 3600 },
        "state": { "path": "/var/lib/portal/state" }
    }"#;
    let tmp = std::env::temp_dir().join("portal_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = PortalConfig::load(&tmp).unwrap();
    assert_eq!(cfg.server.rpc_port, 2049);
    assert_eq!(cfg.leases.ttl_secs, 3600);
    assert_eq!(cfg.state.path.to_str(), Some("/var/lib/portal/state"));
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_inverted_port_range_fails() {
    let toml = r#"
        [leases]
        port_range_start = 5000
        port_range_end = 4000
    "#;
    let tmp = std::env::temp_dir().join("portal_inverted_range.toml");
    std::fs::write(&tmp, toml).unwrap();
    assert!(PortalConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_validate_acme_requires_contact() {
    let toml = r#"
        [tls.acme]
        domains = ["example.com"]
    "#;
    let tmp = std::env::temp_dir().join("portal_acme_no_contact.toml");
    std::fs::write(&tmp, toml).unwrap();
    assert!(PortalConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_ca_ttl_is_ten_lease_ttls() {
    let cfg = LeaseConfig {
        ttl_secs: 100,
        ..LeaseConfig::default()
    };
    assert_eq!(cfg.ca_ttl(), std::time::Duration::from_secs(1000));
}
