use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level portal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortalConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub leases: LeaseConfig,

    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub state: StateConfig,
}

/// Listener and routing settings for the data planes and the RPC surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default = "default_https_port")]
    pub https_port: u16,

    /// Port the authenticated registration RPC listens on.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Diagnostics port (health, readiness, Prometheus metrics).
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// When set, patterns without a host part only match this hostname.
    #[serde(default)]
    pub default_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            rpc_port: default_rpc_port(),
            admin_port: default_admin_port(),
            default_host: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_rpc_port() -> u16 {
    2048
}

fn default_admin_port() -> u16 {
    9091
}

/// Port-pool and lease-lifetime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,

    /// Lease lifetime in seconds; renewals extend by the same amount.
    #[serde(default = "default_lease_ttl")]
    pub ttl_secs: u64,

    /// How often the expiry sweep walks the lease maps (seconds).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Fixed-port registrations naming one of these ports are rejected
    /// instead of evicting whatever holds the port.
    #[serde(default)]
    pub reserved_ports: Vec<u16>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            ttl_secs: default_lease_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            reserved_ports: Vec::new(),
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// The internal CA outlives many lease cycles so backend certificates
    /// stay verifiable across renewals.
    pub fn ca_ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs * 10)
    }
}

fn default_port_range_start() -> u16 {
    2050
}

fn default_port_range_end() -> u16 {
    4096
}

fn default_lease_ttl() -> u64 {
    24 * 60 * 60
}

fn default_sweep_interval() -> u64 {
    60
}

/// Serving-certificate sources and backend TLS probing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Operator-supplied certificate/key file pairs, tried in order.
    #[serde(default)]
    pub certificates: Vec<CertFilePair>,

    #[serde(default)]
    pub acme: AcmeConfig,

    /// Serve a self-signed certificate when no other source is configured.
    #[serde(default = "default_true")]
    pub self_signed_fallback: bool,

    /// Deadline for the register-time TLS capability probe of a backend.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Optional webroot directory for certbot-style HTTP-01 renewals,
    /// served under the ACME challenge path.
    #[serde(default)]
    pub challenge_webroot: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            certificates: Vec::new(),
            acme: AcmeConfig::default(),
            self_signed_fallback: default_true(),
            probe_timeout_secs: default_probe_timeout(),
            challenge_webroot: None,
        }
    }
}

impl TlsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_probe_timeout() -> u64 {
    6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertFilePair {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Domains to order certificates for via HTTP-01.
    #[serde(default)]
    pub domains: Vec<String>,

    /// Account contact, e.g. "mailto:ops@example.com".
    #[serde(default)]
    pub contact: Option<String>,

    #[serde(default = "default_acme_directory")]
    pub directory: String,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            contact: None,
            directory: default_acme_directory(),
        }
    }
}

fn default_acme_directory() -> String {
    "https://acme-v02.api.letsencrypt.org/directory".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("portal.state")
}
