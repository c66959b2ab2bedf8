use crate::cert::ca::certified_key_from;
use crate::error::{PortalError, Result};
use arc_swap::ArcSwapOption;
use rcgen::{CertificateParams, KeyPair};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Where one serving certificate comes from.
pub enum CertSource {
    /// Operator-supplied PEM files re-read on refresh.
    FilePair { cert: PathBuf, key: PathBuf },
    /// Inherited pipe file descriptors; each refresh reads one PEM blob
    /// terminated by an EOT byte, pushed by the supervisor on renewal.
    PipePair {
        cert: Mutex<std::fs::File>,
        key: Mutex<std::fs::File>,
    },
    /// ACME-ordered certificate for one domain.
    AcmeDomain(String),
    /// Self-signed wildcard fallback, regenerated daily.
    SelfSigned,
}

impl fmt::Debug for CertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertSource::FilePair { cert, .. } => write!(f, "file:{}", cert.display()),
            CertSource::PipePair { .. } => write!(f, "pipe"),
            CertSource::AcmeDomain(domain) => write!(f, "acme:{domain}"),
            CertSource::SelfSigned => write!(f, "self-signed"),
        }
    }
}

impl CertSource {
    pub fn label(&self) -> &'static str {
        match self {
            CertSource::FilePair { .. } => "file",
            CertSource::PipePair { .. } => "pipe",
            CertSource::AcmeDomain(_) => "acme",
            CertSource::SelfSigned => "self_signed",
        }
    }
}

/// A parsed, ready-to-serve certificate with the metadata needed for SNI
/// selection and refresh scheduling.
pub struct CachedCert {
    pub certified: Arc<CertifiedKey>,
    pub sans: Vec<String>,
    pub not_after: SystemTime,
}

/// One slot in the serving chain: a source plus its atomically swapped
/// current certificate.
pub struct ServingEntry {
    source: CertSource,
    cached: ArcSwapOption<CachedCert>,
}

impl ServingEntry {
    pub fn new(source: CertSource) -> Arc<Self> {
        Arc::new(Self {
            source,
            cached: ArcSwapOption::const_empty(),
        })
    }

    pub fn source(&self) -> &CertSource {
        &self.source
    }

    pub fn cached(&self) -> Option<Arc<CachedCert>> {
        self.cached.load_full()
    }

    pub fn install(&self, cert: CachedCert) {
        info!(
            "cert: serving certificate installed, source={:?}, sans={:?}",
            self.source, cert.sans
        );
        self.cached.store(Some(Arc::new(cert)));
    }

    /// Re-read a file-pair source. PEM roles are tried swapped when the
    /// straightforward order fails to parse.
    pub fn refresh_from_files(&self) -> Result<()> {
        let CertSource::FilePair { cert, key } = &self.source else {
            return Ok(());
        };
        let cert_bytes = std::fs::read(cert)
            .map_err(|e| PortalError::CertificateIssuance(format!("read {}: {e}", cert.display())))?;
        let key_bytes = std::fs::read(key)
            .map_err(|e| PortalError::CertificateIssuance(format!("read {}: {e}", key.display())))?;
        self.install(cached_from_pem(&cert_bytes, &key_bytes)?);
        Ok(())
    }

    /// Read the next PEM blob pair from inherited pipes. Blocks until the
    /// supervisor pushes bytes; callers run this on the blocking pool.
    pub fn refresh_from_pipes_blocking(&self) -> Result<()> {
        let CertSource::PipePair { cert, key } = &self.source else {
            return Ok(());
        };
        let cert_bytes = {
            let mut file = cert.lock().expect("pipe lock poisoned");
            read_until_eot(&mut file)
                .map_err(|e| PortalError::CertificateIssuance(format!("read cert pipe: {e}")))?
        };
        let key_bytes = {
            let mut file = key.lock().expect("pipe lock poisoned");
            read_until_eot(&mut file)
                .map_err(|e| PortalError::CertificateIssuance(format!("read key pipe: {e}")))?
        };
        if cert_bytes.is_empty() || key_bytes.is_empty() {
            return Err(PortalError::CertificateIssuance("empty pipe payload".into()));
        }
        self.install(cached_from_pem(&cert_bytes, &key_bytes)?);
        Ok(())
    }

    /// Regenerate the self-signed fallback.
    pub fn refresh_self_signed(&self) -> Result<()> {
        if !matches!(self.source, CertSource::SelfSigned) {
            return Ok(());
        }
        self.install(self_signed_fallback()?);
        Ok(())
    }
}

/// The ordered serving-certificate chain consulted at every TLS handshake.
/// The first entry whose SANs satisfy the client hello wins.
pub struct ServingContext {
    entries: Vec<Arc<ServingEntry>>,
}

// rustls requires `ResolvesServerCert: Debug`; the cached material has no
// useful Debug of its own.
impl fmt::Debug for ServingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServingContext({} entries)", self.entries.len())
    }
}

impl ServingContext {
    pub fn new(entries: Vec<Arc<ServingEntry>>) -> Arc<Self> {
        Arc::new(Self { entries })
    }

    pub fn entries(&self) -> &[Arc<ServingEntry>] {
        &self.entries
    }

    /// rustls server config for the HTTPS data plane and TCP listeners,
    /// with HTTP/2 enabled via ALPN.
    pub fn server_config(self: &Arc<Self>) -> Arc<rustls::ServerConfig> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Immediate re-read of every file-backed source; wired to the
    /// operator's reload signal.
    pub fn refresh_file_backed(&self) {
        for entry in &self.entries {
            if matches!(entry.source(), CertSource::FilePair { .. }) {
                if let Err(e) = entry.refresh_from_files() {
                    warn!("cert: reload failed, source={:?}, error={}", entry.source(), e);
                    metrics::counter!("portal_cert_renewals_total", "source" => "file", "result" => "error")
                        .increment(1);
                } else {
                    metrics::counter!("portal_cert_renewals_total", "source" => "file", "result" => "success")
                        .increment(1);
                }
            }
        }
    }

    /// First cached certificate whose SANs satisfy `server_name`; a hello
    /// without SNI gets the first available certificate.
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CachedCert>> {
        for entry in &self.entries {
            let Some(cached) = entry.cached() else {
                continue;
            };
            match server_name {
                None => return Some(cached),
                Some(name) if sans_match(&cached.sans, name) => return Some(cached),
                Some(_) => {}
            }
        }
        None
    }
}

impl ResolvesServerCert for ServingContext {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
            .map(|cached| cached.certified.clone())
    }
}

/// Wildcard-aware SAN match. A literal `*` SAN (the self-signed fallback)
/// satisfies every name.
fn sans_match(sans: &[String], name: &str) -> bool {
    sans.iter().any(|san| {
        if san == "*" {
            return true;
        }
        if let Some(suffix) = san.strip_prefix("*.") {
            return name
                .strip_suffix(suffix)
                .and_then(|head| head.strip_suffix('.'))
                .map(|label| !label.is_empty() && !label.contains('.'))
                .unwrap_or(false);
        }
        san.eq_ignore_ascii_case(name)
    })
}

/// Parse a PEM certificate/key pair, retrying with the roles swapped when
/// the supervisor crossed the files.
pub fn cached_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CachedCert> {
    match try_parse_pem(cert_pem, key_pem) {
        Ok(cached) => Ok(cached),
        Err(first_err) => try_parse_pem(key_pem, cert_pem).map_err(|_| first_err),
    }
}

fn try_parse_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CachedCert> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| PortalError::CertificateIssuance(format!("parse cert pem: {e}")))?;
    if chain.is_empty() {
        return Err(PortalError::CertificateIssuance("no certificates in pem".into()));
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| PortalError::CertificateIssuance(format!("parse key pem: {e}")))?
        .ok_or_else(|| PortalError::CertificateIssuance("no private key in pem".into()))?;
    cached_from_der(chain, key)
}

/// Build a cached serving certificate from a DER chain and key.
pub fn cached_from_der(
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<CachedCert> {
    let (sans, not_after) = leaf_metadata(chain[0].as_ref())?;
    let signing_key = rustls::crypto::ring::default_provider()
        .key_provider
        .load_private_key(key)
        .map_err(|e| PortalError::CertificateIssuance(format!("load key: {e}")))?;
    Ok(CachedCert {
        certified: Arc::new(CertifiedKey::new(chain, signing_key)),
        sans,
        not_after,
    })
}

/// SANs and expiry of the leaf certificate.
fn leaf_metadata(leaf_der: &[u8]) -> Result<(Vec<String>, SystemTime)> {
    use x509_parser::prelude::GeneralName;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf_der)
        .map_err(|e| PortalError::CertificateIssuance(format!("parse leaf: {e}")))?;

    let mut sans = Vec::new();
    if let Ok(Some(extension)) = cert.subject_alternative_name() {
        for name in &extension.value.general_names {
            match name {
                GeneralName::DNSName(dns) => sans.push(dns.to_string()),
                GeneralName::IPAddress(ip) => match ip.len() {
                    4 => {
                        let octets: [u8; 4] = (*ip).try_into().expect("checked length");
                        sans.push(std::net::Ipv4Addr::from(octets).to_string());
                    }
                    16 => {
                        let octets: [u8; 16] = (*ip).try_into().expect("checked length");
                        sans.push(std::net::Ipv6Addr::from(octets).to_string());
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }

    let not_after = UNIX_EPOCH
        + Duration::from_secs(cert.validity().not_after.timestamp().max(0) as u64);
    Ok((sans, not_after))
}

/// Generate the wildcard self-signed fallback, valid for 24 hours.
pub fn self_signed_fallback() -> Result<CachedCert> {
    let key = KeyPair::generate()
        .map_err(|e| PortalError::CertificateIssuance(format!("fallback keygen: {e}")))?;
    let mut params = CertificateParams::new(vec!["*".to_string()])
        .map_err(|e| PortalError::CertificateIssuance(format!("fallback params: {e}")))?;
    let now = SystemTime::now();
    let not_after = now + Duration::from_secs(24 * 60 * 60);
    params.not_before = now.into();
    params.not_after = not_after.into();
    let cert = params
        .self_signed(&key)
        .map_err(|e| PortalError::CertificateIssuance(format!("fallback sign: {e}")))?;

    Ok(CachedCert {
        certified: Arc::new(certified_key_from(cert.der().to_vec(), &key)?),
        sans: vec!["*".to_string()],
        not_after,
    })
}

/// Read one payload from a pipe, stopping at the EOT delimiter (0x04) or
/// EOF. Reads byte-at-a-time so nothing belonging to the next payload is
/// consumed early.
fn read_until_eot(file: &mut std::fs::File) -> std::io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = file.read(&mut byte)?;
        if n == 0 || byte[0] == 0x04 {
            break;
        }
        payload.push(byte[0]);
    }
    Ok(payload)
}
