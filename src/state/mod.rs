use crate::error::{PortalError, Result};
use crate::proto;
use arc_swap::ArcSwap;
use base64::Engine;
use prost::Message;
use rand::Rng;
use rustls_pki_types::CertificateDer;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{info, warn};

/// Durable store of registrations, internal-CA roots, the API token, the
/// ACME account, and issued serving certificates.
///
/// One mutex guards the tables; the trust pool and token get lock-free read
/// caches behind atomic pointers because they sit on the request hot path.
/// Every mutation rewrites the state file through a tmp-file + atomic-rename
/// pair so a crash leaves either the old or the new file, never a torn one.
pub struct StateManager {
    path: PathBuf,
    inner: Mutex<StateInner>,
    trust_pool: ArcSwap<rustls::RootCertStore>,
    token: ArcSwap<String>,
    /// Wakes the deferred saver; used by paths that must not do file I/O
    /// inline (leasor cancellation callbacks).
    save_signal: Notify,
}

struct StateInner {
    registrations: HashMap<String, proto::Registration>,
    root_cas: Vec<Vec<u8>>,
    api_token: String,
    acme_account: Vec<u8>,
    certificates: HashMap<String, proto::Certificate>,
}

/// Stable lookup key for a persisted registration.
pub fn registration_key(registration: &proto::Registration) -> Option<String> {
    let lease = registration.lease.as_ref()?;
    Some(format!(
        "{}:{}:{}",
        lease.address, lease.port, lease.pattern
    ))
}

impl StateManager {
    /// Open (or initialize) the state file. A missing file starts empty; an
    /// unreadable one is a fatal configuration error. The API token is
    /// generated on first boot and persisted verbatim.
    pub fn open(path: &Path) -> Result<Self> {
        let mut inner = if path.exists() {
            let bytes = std::fs::read(path)
                .map_err(|e| PortalError::Config(format!("read {}: {e}", path.display())))?;
            let state = proto::State::decode_length_delimited(bytes.as_slice())
                .map_err(|e| PortalError::Config(format!("decode {}: {e}", path.display())))?;

            let mut registrations = HashMap::new();
            for registration in state.registrations {
                match registration_key(&registration) {
                    Some(key) => {
                        registrations.insert(key, registration);
                    }
                    None => warn!("state: dropping registration without a lease"),
                }
            }
            let mut certificates = HashMap::new();
            for cert in state.certificates {
                certificates.insert(cert.domain.clone(), cert);
            }
            StateInner {
                registrations,
                root_cas: state.root_cas,
                api_token: state.api_token,
                acme_account: state.acme_account,
                certificates,
            }
        } else {
            info!("state: no state file at {}, starting fresh", path.display());
            StateInner {
                registrations: HashMap::new(),
                root_cas: Vec::new(),
                api_token: String::new(),
                acme_account: Vec::new(),
                certificates: HashMap::new(),
            }
        };

        let mut newly_initialized = false;
        if inner.api_token.is_empty() {
            inner.api_token = generate_token();
            newly_initialized = true;
        }

        let manager = Self {
            path: path.to_path_buf(),
            trust_pool: ArcSwap::new(Arc::new(build_trust_pool(&inner.root_cas))),
            token: ArcSwap::new(Arc::new(inner.api_token.clone())),
            inner: Mutex::new(inner),
            save_signal: Notify::new(),
        };

        if newly_initialized {
            manager.save()?;
        }
        Ok(manager)
    }

    // ---- Lock-free read caches ----

    pub fn token(&self) -> Arc<String> {
        self.token.load_full()
    }

    /// Constant-time comparison of a presented bearer token.
    pub fn token_matches(&self, presented: &str) -> bool {
        let token = self.token.load();
        let a = token.as_bytes();
        let b = presented.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        let mut diff = 0u8;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
        }
        diff == 0
    }

    /// Snapshot of the internal-CA trust pool.
    pub fn trust_pool(&self) -> Arc<rustls::RootCertStore> {
        self.trust_pool.load_full()
    }

    // ---- Mutations (each persists before returning) ----

    /// Append a freshly rotated internal-CA root. Old roots stay trusted
    /// until their own expiry; pruning happens at save time.
    pub fn add_root_ca(&self, der: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        inner.root_cas.push(der);
        self.trust_pool
            .store(Arc::new(build_trust_pool(&inner.root_cas)));
        self.save_locked(&mut inner)
    }

    pub fn set_acme_account(&self, bytes: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        inner.acme_account = bytes;
        self.save_locked(&mut inner)
    }

    pub fn acme_account(&self) -> Option<Vec<u8>> {
        let inner = self.lock();
        if inner.acme_account.is_empty() {
            None
        } else {
            Some(inner.acme_account.clone())
        }
    }

    pub fn put_certificate(&self, domain: &str, cert_chain: Vec<Vec<u8>>, key: Vec<u8>) -> Result<()> {
        let mut inner = self.lock();
        inner.certificates.insert(
            domain.to_string(),
            proto::Certificate {
                domain: domain.to_string(),
                cert_chain,
                private_key: key,
            },
        );
        self.save_locked(&mut inner)
    }

    pub fn certificate(&self, domain: &str) -> Option<proto::Certificate> {
        self.lock().certificates.get(domain).cloned()
    }

    /// Store a registration under its lease key. The certificate field of
    /// the stored lease is dropped; it is regenerated on renew.
    pub fn upsert_registration(&self, mut registration: proto::Registration) -> Result<()> {
        if let Some(lease) = registration.lease.as_mut() {
            lease.certificate.clear();
        }
        let Some(key) = registration_key(&registration) else {
            return Err(PortalError::Internal("registration without lease".into()));
        };
        let mut inner = self.lock();
        inner.registrations.insert(key, registration);
        self.save_locked(&mut inner)
    }

    /// Extend the stored lease's timeout in place.
    pub fn renew_registration(&self, key: &str, timeout_unix: i64) -> Result<()> {
        let mut inner = self.lock();
        match inner.registrations.get_mut(key) {
            Some(registration) => {
                if let Some(lease) = registration.lease.as_mut() {
                    lease.timeout = timeout_unix;
                }
            }
            None => return Err(PortalError::Unregistered),
        }
        self.save_locked(&mut inner)
    }

    pub fn remove_registration(&self, key: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.registrations.remove(key);
        self.save_locked(&mut inner)
    }

    /// In-memory removal plus a deferred save. Safe to call from leasor
    /// cancellation callbacks, which must not touch the filesystem.
    pub fn remove_registration_deferred(&self, key: &str) {
        let mut inner = self.lock();
        inner.registrations.remove(key);
        drop(inner);
        self.save_signal.notify_one();
    }

    pub fn registration(&self, key: &str) -> Option<proto::Registration> {
        self.lock().registrations.get(key).cloned()
    }

    pub fn registrations(&self) -> Vec<proto::Registration> {
        self.lock().registrations.values().cloned().collect()
    }

    pub fn registration_count(&self) -> usize {
        self.lock().registrations.len()
    }

    // ---- Persistence ----

    /// Block until a deferred save is requested.
    pub async fn save_requested(&self) {
        self.save_signal.notified().await;
    }

    pub fn save(&self) -> Result<()> {
        let mut inner = self.lock();
        self.save_locked(&mut inner)
    }

    /// Snapshot, prune expired roots, serialize, then write through
    /// `<path>.tmp` and an atomic rename.
    fn save_locked(&self, inner: &mut StateInner) -> Result<()> {
        let now = unix_now();
        let before = inner.root_cas.len();
        inner.root_cas.retain(|der| !root_expired(der, now));
        if inner.root_cas.len() != before {
            info!(
                "state: pruned {} expired root certificate(s)",
                before - inner.root_cas.len()
            );
            self.trust_pool
                .store(Arc::new(build_trust_pool(&inner.root_cas)));
        }

        let state = proto::State {
            registrations: inner.registrations.values().cloned().collect(),
            root_cas: inner.root_cas.clone(),
            api_token: inner.api_token.clone(),
            acme_account: inner.acme_account.clone(),
            certificates: inner.certificates.values().cloned().collect(),
        };
        let encoded = state.encode_length_delimited_to_vec();

        match write_atomically(&self.path, &encoded) {
            Ok(()) => {
                metrics::counter!("portal_state_saves_total", "result" => "success").increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!("portal_state_saves_total", "result" => "error").increment(1);
                warn!("state: save failed, path={}, error={}", self.path.display(), e);
                Err(PortalError::Persistence(e.to_string()))
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().expect("state lock poisoned")
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
}

fn build_trust_pool(root_cas: &[Vec<u8>]) -> rustls::RootCertStore {
    let mut store = rustls::RootCertStore::empty();
    for der in root_cas {
        if let Err(e) = store.add(CertificateDer::from(der.clone())) {
            warn!("state: skipping unparseable root certificate: {}", e);
        }
    }
    store
}

fn root_expired(der: &[u8], now_unix: i64) -> bool {
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => cert.validity().not_after.timestamp() <= now_unix,
        Err(_) => true,
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(address: &str, port: u32, pattern: &str) -> proto::Registration {
        proto::Registration {
            request: Some(proto::RegisterRequest {
                pattern: pattern.to_string(),
                fixed_port: 0,
                hostname: String::new(),
                strip_pattern: false,
                allow_http: false,
                certificate_request: Vec::new(),
            }),
            lease: Some(proto::Lease {
                pattern: pattern.to_string(),
                address: address.to_string(),
                port,
                timeout: unix_now() + 3600,
                certificate: vec![1, 2, 3],
            }),
        }
    }

    #[test]
    fn test_fresh_state_generates_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let state = StateManager::open(&path).unwrap();
        let token = state.token();
        assert!(!token.is_empty());
        // Token is persisted immediately.
        assert!(path.exists());

        let reopened = StateManager::open(&path).unwrap();
        assert_eq!(*reopened.token(), *token);
    }

    #[test]
    fn test_token_matches_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::open(&dir.path().join("state")).unwrap();
        let token = state.token();
        assert!(state.token_matches(&token));
        assert!(!state.token_matches("wrong"));
        assert!(!state.token_matches(&format!("{}x", token)));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");

        let state = StateManager::open(&path).unwrap();
        state
            .upsert_registration(registration("10.0.0.5", 2051, "/hello/"))
            .unwrap();
        state
            .upsert_registration(registration("10.0.0.6", 2051, "/other/"))
            .unwrap();
        state.set_acme_account(b"account-blob".to_vec()).unwrap();
        state
            .put_certificate("example.com", vec![vec![1, 2]], vec![3, 4])
            .unwrap();
        let token = state.token();

        let reopened = StateManager::open(&path).unwrap();
        assert_eq!(reopened.registration_count(), 2);
        assert_eq!(*reopened.token(), *token);
        assert_eq!(reopened.acme_account(), Some(b"account-blob".to_vec()));
        let cert = reopened.certificate("example.com").unwrap();
        assert_eq!(cert.cert_chain, vec![vec![1, 2]]);
        assert_eq!(cert.private_key, vec![3, 4]);

        // Stored leases never carry certificates.
        let reg = reopened.registration("10.0.0.5:2051:/hello/").unwrap();
        assert!(reg.lease.unwrap().certificate.is_empty());
    }

    #[test]
    fn test_registering_same_key_twice_keeps_one() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::open(&dir.path().join("state")).unwrap();
        state
            .upsert_registration(registration("10.0.0.5", 2051, "/a/"))
            .unwrap();
        state
            .upsert_registration(registration("10.0.0.5", 2051, "/a/"))
            .unwrap();
        assert_eq!(state.registration_count(), 1);
    }

    #[test]
    fn test_renew_updates_timeout_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::open(&dir.path().join("state")).unwrap();
        state
            .upsert_registration(registration("10.0.0.5", 2051, "/a/"))
            .unwrap();
        let later = unix_now() + 7200;
        state
            .renew_registration("10.0.0.5:2051:/a/", later)
            .unwrap();
        let reg = state.registration("10.0.0.5:2051:/a/").unwrap();
        assert_eq!(reg.lease.unwrap().timeout, later);

        assert!(matches!(
            state.renew_registration("10.0.0.9:1:/missing/", later),
            Err(PortalError::Unregistered)
        ));
    }

    #[test]
    fn test_remove_registration() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateManager::open(&dir.path().join("state")).unwrap();
        state
            .upsert_registration(registration("10.0.0.5", 2051, "/a/"))
            .unwrap();
        state.remove_registration("10.0.0.5:2051:/a/").unwrap();
        assert_eq!(state.registration_count(), 0);

        let reopened = StateManager::open(&dir.path().join("state")).unwrap();
        assert_eq!(reopened.registration_count(), 0);
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let state = StateManager::open(&path).unwrap();
        state
            .upsert_registration(registration("10.0.0.5", 2051, "/a/"))
            .unwrap();
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_garbage_state_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, b"\xff\xff\xff\xff\xff\xff\xff").unwrap();
        assert!(matches!(
            StateManager::open(&path),
            Err(PortalError::Config(_))
        ));
    }

    #[test]
    fn test_unparseable_roots_are_dropped_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let state = StateManager::open(&path).unwrap();
        // Not a real certificate; pruned at the next save.
        state.add_root_ca(vec![0xde, 0xad, 0xbe, 0xef]).unwrap();
        state.save().unwrap();

        let reopened = StateManager::open(&path).unwrap();
        assert!(reopened.trust_pool().is_empty());
    }
}
