pub mod pattern;

pub use pattern::{HttpPattern, Pattern, ACME_CHALLENGE_PATH, ACME_CHALLENGE_PATTERN};

use crate::error::{PortalError, Result};
use crate::leasor::Lease;
use crate::proxy::forwarder::Forwarder;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Routing decision for one incoming `(host, path)`.
pub enum RouteOutcome {
    Forward(Arc<Forwarder>),
    /// The path matches a directory pattern minus its trailing slash;
    /// answer 303 so relative links resolve under the directory.
    RedirectAppendSlash,
    NotFound,
}

/// The pattern registry: a concurrent map from raw pattern to its live
/// forwarder, consulted lock-free on every request.
///
/// Selection picks the forwarder with the longest matching pattern. An
/// exact pattern (`/foo`) naturally beats its directory form (`/foo/`) for
/// the path `/foo` because the directory form only prefix-matches paths
/// under it; the bare path instead triggers the append-slash redirect when
/// no exact registration exists.
pub struct HttpRouter {
    forwarders: DashMap<String, Arc<Forwarder>>,
    default_host: Option<String>,
    /// ACME HTTP-01 token → key-authorization, filled transiently while an
    /// order is in flight.
    challenges: Arc<DashMap<String, String>>,
    /// Static directory for certbot-webroot style renewals.
    challenge_webroot: Option<PathBuf>,
    /// True when any registered forwarder allows plaintext HTTP; gates the
    /// HSTS header on HTTPS responses.
    allow_http_any: AtomicBool,
}

impl HttpRouter {
    pub fn new(default_host: Option<String>, challenge_webroot: Option<PathBuf>) -> Self {
        Self {
            forwarders: DashMap::new(),
            default_host,
            challenges: Arc::new(DashMap::new()),
            challenge_webroot,
            allow_http_any: AtomicBool::new(false),
        }
    }

    pub fn challenges(&self) -> Arc<DashMap<String, String>> {
        self.challenges.clone()
    }

    pub fn challenge_webroot(&self) -> Option<&PathBuf> {
        self.challenge_webroot.as_ref()
    }

    /// Parse and vet a pattern for client registration. The ACME challenge
    /// carve-out can never be overridden.
    pub fn validate_pattern(&self, raw: &str) -> Result<HttpPattern> {
        match Pattern::parse(raw)? {
            Pattern::Http(p) => {
                if p.shadows_acme_challenge() {
                    return Err(PortalError::ReservedPattern(raw.to_string()));
                }
                Ok(p)
            }
            Pattern::Tcp(_) => Err(PortalError::InvalidPattern(format!(
                "{raw:?} is a tcp pattern"
            ))),
        }
    }

    /// Current forwarder registered under exactly `raw`, if any.
    pub fn get(&self, raw: &str) -> Option<Arc<Forwarder>> {
        self.forwarders.get(raw).map(|e| e.value().clone())
    }

    /// Install (or replace) the forwarder for its pattern.
    pub fn insert(&self, forwarder: Arc<Forwarder>) {
        let raw = forwarder.pattern().raw().to_string();
        info!(
            "routing: forwarder installed, pattern={}, upstream={}://{}",
            raw,
            forwarder.scheme(),
            forwarder.authority()
        );
        self.forwarders.insert(raw, forwarder);
        self.recompute_allow_http();
        metrics::gauge!("portal_forwarders_active").set(self.forwarders.len() as f64);
    }

    /// Tear down the forwarder owned by `lease`, if it is still the one
    /// registered for the pattern. Invoked from leasor cancellation
    /// callbacks, so it must stay cheap.
    pub fn remove_for_lease(&self, lease: &Lease) {
        let key = lease.key();
        let removed = self
            .forwarders
            .remove_if(&lease.pattern, |_, f| f.lease_key() == key);
        if removed.is_some() {
            info!("routing: forwarder removed, pattern={}", lease.pattern);
            self.recompute_allow_http();
            metrics::gauge!("portal_forwarders_active").set(self.forwarders.len() as f64);
        }
    }

    /// Longest-match selection over the registry.
    pub fn select(&self, host: &str, path: &str) -> RouteOutcome {
        let mut best: Option<Arc<Forwarder>> = None;
        let mut best_len = 0usize;

        for entry in self.forwarders.iter() {
            let forwarder = entry.value();
            let pattern = forwarder.pattern();
            if !pattern.matches_host(host, self.default_host.as_deref()) {
                continue;
            }
            if !pattern.matches_path(path) {
                continue;
            }
            let len = pattern.raw().len();
            if len > best_len {
                best_len = len;
                best = Some(forwarder.clone());
            }
        }

        if let Some(forwarder) = best {
            return RouteOutcome::Forward(forwarder);
        }

        // No direct match: a directory registration for `path + "/"` answers
        // with a redirect instead of a 404.
        for entry in self.forwarders.iter() {
            let pattern = entry.value().pattern();
            if pattern.matches_host(host, self.default_host.as_deref())
                && pattern.wants_trailing_slash(path)
            {
                return RouteOutcome::RedirectAppendSlash;
            }
        }

        RouteOutcome::NotFound
    }

    pub fn any_allow_http(&self) -> bool {
        self.allow_http_any.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.forwarders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }

    /// Snapshot of registered patterns and their upstreams, for diagnostics.
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.forwarders
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    format!("{}://{}", e.value().scheme(), e.value().authority()),
                )
            })
            .collect()
    }

    fn recompute_allow_http(&self) {
        let any = self.forwarders.iter().any(|e| e.value().allow_http());
        self.allow_http_any.store(any, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::forwarder::{backend_tls_config, build_backend_client};

    fn make_forwarder(raw: &str, allow_http: bool) -> Arc<Forwarder> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let pattern = match Pattern::parse(raw).unwrap() {
            Pattern::Http(p) => p,
            Pattern::Tcp(_) => panic!("http pattern expected"),
        };
        let tls = backend_tls_config(Arc::new(rustls::RootCertStore::empty()), None).unwrap();
        let lease = Lease {
            pattern: raw.to_string(),
            address: "10.0.0.5".to_string(),
            port: 3000,
            timeout: std::time::SystemTime::now() + std::time::Duration::from_secs(60),
        };
        Arc::new(Forwarder::new(
            pattern,
            lease,
            false,
            false,
            allow_http,
            build_backend_client(tls),
        ))
    }

    fn router_with(patterns: &[&str]) -> HttpRouter {
        let router = HttpRouter::new(None, None);
        for p in patterns {
            router.insert(make_forwarder(p, false));
        }
        router
    }

    fn selected(router: &HttpRouter, host: &str, path: &str) -> String {
        match router.select(host, path) {
            RouteOutcome::Forward(f) => f.pattern().raw().to_string(),
            RouteOutcome::RedirectAppendSlash => "<redirect>".to_string(),
            RouteOutcome::NotFound => "<none>".to_string(),
        }
    }

    #[test]
    fn test_longest_pattern_wins() {
        let router = router_with(&["/", "/foo/", "/foo/bar/"]);
        assert_eq!(selected(&router, "portal", "/foo/bar/baz"), "/foo/bar/");
        assert_eq!(selected(&router, "portal", "/foo/x"), "/foo/");
        assert_eq!(selected(&router, "portal", "/other"), "/");
    }

    #[test]
    fn test_exact_beats_directory() {
        let router = router_with(&["/foo", "/foo/"]);
        assert_eq!(selected(&router, "portal", "/foo"), "/foo");
        assert_eq!(selected(&router, "portal", "/foo/x"), "/foo/");
    }

    #[test]
    fn test_directory_redirects_bare_path() {
        let router = router_with(&["/foo/"]);
        assert_eq!(selected(&router, "portal", "/foo"), "<redirect>");
    }

    #[test]
    fn test_host_specific_routing() {
        let router = router_with(&["example.com/", "/"]);
        assert_eq!(selected(&router, "example.com", "/x"), "example.com/");
        assert_eq!(selected(&router, "other.com", "/x"), "/");
    }

    #[test]
    fn test_default_host_pins_bare_patterns() {
        let router = HttpRouter::new(Some("portal.example.com".into()), None);
        router.insert(make_forwarder("/app/", false));
        router.insert(make_forwarder("*/any/", false));

        assert_eq!(
            selected(&router, "portal.example.com", "/app/x"),
            "/app/"
        );
        // Bare pattern does not match other hosts when a default is set.
        assert_eq!(selected(&router, "elsewhere.com", "/app/x"), "<none>");
        // Explicit-any still matches every host.
        assert_eq!(selected(&router, "elsewhere.com", "/any/x"), "*/any/");
    }

    #[test]
    fn test_no_match() {
        let router = router_with(&["/app/"]);
        assert_eq!(selected(&router, "portal", "/missing"), "<none>");
    }

    #[test]
    fn test_replacement_leaves_single_forwarder() {
        let router = router_with(&[]);
        router.insert(make_forwarder("/app/", false));
        router.insert(make_forwarder("/app/", true));
        assert_eq!(router.len(), 1);
        assert!(router.any_allow_http());
    }

    #[test]
    fn test_remove_for_lease_checks_ownership() {
        let router = router_with(&[]);
        router.insert(make_forwarder("/app/", false));

        // A stale lease for a different port must not tear down the
        // replacement forwarder.
        let stale = Lease {
            pattern: "/app/".into(),
            address: "10.0.0.5".into(),
            port: 9999,
            timeout: std::time::SystemTime::now(),
        };
        router.remove_for_lease(&stale);
        assert_eq!(router.len(), 1);

        let owning = Lease {
            pattern: "/app/".into(),
            address: "10.0.0.5".into(),
            port: 3000,
            timeout: std::time::SystemTime::now(),
        };
        router.remove_for_lease(&owning);
        assert!(router.is_empty());
    }

    #[test]
    fn test_validate_pattern_rejects_acme_shadowing() {
        let router = router_with(&[]);
        assert!(router.validate_pattern("/app/").is_ok());
        assert!(matches!(
            router.validate_pattern("/.well-known/acme-challenge/"),
            Err(PortalError::ReservedPattern(_))
        ));
        assert!(matches!(
            router.validate_pattern(""),
            Err(PortalError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_hsts_flag_tracks_registrations() {
        let router = router_with(&[]);
        assert!(!router.any_allow_http());
        router.insert(make_forwarder("/plain/", true));
        assert!(router.any_allow_http());

        let lease = Lease {
            pattern: "/plain/".into(),
            address: "10.0.0.5".into(),
            port: 3000,
            timeout: std::time::SystemTime::now(),
        };
        router.remove_for_lease(&lease);
        assert!(!router.any_allow_http());
    }
}
