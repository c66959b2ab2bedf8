use crate::error::{PortalError, Result};

/// The reserved registration pattern answering ACME HTTP-01 challenges.
/// Client registrations may never shadow it.
pub const ACME_CHALLENGE_PATTERN: &str = "*/.well-known/acme-challenge/";

/// Path prefix of the carve-out, checked on every request before routing.
pub const ACME_CHALLENGE_PATH: &str = "/.well-known/acme-challenge/";

/// How a pattern constrains the request host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRule {
    /// No host part. Matches when no default host is configured, or when
    /// the request host equals the configured default host.
    Unspecified,
    /// Explicit `*` host. Matches any request host.
    Any,
    Exact(String),
}

/// A parsed HTTP registration pattern: `[host][/path]`.
///
/// A path ending in `/` is a prefix match; otherwise the path must match
/// exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPattern {
    raw: String,
    host: HostRule,
    path: String,
}

/// A parsed registration pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Http(HttpPattern),
    /// `:tcp:<port>`: raw TLS-unwrapping forward on a public port.
    Tcp(u16),
}

impl Pattern {
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(PortalError::InvalidPattern("empty pattern".into()));
        }

        if let Some(port_str) = raw.strip_prefix(":tcp:") {
            let port: u32 = port_str
                .parse()
                .map_err(|_| PortalError::InvalidPattern(format!("bad tcp port in {raw:?}")))?;
            if port == 0 || port >= 65536 {
                return Err(PortalError::InvalidPort(port));
            }
            return Ok(Pattern::Tcp(port as u16));
        }

        let slash = raw
            .find('/')
            .ok_or_else(|| PortalError::InvalidPattern(format!("{raw:?} has no path")))?;
        let (host_part, path) = raw.split_at(slash);

        let host = match host_part {
            "" => HostRule::Unspecified,
            "*" => HostRule::Any,
            h => HostRule::Exact(h.to_ascii_lowercase()),
        };

        Ok(Pattern::Http(HttpPattern {
            raw: raw.to_string(),
            host,
            path: path.to_string(),
        }))
    }
}

impl HttpPattern {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The pattern path with any trailing slash removed; sent upstream as
    /// `X-Forwarded-Prefix` and used for path stripping.
    pub fn prefix(&self) -> &str {
        self.path.strip_suffix('/').unwrap_or(&self.path)
    }

    pub fn is_prefix_match(&self) -> bool {
        self.path.ends_with('/')
    }

    /// True when registering this pattern would shadow (or be hidden under)
    /// the ACME challenge carve-out.
    pub fn shadows_acme_challenge(&self) -> bool {
        self.path.starts_with(ACME_CHALLENGE_PATH)
            || (ACME_CHALLENGE_PATH.starts_with(&self.path)
                && self.is_prefix_match()
                && self.path.len() > 1)
    }

    pub fn matches_host(&self, request_host: &str, default_host: Option<&str>) -> bool {
        match &self.host {
            HostRule::Unspecified => match default_host {
                None => true,
                Some(default) => default.eq_ignore_ascii_case(request_host),
            },
            HostRule::Any => true,
            HostRule::Exact(host) => host.eq_ignore_ascii_case(request_host),
        }
    }

    pub fn matches_path(&self, request_path: &str) -> bool {
        if self.is_prefix_match() {
            request_path.starts_with(&self.path)
        } else {
            request_path == self.path
        }
    }

    /// True when `request_path` is the directory pattern minus its trailing
    /// slash, which the dispatcher answers with a 303 appending `/`.
    pub fn wants_trailing_slash(&self, request_path: &str) -> bool {
        self.is_prefix_match()
            && self.path.len() > 1
            && request_path == &self.path[..self.path.len() - 1]
    }

    /// Rewrite a request path for a forwarder that strips its pattern.
    /// Exact-match patterns map their single path to `/`.
    pub fn strip(&self, request_path: &str) -> String {
        if !self.is_prefix_match() {
            return "/".to_string();
        }
        let stripped = request_path
            .strip_prefix(self.prefix())
            .unwrap_or(request_path);
        if stripped.is_empty() {
            "/".to_string()
        } else {
            stripped.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(raw: &str) -> HttpPattern {
        match Pattern::parse(raw).unwrap() {
            Pattern::Http(p) => p,
            Pattern::Tcp(_) => panic!("expected http pattern"),
        }
    }

    #[test]
    fn test_parse_shapes() {
        assert!(matches!(Pattern::parse("/foo/"), Ok(Pattern::Http(_))));
        assert!(matches!(Pattern::parse("/favicon.ico"), Ok(Pattern::Http(_))));
        assert!(matches!(Pattern::parse("example.com/"), Ok(Pattern::Http(_))));
        assert!(matches!(Pattern::parse("*/robots.txt"), Ok(Pattern::Http(_))));
        assert!(matches!(Pattern::parse(":tcp:50002"), Ok(Pattern::Tcp(50002))));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("example.com").is_err());
        assert!(Pattern::parse(":tcp:0").is_err());
        assert!(Pattern::parse(":tcp:99999").is_err());
        assert!(Pattern::parse(":tcp:abc").is_err());
    }

    #[test]
    fn test_host_rules() {
        let unspecified = http("/app/");
        assert!(unspecified.matches_host("anything.example.com", None));
        assert!(unspecified.matches_host("portal.example.com", Some("portal.example.com")));
        assert!(!unspecified.matches_host("other.example.com", Some("portal.example.com")));

        let any = http("*/app/");
        assert!(any.matches_host("a.example.com", Some("portal.example.com")));

        let exact = http("api.example.com/app/");
        assert!(exact.matches_host("API.example.com", None));
        assert!(!exact.matches_host("web.example.com", None));
    }

    #[test]
    fn test_path_rules() {
        let dir = http("/foo/");
        assert!(dir.matches_path("/foo/"));
        assert!(dir.matches_path("/foo/bar"));
        assert!(!dir.matches_path("/foo"));
        assert!(dir.wants_trailing_slash("/foo"));

        let exact = http("/favicon.ico");
        assert!(exact.matches_path("/favicon.ico"));
        assert!(!exact.matches_path("/favicon.ico/extra"));
        assert!(!exact.wants_trailing_slash("/favicon.ic"));
    }

    #[test]
    fn test_root_pattern_matches_everything() {
        let root = http("/");
        assert!(root.matches_path("/"));
        assert!(root.matches_path("/deeply/nested/path"));
        assert!(!root.wants_trailing_slash(""));
    }

    #[test]
    fn test_strip() {
        let dir = http("/app/");
        assert_eq!(dir.strip("/app/x"), "/x");
        assert_eq!(dir.strip("/app/"), "/");
        assert_eq!(dir.prefix(), "/app");

        let exact = http("/status");
        assert_eq!(exact.strip("/status"), "/");
    }

    #[test]
    fn test_acme_shadowing() {
        assert!(http("/.well-known/acme-challenge/").shadows_acme_challenge());
        assert!(http("*/.well-known/acme-challenge/").shadows_acme_challenge());
        assert!(http("/.well-known/acme-challenge/token").shadows_acme_challenge());
        assert!(http("/.well-known/").shadows_acme_challenge());
        assert!(!http("/").shadows_acme_challenge());
        assert!(!http("/app/").shadows_acme_challenge());
    }
}
