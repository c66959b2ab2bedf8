pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl PortalConfig {
    /// Load configuration and apply environment overrides. A missing file
    /// is not an error: every setting has a default, so a bare `portal`
    /// invocation comes up on the standard ports.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(path, &contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("config: {} not found, using defaults", path.display());
                PortalConfig::default()
            }
            Err(e) => {
                anyhow::bail!("config: cannot read {}: {e}", path.display());
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            "config: loaded, state_path={}, lease_ports={}..{}",
            config.state.path.display(),
            config.leases.port_range_start,
            config.leases.port_range_end,
        );
        Ok(config)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Ok(toml::from_str(contents)?),
            "json" => Ok(serde_json::from_str(contents)?),
            other => anyhow::bail!(
                "config: cannot tell the format of {} from its extension {:?}; portal reads .toml and .json",
                path.display(),
                other,
            ),
        }
    }

    /// Apply environment variable overrides for deployment settings.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PORTAL_BIND") {
            self.server.bind = v;
        }
        if let Ok(v) = std::env::var("PORTAL_HTTP_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.http_port = n;
            }
        }
        if let Ok(v) = std::env::var("PORTAL_HTTPS_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.https_port = n;
            }
        }
        if let Ok(v) = std::env::var("PORTAL_RPC_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.rpc_port = n;
            }
        }
        if let Ok(v) = std::env::var("PORTAL_ADMIN_PORT") {
            if let Ok(n) = v.parse::<u16>() {
                self.server.admin_port = n;
            }
        }
        if let Ok(v) = std::env::var("PORTAL_DEFAULT_HOST") {
            self.server.default_host = Some(v);
        }
        if let Ok(v) = std::env::var("PORTAL_STATE_PATH") {
            self.state.path = v.into();
        }
        if let Ok(v) = std::env::var("PORTAL_ACME_DOMAINS") {
            self.tls.acme.domains = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("PORTAL_ACME_CONTACT") {
            self.tls.acme.contact = Some(v);
        }
        if let Ok(v) = std::env::var("PORTAL_ACME_DIRECTORY") {
            self.tls.acme.directory = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.leases.port_range_start > self.leases.port_range_end {
            anyhow::bail!(
                "lease port range is inverted: {} > {}",
                self.leases.port_range_start,
                self.leases.port_range_end
            );
        }
        if self.leases.ttl_secs == 0 {
            anyhow::bail!("lease ttl_secs must be non-zero");
        }
        if self.leases.sweep_interval_secs == 0 {
            anyhow::bail!("lease sweep_interval_secs must be non-zero");
        }
        if !self.tls.acme.domains.is_empty() && self.tls.acme.contact.is_none() {
            anyhow::bail!("tls.acme.contact is required when ACME domains are configured");
        }
        for pair in &self.tls.certificates {
            if pair.cert.as_os_str().is_empty() || pair.key.as_os_str().is_empty() {
                anyhow::bail!("tls.certificates entries need both cert and key paths");
            }
        }
        Ok(())
    }
}
