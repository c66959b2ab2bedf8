use crate::cert::serving::{cached_from_der, CachedCert};
use crate::error::{PortalError, Result};
use crate::proto;
use crate::state::StateManager;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus, RetryPolicy,
};
use rustls_pki_types::CertificateDer;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Reorder when less than this much validity remains.
const RENEW_BEFORE: Duration = Duration::from_secs(24 * 60 * 60);

/// Drives ACME HTTP-01 orders for configured domains.
///
/// The account key is persisted once through the state manager and reused
/// for every order. Challenge key-authorizations are published into the
/// router's carve-out map for the duration of the order. Orders are
/// serialized: the protocol steps for one domain must not interleave with
/// another's.
pub struct AcmeClient {
    state: Arc<StateManager>,
    challenges: Arc<DashMap<String, String>>,
    contact: String,
    directory: String,
    order_lock: Mutex<()>,
}

impl AcmeClient {
    pub fn new(
        state: Arc<StateManager>,
        challenges: Arc<DashMap<String, String>>,
        contact: String,
        directory: String,
    ) -> Self {
        Self {
            state,
            challenges,
            contact,
            directory,
            order_lock: Mutex::new(()),
        }
    }

    /// Return a serving certificate for `domain`, reusing the persisted one
    /// while it has comfortable validity left and ordering a fresh one
    /// otherwise.
    pub async fn ensure_certificate(&self, domain: &str) -> Result<CachedCert> {
        if let Some(stored) = self.state.certificate(domain) {
            match cached_from_stored(&stored) {
                Ok(cached) => {
                    if cached.not_after > SystemTime::now() + RENEW_BEFORE {
                        return Ok(cached);
                    }
                    info!("acme: certificate near expiry, reordering, domain={}", domain);
                }
                Err(e) => {
                    warn!(
                        "acme: stored certificate unusable, reordering, domain={}, error={}",
                        domain, e
                    );
                }
            }
        }
        self.order(domain).await
    }

    async fn order(&self, domain: &str) -> Result<CachedCert> {
        let _guard = self.order_lock.lock().await;
        let account = self.account().await?;

        let mut published_tokens = Vec::new();
        let outcome = self
            .drive_order(&account, domain, &mut published_tokens)
            .await;
        for token in &published_tokens {
            self.challenges.remove(token);
        }

        match &outcome {
            Ok(_) => {
                info!("acme: order complete, domain={}", domain);
                metrics::counter!("portal_acme_orders_total", "result" => "success").increment(1);
            }
            Err(e) => {
                warn!("acme: order failed, domain={}, error={}", domain, e);
                metrics::counter!("portal_acme_orders_total", "result" => "error").increment(1);
            }
        }
        outcome
    }

    async fn drive_order(
        &self,
        account: &Account,
        domain: &str,
        published_tokens: &mut Vec<String>,
    ) -> Result<CachedCert> {
        let identifiers = vec![Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(acme_err)?;

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authorization = result.map_err(acme_err)?;
            match authorization.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(PortalError::CertificateIssuance(format!(
                        "authorization in unexpected state {status:?}"
                    )))
                }
            }

            let mut challenge = authorization
                .challenge(ChallengeType::Http01)
                .ok_or_else(|| {
                    PortalError::CertificateIssuance(
                        "server offered no http-01 challenge".to_string(),
                    )
                })?;

            let key_authorization = challenge.key_authorization();
            self.challenges.insert(
                challenge.token.clone(),
                key_authorization.as_str().to_string(),
            );
            published_tokens.push(challenge.token.clone());
            challenge.set_ready().await.map_err(acme_err)?;
        }

        let status = order
            .poll_ready(&RetryPolicy::default())
            .await
            .map_err(acme_err)?;
        if status != OrderStatus::Ready {
            return Err(PortalError::CertificateIssuance(format!(
                "order did not become ready: {status:?}"
            )));
        }

        // finalize() generates a fresh key pair and CSR internally.
        let private_key_pem = order.finalize().await.map_err(acme_err)?;
        let chain_pem = order
            .poll_certificate(&RetryPolicy::default())
            .await
            .map_err(acme_err)?;

        let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut chain_pem.as_bytes())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| PortalError::CertificateIssuance(format!("parse chain: {e}")))?;
        if chain.is_empty() {
            return Err(PortalError::CertificateIssuance("empty certificate chain".into()));
        }
        let key = rustls_pemfile::private_key(&mut private_key_pem.as_bytes())
            .map_err(|e| PortalError::CertificateIssuance(format!("parse key: {e}")))?
            .ok_or_else(|| PortalError::CertificateIssuance("order returned no key".into()))?;

        self.state.put_certificate(
            domain,
            chain.iter().map(|c| c.as_ref().to_vec()).collect(),
            private_key_pem.into_bytes(),
        )?;

        cached_from_der(chain, key)
    }

    /// Load the persisted account or register a new one at the directory.
    async fn account(&self) -> Result<Account> {
        if let Some(bytes) = self.state.acme_account() {
            let credentials: AccountCredentials = serde_json::from_slice(&bytes)
                .map_err(|e| PortalError::CertificateIssuance(format!("account blob: {e}")))?;
            return Account::builder()
                .map_err(acme_err)?
                .from_credentials(credentials)
                .await
                .map_err(acme_err);
        }

        info!("acme: registering account, directory={}", self.directory);
        let (account, credentials) = Account::builder()
            .map_err(acme_err)?
            .create(
                &NewAccount {
                    contact: &[self.contact.as_str()],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory.clone(),
                None,
            )
            .await
            .map_err(acme_err)?;

        let bytes = serde_json::to_vec(&credentials)
            .map_err(|e| PortalError::CertificateIssuance(format!("serialize account: {e}")))?;
        self.state.set_acme_account(bytes)?;
        Ok(account)
    }
}

/// Rebuild a serving certificate from its persisted form.
pub fn cached_from_stored(stored: &proto::Certificate) -> Result<CachedCert> {
    if stored.cert_chain.is_empty() {
        return Err(PortalError::CertificateIssuance("stored chain empty".into()));
    }
    let chain: Vec<CertificateDer<'static>> = stored
        .cert_chain
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    let key = rustls_pemfile::private_key(&mut stored.private_key.as_slice())
        .map_err(|e| PortalError::CertificateIssuance(format!("stored key: {e}")))?
        .ok_or_else(|| PortalError::CertificateIssuance("stored key missing".into()))?;
    cached_from_der(chain, key)
}

fn acme_err(e: instant_acme::Error) -> PortalError {
    PortalError::CertificateIssuance(e.to_string())
}
