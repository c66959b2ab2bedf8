use crate::error::{PortalError, Result};
use arc_swap::ArcSwap;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
    PKCS_ECDSA_P256_SHA256,
};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::info;
use x509_parser::prelude::FromDer;

/// The self-managed certificate authority.
///
/// Generates an ECDSA P-256 key pair and a self-signed CA certificate at
/// startup, rotates both on a fixed schedule, and signs backend CSRs with a
/// lifetime that always outlives the lease across one renewal cycle. The
/// current CA certificate doubles as the RPC server's TLS leaf.
pub struct CertificateAuthority {
    ttl: Duration,
    lease_ttl: Duration,
    inner: Mutex<CaKeyMaterial>,
    /// Published leaf for the RPC listener; swapped on rotation so the
    /// server picks up the new certificate without restarting.
    leaf: ArcSwap<CertifiedKey>,
}

struct CaKeyMaterial {
    key: KeyPair,
    params: CertificateParams,
    cert_der: Vec<u8>,
}

impl CertificateAuthority {
    pub fn new(ca_ttl: Duration, lease_ttl: Duration) -> Result<Self> {
        let (material, certified) = generate_material(ca_ttl)?;
        info!("ca: generated internal certificate authority, ttl={}s", ca_ttl.as_secs());
        Ok(Self {
            ttl: ca_ttl,
            lease_ttl,
            inner: Mutex::new(material),
            leaf: ArcSwap::new(Arc::new(certified)),
        })
    }

    /// Replace the CA key pair and certificate. Returns the new DER so the
    /// caller can append it to the trust pool; previously issued roots stay
    /// valid until their own expiry.
    pub fn rotate(&self) -> Result<Vec<u8>> {
        let (material, certified) = generate_material(self.ttl)?;
        let der = material.cert_der.clone();
        {
            let mut inner = self.lock();
            *inner = material;
        }
        self.leaf.store(Arc::new(certified));
        info!("ca: rotated internal certificate authority");
        metrics::counter!("portal_cert_renewals_total", "source" => "internal_ca", "result" => "success")
            .increment(1);
        Ok(der)
    }

    /// Renewal fires at half the CA lifetime.
    pub fn renewal_interval(&self) -> Duration {
        self.ttl / 2
    }

    pub fn cert_der(&self) -> Vec<u8> {
        self.lock().cert_der.clone()
    }

    /// The current CA leaf for the RPC listener's TLS.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.leaf.load_full()
    }

    /// The CA leaf as a client identity, presented on backend-facing
    /// transports for mutual TLS.
    pub fn client_identity(
        &self,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let inner = self.lock();
        let chain = vec![CertificateDer::from(inner.cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(inner.key.serialize_der()));
        Ok((chain, key))
    }

    /// Sign a backend's DER-encoded CSR.
    ///
    /// The issued certificate carries a random 128-bit serial, the
    /// server-auth EKU, the SANs from the CSR, and
    /// `NotAfter = now + 2 × lease TTL` so it outlives the lease across one
    /// renewal cycle.
    pub fn sign_csr(&self, csr_der: &[u8]) -> Result<Vec<u8>> {
        // A request whose self-signature does not verify never reaches the
        // issuer; the backend must hold the key it is asking us to certify.
        let (_, parsed) = x509_parser::certification_request::X509CertificationRequest::from_der(
            csr_der,
        )
        .map_err(|e| PortalError::InvalidCsr(e.to_string()))?;
        parsed
            .verify_signature()
            .map_err(|e| PortalError::InvalidCsr(format!("signature check failed: {e}")))?;

        let mut csr = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
            .map_err(|e| PortalError::InvalidCsr(e.to_string()))?;

        let now = SystemTime::now();
        csr.params.serial_number = Some(random_serial());
        csr.params.not_before = now.into();
        csr.params.not_after = (now + self.lease_ttl * 2).into();
        csr.params.is_ca = IsCa::NoCa;
        csr.params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let inner = self.lock();
        let issuer = Issuer::from_params(&inner.params, &inner.key);
        let cert = csr
            .signed_by(&issuer)
            .map_err(|e| PortalError::CertificateIssuance(e.to_string()))?;
        Ok(cert.der().to_vec())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CaKeyMaterial> {
        self.inner.lock().expect("ca lock poisoned")
    }
}

fn generate_material(ttl: Duration) -> Result<(CaKeyMaterial, CertifiedKey)> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| PortalError::CertificateIssuance(format!("ca keygen: {e}")))?;

    let mut params = CertificateParams::new(vec!["portal".to_string()])
        .map_err(|e| PortalError::CertificateIssuance(format!("ca params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "portal");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + ttl).into();
    params.serial_number = Some(random_serial());

    let cert = params
        .self_signed(&key)
        .map_err(|e| PortalError::CertificateIssuance(format!("ca self-sign: {e}")))?;
    let cert_der = cert.der().to_vec();
    let certified = certified_key_from(cert_der.clone(), &key)?;

    Ok((
        CaKeyMaterial {
            key,
            params,
            cert_der,
        },
        certified,
    ))
}

/// Build a rustls `CertifiedKey` from a DER chain head and an rcgen key.
pub fn certified_key_from(cert_der: Vec<u8>, key: &KeyPair) -> Result<CertifiedKey> {
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
    let signing_key = rustls::crypto::ring::default_provider()
        .key_provider
        .load_private_key(key_der)
        .map_err(|e| PortalError::CertificateIssuance(format!("load key: {e}")))?;
    Ok(CertifiedKey::new(
        vec![CertificateDer::from(cert_der)],
        signing_key,
    ))
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    // Keep the INTEGER positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::{FromDer, X509Certificate};

    fn authority() -> CertificateAuthority {
        let _ = rustls::crypto::ring::default_provider().install_default();
        CertificateAuthority::new(
            Duration::from_secs(240 * 60 * 60),
            Duration::from_secs(24 * 60 * 60),
        )
        .unwrap()
    }

    fn backend_csr(sans: Vec<String>) -> (KeyPair, Vec<u8>) {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(sans).unwrap();
        let csr = params.serialize_request(&key).unwrap();
        (key, csr.der().to_vec())
    }

    #[test]
    fn test_ca_certificate_shape() {
        let ca = authority();
        let der = ca.cert_der();
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert!(cert.is_ca());
        assert!(cert.subject().to_string().contains("portal"));
        let validity = cert.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, 240 * 60 * 60);
    }

    #[test]
    fn test_rotation_changes_material() {
        let ca = authority();
        let before = ca.cert_der();
        let leaf_before = ca.certified_key();
        let rotated = ca.rotate().unwrap();
        assert_ne!(before, rotated);
        assert_eq!(ca.cert_der(), rotated);
        assert!(!Arc::ptr_eq(&leaf_before, &ca.certified_key()));
    }

    #[test]
    fn test_sign_csr_preserves_sans_and_outlives_lease() {
        let ca = authority();
        let (_key, csr) = backend_csr(vec!["10.0.0.5".to_string()]);
        let issued = ca.sign_csr(&csr).unwrap();

        let (_, cert) = X509Certificate::from_der(&issued).unwrap();
        assert!(cert.subject_alternative_name().unwrap().is_some());
        assert!(cert.issuer().to_string().contains("portal"));

        // NotAfter must exceed the lease timeout (now + lease_ttl) with a
        // full extra cycle to spare.
        let lease_expiry = SystemTime::now() + Duration::from_secs(24 * 60 * 60);
        let lease_unix = lease_expiry
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert!(cert.validity().not_after.timestamp() > lease_unix);
    }

    #[test]
    fn test_sign_csr_rejects_garbage() {
        let ca = authority();
        assert!(matches!(
            ca.sign_csr(&[0x00, 0x01, 0x02]),
            Err(PortalError::InvalidCsr(_))
        ));
    }

    #[test]
    fn test_sign_csr_rejects_corrupted_signature() {
        let ca = authority();
        let (_key, mut csr) = backend_csr(vec!["10.0.0.5".to_string()]);
        // The signature bits sit at the tail of the DER; flipping one byte
        // leaves the request parseable but unverifiable.
        let last = csr.len() - 1;
        csr[last] ^= 0xff;
        assert!(matches!(
            ca.sign_csr(&csr),
            Err(PortalError::InvalidCsr(_))
        ));
    }

    #[test]
    fn test_resigning_after_rotation_uses_new_issuer() {
        let ca = authority();
        let (_key, csr) = backend_csr(vec!["backend.internal".to_string()]);
        let first = ca.sign_csr(&csr).unwrap();
        ca.rotate().unwrap();
        let second = ca.sign_csr(&csr).unwrap();
        assert_ne!(first, second);
    }
}
