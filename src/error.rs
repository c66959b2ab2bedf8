use std::fmt;

/// Error taxonomy for lease, routing, and certificate operations.
///
/// Variants that reach a client over RPC are mapped onto gRPC statuses by the
/// `From<PortalError> for tonic::Status` impl below.
#[derive(Debug)]
pub enum PortalError {
    /// Lease not found on renew/unregister.
    Unregistered,
    /// Lease found but its pattern does not match the stored one.
    InvalidLease,
    /// The free-pool of the port leasor is empty.
    NoPortsAvailable,
    /// A fixed port cannot be taken over (reserved by the operator).
    FixedPortTaken(u16),
    /// Requested fixed port does not fit in 16 bits.
    InvalidPort(u32),
    InvalidPattern(String),
    /// The pattern shadows the ACME challenge carve-out.
    ReservedPattern(String),
    HostnameResolve(String),
    InvalidCsr(String),
    CertificateIssuance(String),
    Persistence(String),
    Config(String),
    Internal(String),
}

impl fmt::Display for PortalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalError::Unregistered => write!(f, "lease not registered"),
            PortalError::InvalidLease => write!(f, "lease does not match registration"),
            PortalError::NoPortsAvailable => write!(f, "no ports available"),
            PortalError::FixedPortTaken(port) => write!(f, "fixed port {} is reserved", port),
            PortalError::InvalidPort(port) => write!(f, "port {} out of range", port),
            PortalError::InvalidPattern(msg) => write!(f, "invalid pattern: {}", msg),
            PortalError::ReservedPattern(pattern) => {
                write!(f, "pattern {} shadows the ACME challenge path", pattern)
            }
            PortalError::HostnameResolve(msg) => write!(f, "hostname resolution failed: {}", msg),
            PortalError::InvalidCsr(msg) => write!(f, "invalid certificate request: {}", msg),
            PortalError::CertificateIssuance(msg) => {
                write!(f, "certificate issuance failed: {}", msg)
            }
            PortalError::Persistence(msg) => write!(f, "state persistence failed: {}", msg),
            PortalError::Config(msg) => write!(f, "config error: {}", msg),
            PortalError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for PortalError {}

impl From<PortalError> for tonic::Status {
    fn from(err: PortalError) -> Self {
        let message = err.to_string();
        match err {
            PortalError::Unregistered | PortalError::InvalidLease => {
                tonic::Status::not_found(message)
            }
            PortalError::NoPortsAvailable => tonic::Status::resource_exhausted(message),
            PortalError::FixedPortTaken(_) => tonic::Status::failed_precondition(message),
            PortalError::InvalidPort(_)
            | PortalError::InvalidPattern(_)
            | PortalError::ReservedPattern(_)
            | PortalError::HostnameResolve(_)
            | PortalError::InvalidCsr(_) => tonic::Status::invalid_argument(message),
            PortalError::CertificateIssuance(_)
            | PortalError::Persistence(_)
            | PortalError::Config(_)
            | PortalError::Internal(_) => tonic::Status::internal(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, PortalError>;
