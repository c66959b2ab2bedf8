pub mod acme;
pub mod ca;
pub mod serving;

pub use acme::AcmeClient;
pub use ca::CertificateAuthority;
pub use serving::{CertSource, ServingContext, ServingEntry};

use std::time::{Duration, SystemTime};

/// Delay before a certificate's next refresh check: a hundredth of the
/// remaining validity, floored at one minute. Short-lived certificates get
/// checked often; long-lived ones roughly daily.
pub fn refresh_delay(not_after: SystemTime) -> Duration {
    let remaining = not_after
        .duration_since(SystemTime::now())
        .unwrap_or_default();
    std::cmp::max(remaining / 100, Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_delay_scales_with_remaining_validity() {
        let ninety_days = SystemTime::now() + Duration::from_secs(90 * 24 * 60 * 60);
        let delay = refresh_delay(ninety_days);
        assert!(delay >= Duration::from_secs(21 * 60 * 60));
        assert!(delay <= Duration::from_secs(23 * 60 * 60));
    }

    #[test]
    fn test_refresh_delay_floor() {
        let soon = SystemTime::now() + Duration::from_secs(30);
        assert_eq!(refresh_delay(soon), Duration::from_secs(60));
        let past = SystemTime::now() - Duration::from_secs(30);
        assert_eq!(refresh_delay(past), Duration::from_secs(60));
    }
}
