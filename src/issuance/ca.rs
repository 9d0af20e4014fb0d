use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::{debug, warn};
use rand::RngCore;
use thiserror::Error;
use uuid::Uuid;

/// The contract the orchestrator needs from a certificate authority,
/// independent of the CA's wire protocol. Implementations own no durable
/// state the orchestrator depends on; everything worth remembering comes
/// back as the opaque order handle.
///
/// Methods block on network I/O; the orchestrator calls them through
/// `spawn_blocking`.
pub trait CaAdapter: Send + Sync {
    /// Registers intent to certify `domain` and returns the HTTP-01
    /// challenge token plus an opaque CA-side order handle.
    fn create_order(&self, domain: &str, email: &str) -> Result<NewCaOrder, CaError>;

    /// Tells the CA the challenge file is published so it can run its own
    /// validation fetch.
    fn notify_challenge_ready(&self, handle: &str) -> Result<(), CaError>;

    /// Submits the CSR and returns the issued certificate (PEM bytes).
    fn finalize(&self, handle: &str, csr_pem: &str) -> Result<Vec<u8>, CaError>;
}

#[derive(Debug, Clone)]
pub struct NewCaOrder {
    pub token: String,
    pub handle: String,
}

#[derive(Error, Debug)]
pub enum CaError {
    #[error("certificate authority unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited by certificate authority")]
    RateLimited { retry_after: Option<Duration> },

    #[error("identifier rejected by certificate authority: {0}")]
    RejectedIdentifier(String),

    #[error("challenge rejected by certificate authority: {0}")]
    ChallengeRejected(String),

    #[error("certificate authority order expired")]
    OrderExpired,

    #[error("finalize rejected by certificate authority: {0}")]
    FinalizeRejected(String),
}

impl CaError {
    /// Transient errors are retried with backoff; everything else is a
    /// CA-side policy decision and fails the order immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaError::Unavailable(_) | CaError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            CaError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Stand-in CA for tests and offline operation: hands out real-looking
/// challenge tokens and finalizes orders with a self-signed certificate for
/// the requested domain. Tracks its open orders so a finalize against an
/// unknown or already-consumed handle is rejected the way a real CA would.
pub struct SelfSignedCaAdapter {
    open_orders: Mutex<HashMap<String, String>>,
}

impl SelfSignedCaAdapter {
    pub fn new() -> Self {
        Self {
            open_orders: Mutex::new(HashMap::new()),
        }
    }

    fn random_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

impl Default for SelfSignedCaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl CaAdapter for SelfSignedCaAdapter {
    fn create_order(&self, domain: &str, _email: &str) -> Result<NewCaOrder, CaError> {
        if domain.is_empty() {
            return Err(CaError::RejectedIdentifier("empty domain".to_string()));
        }
        let order = NewCaOrder {
            token: Self::random_token(),
            handle: format!("order_{}", Uuid::new_v4().as_simple()),
        };
        debug!("[ca] opened stub order {} for {domain}", order.handle);
        self.open_orders
            .lock()
            .map_err(|e| CaError::Unavailable(e.to_string()))?
            .insert(order.handle.clone(), domain.to_string());
        Ok(order)
    }

    fn notify_challenge_ready(&self, handle: &str) -> Result<(), CaError> {
        let known = self
            .open_orders
            .lock()
            .map_err(|e| CaError::Unavailable(e.to_string()))?
            .contains_key(handle);
        if !known {
            warn!("[ca] challenge-ready notification for unknown handle {handle}");
            return Err(CaError::ChallengeRejected(format!(
                "unknown order handle: {handle}"
            )));
        }
        Ok(())
    }

    fn finalize(&self, handle: &str, _csr_pem: &str) -> Result<Vec<u8>, CaError> {
        let domain = self
            .open_orders
            .lock()
            .map_err(|e| CaError::Unavailable(e.to_string()))?
            .remove(handle)
            .ok_or_else(|| {
                CaError::FinalizeRejected(format!("unknown order handle: {handle}"))
            })?;

        let key = rcgen::KeyPair::generate()
            .map_err(|e| CaError::Unavailable(format!("stub key generation failed: {e}")))?;
        let params = rcgen::CertificateParams::new(vec![domain.clone()])
            .map_err(|e| CaError::RejectedIdentifier(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CaError::Unavailable(format!("stub signing failed: {e}")))?;
        debug!("[ca] finalized stub order {handle} for {domain}");
        Ok(cert.pem().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_order_issues_distinct_tokens_and_handles() {
        let ca = SelfSignedCaAdapter::new();
        let a = ca.create_order("example.com", "admin@example.com").unwrap();
        let b = ca.create_order("example.org", "admin@example.org").unwrap();
        assert_ne!(a.token, b.token);
        assert_ne!(a.handle, b.handle);
        assert!(!a.token.is_empty());
    }

    #[test]
    fn finalize_returns_pem_for_known_handle() {
        let ca = SelfSignedCaAdapter::new();
        let order = ca.create_order("example.com", "admin@example.com").unwrap();
        ca.notify_challenge_ready(&order.handle).unwrap();

        let cert = ca.finalize(&order.handle, "-----BEGIN CERTIFICATE REQUEST-----").unwrap();
        let pem = String::from_utf8(cert).unwrap();
        assert!(pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn finalize_rejects_unknown_handle() {
        let ca = SelfSignedCaAdapter::new();
        let err = ca.finalize("order_missing", "").unwrap_err();
        assert!(matches!(err, CaError::FinalizeRejected(_)));
    }

    #[test]
    fn finalize_consumes_the_handle() {
        let ca = SelfSignedCaAdapter::new();
        let order = ca.create_order("example.com", "admin@example.com").unwrap();
        ca.finalize(&order.handle, "").unwrap();
        assert!(matches!(
            ca.finalize(&order.handle, ""),
            Err(CaError::FinalizeRejected(_))
        ));
    }

    #[test]
    fn notify_rejects_unknown_handle() {
        let ca = SelfSignedCaAdapter::new();
        assert!(matches!(
            ca.notify_challenge_ready("order_missing"),
            Err(CaError::ChallengeRejected(_))
        ));
    }

    #[test]
    fn transient_classification() {
        assert!(CaError::Unavailable("down".into()).is_transient());
        assert!(
            CaError::RateLimited {
                retry_after: Some(Duration::from_secs(1))
            }
            .is_transient()
        );
        assert!(!CaError::RejectedIdentifier("bad".into()).is_transient());
        assert!(!CaError::OrderExpired.is_transient());
        assert!(!CaError::FinalizeRejected("no".into()).is_transient());
    }
}
