use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::{DateTime, TimeZone, Utc};
use log::{info, warn};
use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;

use crate::core::types::{
    FinalizeReceipt, KeyAuthorization, Order, OrderReceipt, OrderRequest, OrderState,
};
use crate::domain::{normalize_domain, validate_contact_email};
use crate::issuance::acme::AccountKey;
use crate::issuance::ca::{CaAdapter, CaError, NewCaOrder};
use crate::issuance::csr;
use crate::issuance::error::IssuanceError;
use crate::issuance::key_authorization;
use crate::issuance::retry::{RetryPolicy, retry_transient};
use crate::issuance::validator::{ChallengeValidator, FetchError};
use crate::storage::orders::OrderStore;

/// Drives the whole issuance workflow: the three operations the client
/// calls, the per-domain serialization between them, and the recovery
/// policy for everything that can go wrong in the middle.
pub struct IssuanceOrchestrator {
    store: OrderStore,
    ca: Arc<dyn CaAdapter>,
    validator: ChallengeValidator,
    account_key: Arc<AccountKey>,
    retry: RetryPolicy,
    // One async mutex per domain so concurrent calls for the same domain
    // serialize while unrelated domains proceed independently.
    domain_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IssuanceOrchestrator {
    pub fn new(
        store: OrderStore,
        ca: Arc<dyn CaAdapter>,
        validator: ChallengeValidator,
        account_key: Arc<AccountKey>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            ca,
            validator,
            account_key,
            retry,
            domain_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Places (or re-issues) an order for `domain`. An order already in
    /// flight is returned as-is so repeated clicks never open duplicate CA
    /// orders; a terminal order is superseded by a fresh one.
    pub async fn order(&self, request: OrderRequest) -> Result<OrderReceipt, IssuanceError> {
        let domain = normalize_domain(&request.domain)
            .map_err(|err| IssuanceError::InvalidInput(err.to_string()))?;
        let email = validate_contact_email(&request.email)
            .map_err(|err| IssuanceError::InvalidInput(err.to_string()))?;

        let lock = self.domain_lock(&domain)?;
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.latest_for_domain(&domain)? {
            match existing.state {
                OrderState::PendingValidation | OrderState::Validated | OrderState::Finalizing => {
                    let (token, key_authorization) = challenge_pair(&existing)?;
                    info!("[orchestrator] reusing in-flight order {} for {domain}", existing.id);
                    return Ok(OrderReceipt {
                        message: publish_instructions(&domain, &token),
                        token,
                        key_authorization,
                    });
                }
                OrderState::Created => {
                    // Interrupted between insert and challenge assignment
                    // (process died mid-create). Retire it and start over.
                    self.store
                        .mark_failed(&existing.id, "interrupted before challenge assignment")?;
                }
                OrderState::Issued | OrderState::Failed => {
                    info!(
                        "[orchestrator] superseding terminal order {} for {domain}",
                        existing.id
                    );
                }
            }
        }

        let order = Order::new(domain.clone(), email.clone());
        self.store.insert(&order)?;

        let ca_order = match self.ca_create_order(&domain, &email).await {
            Ok(ca_order) => ca_order,
            Err(err) => {
                self.store.mark_failed(&order.id, &err.to_string())?;
                return Err(err.into());
            }
        };

        let key_auth = match key_authorization::generate(&ca_order.token, &self.account_key) {
            Ok(key_auth) => key_auth,
            Err(err) => {
                self.store.mark_failed(&order.id, &err.to_string())?;
                return Err(err);
            }
        };
        self.store
            .set_challenge(&order.id, &ca_order.token, &key_auth, &ca_order.handle)?;

        info!(
            "[orchestrator] order {} created for {domain}, awaiting challenge publication",
            order.id
        );
        Ok(OrderReceipt {
            message: publish_instructions(&domain, &ca_order.token),
            token: ca_order.token,
            key_authorization: key_auth,
        })
    }

    /// Snapshot read of the most recent order's challenge pair. Safe to call
    /// repeatedly and concurrently; takes no locks.
    pub fn key_authorization(&self, domain: &str) -> Result<KeyAuthorization, IssuanceError> {
        let domain = normalize_domain(domain)
            .map_err(|err| IssuanceError::InvalidInput(err.to_string()))?;
        let order = self
            .store
            .latest_for_domain(&domain)?
            .ok_or_else(|| IssuanceError::NotFound(domain.clone()))?;
        match (order.key_authorization, order.token) {
            (Some(key_authorization), Some(token)) => Ok(KeyAuthorization {
                key_authorization,
                token,
            }),
            _ => Err(IssuanceError::NotFound(domain)),
        }
    }

    /// Validates domain control and completes issuance with the CA.
    ///
    /// Dropping the returned future cancels promptly: the validation fetch
    /// and the backoff sleeps are all async.
    pub async fn finalize(&self, domain: &str) -> Result<FinalizeReceipt, IssuanceError> {
        let domain = normalize_domain(domain)
            .map_err(|err| IssuanceError::InvalidInput(err.to_string()))?;

        let lock = self.domain_lock(&domain)?;
        let _guard = lock.lock().await;

        let order = self
            .store
            .latest_for_domain(&domain)?
            .ok_or_else(|| IssuanceError::NoPendingOrder(domain.clone()))?;

        match order.state {
            OrderState::Issued => Ok(FinalizeReceipt {
                message: format!("Certificate for {domain} was already issued."),
                issued: true,
            }),
            OrderState::Failed => Err(IssuanceError::OrderAlreadyFinal(domain)),
            OrderState::Created => Err(IssuanceError::NoPendingOrder(domain)),
            OrderState::PendingValidation => {
                self.run_validation(&order).await?;
                self.complete_issuance(&order).await
            }
            // Validated or Finalizing: validation already passed; a
            // Finalizing order here means a previous run died mid-finalize,
            // so resume the CA side of the flow.
            OrderState::Validated | OrderState::Finalizing => {
                self.complete_issuance(&order).await
            }
        }
    }

    /// Bounded pre-check loop against the operator-published challenge
    /// file. Attempts are persisted on the order; transient fetch failures
    /// and clean mismatches both consume an attempt, because a mismatch can
    /// still resolve while the operator finishes publishing.
    async fn run_validation(&self, order: &Order) -> Result<(), IssuanceError> {
        let (token, expected) = challenge_pair(order)?;

        for attempt in 1..=self.retry.max_attempts {
            let total = self.store.record_attempt(&order.id)?;
            let outcome = self.validator.validate(&order.domain, &token, &expected).await;

            match outcome {
                Ok(true) => {
                    self.store.mark_validated(&order.id)?;
                    info!(
                        "[orchestrator] challenge for {} validated on attempt {total}",
                        order.domain
                    );
                    return Ok(());
                }
                Ok(false) => {
                    warn!(
                        "[orchestrator] challenge mismatch for {} (attempt {total})",
                        order.domain
                    );
                }
                Err(FetchError::Transient(reason)) => {
                    warn!(
                        "[orchestrator] challenge fetch for {} failed transiently: {reason}",
                        order.domain
                    );
                }
                Err(FetchError::Blocked(target)) => {
                    let message = format!(
                        "{target} resolves to a private or loopback address; refusing to validate"
                    );
                    self.store.mark_failed(&order.id, &message)?;
                    return Err(IssuanceError::ValidationFailed(message));
                }
            }

            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.backoff_for(attempt)).await;
            }
        }

        let message = format!(
            "key authorization was not found at \
             http://{}/.well-known/acme-challenge/{token} within {} attempts; \
             check that the file is published with the exact value, then order again",
            order.domain, self.retry.max_attempts
        );
        self.store.mark_failed(&order.id, &message)?;
        Err(IssuanceError::ValidationFailed(message))
    }

    /// CA-side completion: notify, CSR, finalize, store the certificate.
    async fn complete_issuance(&self, order: &Order) -> Result<FinalizeReceipt, IssuanceError> {
        let handle = order
            .ca_order_handle
            .clone()
            .ok_or_else(|| anyhow!("order {} has no CA handle", order.id))?;
        let domain = order.domain.clone();

        if let Err(err) = self.ca_notify_ready(&handle).await {
            self.store.mark_failed(&order.id, &err.to_string())?;
            return Err(err.into());
        }

        let bundle = match spawn_blocking({
            let domain = domain.clone();
            move || csr::generate_for_domain(&domain)
        })
        .await
        .map_err(|err| anyhow!("CSR task failed: {err}"))?
        {
            Ok(bundle) => bundle,
            Err(err) => {
                self.store.mark_failed(&order.id, &err.to_string())?;
                return Err(IssuanceError::Csr(err.to_string()));
            }
        };

        self.store.begin_finalize(&order.id)?;

        let certificate = match self.ca_finalize(&handle, &bundle.csr_pem).await {
            Ok(certificate) => certificate,
            Err(err) => {
                self.store.mark_failed(&order.id, &err.to_string())?;
                return Err(err.into());
            }
        };

        let certificate_pem = String::from_utf8_lossy(&certificate).into_owned();
        let (not_after, fingerprint) = certificate_metadata(&certificate_pem);
        self.store.mark_issued(
            &order.id,
            &certificate_pem,
            &bundle.private_key_pem,
            not_after,
            fingerprint.as_deref(),
        )?;

        info!("[orchestrator] certificate issued for {domain}");
        Ok(FinalizeReceipt {
            message: format!("Certificate issued successfully for {domain}."),
            issued: true,
        })
    }

    async fn ca_create_order(&self, domain: &str, email: &str) -> Result<NewCaOrder, CaError> {
        let ca = self.ca.clone();
        let domain = domain.to_string();
        let email = email.to_string();
        retry_transient(&self.retry, "CA create_order", move || {
            let ca = ca.clone();
            let domain = domain.clone();
            let email = email.clone();
            async move {
                spawn_blocking(move || ca.create_order(&domain, &email))
                    .await
                    .map_err(|err| CaError::Unavailable(format!("CA call failed: {err}")))?
            }
        })
        .await
    }

    async fn ca_notify_ready(&self, handle: &str) -> Result<(), CaError> {
        let ca = self.ca.clone();
        let handle = handle.to_string();
        retry_transient(&self.retry, "CA notify_challenge_ready", move || {
            let ca = ca.clone();
            let handle = handle.clone();
            async move {
                spawn_blocking(move || ca.notify_challenge_ready(&handle))
                    .await
                    .map_err(|err| CaError::Unavailable(format!("CA call failed: {err}")))?
            }
        })
        .await
    }

    async fn ca_finalize(&self, handle: &str, csr_pem: &str) -> Result<Vec<u8>, CaError> {
        let ca = self.ca.clone();
        let handle = handle.to_string();
        let csr_pem = csr_pem.to_string();
        retry_transient(&self.retry, "CA finalize", move || {
            let ca = ca.clone();
            let handle = handle.clone();
            let csr_pem = csr_pem.clone();
            async move {
                spawn_blocking(move || ca.finalize(&handle, &csr_pem))
                    .await
                    .map_err(|err| CaError::Unavailable(format!("CA call failed: {err}")))?
            }
        })
        .await
    }

    fn domain_lock(&self, domain: &str) -> Result<Arc<tokio::sync::Mutex<()>>, IssuanceError> {
        let mut locks = self
            .domain_locks
            .lock()
            .map_err(|err| anyhow!("domain lock table poisoned: {err}"))?;
        // Entries referenced only by the map belong to finished calls; sweep
        // them so the table does not grow with every domain ever seen.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Ok(locks.entry(domain.to_string()).or_default().clone())
    }
}

fn publish_instructions(domain: &str, token: &str) -> String {
    format!(
        "Order created for {domain}. Publish the key authorization as plain text at \
         http://{domain}/.well-known/acme-challenge/{token}, then finalize the order."
    )
}

fn challenge_pair(order: &Order) -> Result<(String, String), IssuanceError> {
    match (&order.token, &order.key_authorization) {
        (Some(token), Some(key_auth)) => Ok((token.clone(), key_auth.clone())),
        _ => Err(IssuanceError::Storage(anyhow!(
            "order {} is past creation but has no challenge pair",
            order.id
        ))),
    }
}

/// Best-effort expiry and fingerprint extraction from the issued PEM; a
/// certificate we cannot parse is still stored and returned.
fn certificate_metadata(pem: &str) -> (Option<DateTime<Utc>>, Option<String>) {
    let parsed = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .ok()
        .and_then(|(_, block)| {
            let raw = block.contents.clone();
            block.parse_x509().ok().map(|cert| {
                let not_after = Utc
                    .timestamp_opt(cert.validity().not_after.timestamp(), 0)
                    .single();
                let fingerprint = hex::encode(Sha256::digest(&raw));
                (not_after, fingerprint)
            })
        });
    match parsed {
        Some((not_after, fingerprint)) => (not_after, Some(fingerprint)),
        None => {
            warn!("[orchestrator] issued certificate could not be parsed for metadata");
            (None, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::ca::SelfSignedCaAdapter;
    use crate::issuance::validator::ValidatorConfig;
    use std::time::Duration;

    fn test_orchestrator() -> IssuanceOrchestrator {
        let config = ValidatorConfig {
            timeout: Duration::from_millis(200),
            max_redirects: 3,
            max_body_bytes: 4096,
            allow_private_networks: true,
        };
        IssuanceOrchestrator::new(
            OrderStore::in_memory().unwrap(),
            Arc::new(SelfSignedCaAdapter::new()),
            ChallengeValidator::new(config),
            Arc::new(AccountKey::generate().unwrap()),
            RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(10),
            },
        )
    }

    #[tokio::test]
    async fn order_rejects_empty_input() {
        let orchestrator = test_orchestrator();
        let err = orchestrator
            .order(OrderRequest {
                domain: "".into(),
                email: "admin@example.com".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidInput(_)));

        let err = orchestrator
            .order(OrderRequest {
                domain: "example.com".into(),
                email: "not-an-email".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IssuanceError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn key_authorization_before_order_is_not_found() {
        let orchestrator = test_orchestrator();
        assert!(matches!(
            orchestrator.key_authorization("example.com"),
            Err(IssuanceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn finalize_before_order_is_no_pending_order() {
        let orchestrator = test_orchestrator();
        assert!(matches!(
            orchestrator.finalize("example.com").await,
            Err(IssuanceError::NoPendingOrder(_))
        ));
    }

    #[tokio::test]
    async fn order_then_key_authorization_round_trips() {
        let orchestrator = test_orchestrator();
        let receipt = orchestrator
            .order(OrderRequest {
                domain: "Example.COM".into(),
                email: "admin@example.com".into(),
            })
            .await
            .unwrap();
        assert!(receipt.message.contains("example.com"));
        assert!(receipt.message.contains(&receipt.token));

        let pair = orchestrator.key_authorization("example.com").unwrap();
        assert_eq!(pair.token, receipt.token);
        assert_eq!(pair.key_authorization, receipt.key_authorization);
        assert!(pair.key_authorization.starts_with(&format!("{}.", pair.token)));
    }

    #[tokio::test]
    async fn reordering_an_in_flight_domain_reuses_the_order() {
        let orchestrator = test_orchestrator();
        let request = OrderRequest {
            domain: "example.com".into(),
            email: "admin@example.com".into(),
        };
        let first = orchestrator.order(request.clone()).await.unwrap();
        let second = orchestrator.order(request).await.unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(first.key_authorization, second.key_authorization);
    }

    #[tokio::test]
    async fn idle_domain_locks_are_swept() {
        let orchestrator = test_orchestrator();
        orchestrator
            .order(OrderRequest {
                domain: "example.com".into(),
                email: "admin@example.com".into(),
            })
            .await
            .unwrap();

        // `order` released its guard, so the next lookup for any domain
        // evicts the idle entry.
        let _held = orchestrator.domain_lock("example.org").unwrap();
        let locks = orchestrator.domain_locks.lock().unwrap();
        assert!(!locks.contains_key("example.com"));
        assert!(locks.contains_key("example.org"));
    }

    #[tokio::test]
    async fn unpublished_challenge_fails_validation_and_marks_order() {
        let orchestrator = test_orchestrator();
        orchestrator
            .order(OrderRequest {
                // Nothing is listening here, so every attempt fails.
                domain: "127.0.0.1:39999".into(),
                email: "admin@example.com".into(),
            })
            .await
            .unwrap();

        let err = orchestrator.finalize("127.0.0.1:39999").await.unwrap_err();
        assert!(matches!(err, IssuanceError::ValidationFailed(_)));

        // The order is terminally failed; finalizing again says so.
        let err = orchestrator.finalize("127.0.0.1:39999").await.unwrap_err();
        assert!(matches!(err, IssuanceError::OrderAlreadyFinal(_)));
    }
}
