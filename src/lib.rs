//! ACME HTTP-01 domain-validation and certificate-issuance orchestrator.
//!
//! A client (a form, a CLI, an API route) drives a three-step workflow:
//! place an order for a domain/email pair, surface the key authorization the
//! operator must publish at `/.well-known/acme-challenge/{token}`, then
//! finalize once the file is live. Order state is durable, so the operator
//! can take as long as they need between steps.

pub mod core;
pub mod domain;
pub mod issuance;
pub mod storage;

pub use crate::core::types::{
    FinalizeReceipt, KeyAuthorization, Order, OrderReceipt, OrderRequest, OrderState,
};
pub use crate::issuance::acme::AccountKey;
pub use crate::issuance::ca::{CaAdapter, CaError, NewCaOrder, SelfSignedCaAdapter};
pub use crate::issuance::error::IssuanceError;
pub use crate::issuance::orchestrator::IssuanceOrchestrator;
pub use crate::issuance::retry::RetryPolicy;
pub use crate::issuance::validator::{ChallengeValidator, FetchError, ValidatorConfig};
pub use crate::storage::orders::OrderStore;
