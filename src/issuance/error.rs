use thiserror::Error;

use crate::issuance::ca::CaError;

/// Errors surfaced to the client across the three public operations.
///
/// Transient CA and network failures are retried internally and only show up
/// here once the retry budget is spent; fatal CA rejections pass through
/// unchanged so the caller sees the CA's own reason.
#[derive(Error, Debug)]
pub enum IssuanceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid challenge token")]
    InvalidToken,

    #[error("no order found for domain: {0}")]
    NotFound(String),

    #[error("no pending order for domain: {0}")]
    NoPendingOrder(String),

    #[error("order for {0} already reached a terminal state")]
    OrderAlreadyFinal(String),

    #[error("domain validation failed: {0}")]
    ValidationFailed(String),

    #[error("certificate request generation failed: {0}")]
    Csr(String),

    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
