use crate::issuance::acme::AccountKey;
use crate::issuance::error::IssuanceError;

/// Computes the HTTP-01 key authorization for a challenge token:
/// `{token}.{account key thumbprint}`.
///
/// Pure and deterministic; identical inputs always yield the identical
/// string, so the value can be recomputed instead of mutated.
pub fn generate(token: &str, account_key: &AccountKey) -> Result<String, IssuanceError> {
    if token.is_empty() || !is_token_safe(token) {
        return Err(IssuanceError::InvalidToken);
    }
    Ok(format!("{}.{}", token, account_key.thumbprint()))
}

// ACME tokens are base64url strings; anything else would also be unsafe to
// splice into the well-known challenge path.
fn is_token_safe(token: &str) -> bool {
    token
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
