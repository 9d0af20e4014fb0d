use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a per-domain issuance order.
///
/// `Issued` and `Failed` are terminal; a terminal order is never mutated
/// again and is superseded by the next `order` call for the same domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Order registered with the CA, challenge token not yet recorded.
    Created,
    /// Token and key authorization assigned; waiting for the operator to
    /// publish the challenge file.
    PendingValidation,
    /// Our own challenge fetch matched the expected key authorization.
    Validated,
    /// CSR submitted to the CA; waiting for the certificate.
    Finalizing,
    /// Certificate downloaded and stored.
    Issued,
    /// Terminal failure; `last_error` explains why.
    Failed,
}

impl OrderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Created => "created",
            OrderState::PendingValidation => "pending_validation",
            OrderState::Validated => "validated",
            OrderState::Finalizing => "finalizing",
            OrderState::Issued => "issued",
            OrderState::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "created" => Some(OrderState::Created),
            "pending_validation" => Some(OrderState::PendingValidation),
            "validated" => Some(OrderState::Validated),
            "finalizing" => Some(OrderState::Finalizing),
            "issued" => Some(OrderState::Issued),
            "failed" => Some(OrderState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Issued | OrderState::Failed)
    }

    /// True when the order is live, i.e. a second `order` call for the same
    /// domain must reuse it instead of opening a duplicate CA order.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// The legal transition table. Any edge not listed here is a bug in the
    /// caller and is refused by the store.
    pub fn can_transition_to(&self, next: OrderState) -> bool {
        use OrderState::*;
        matches!(
            (*self, next),
            (Created, PendingValidation)
                | (Created, Failed)
                | (PendingValidation, Validated)
                | (PendingValidation, Failed)
                | (Validated, Finalizing)
                | (Validated, Failed)
                | (Finalizing, Issued)
                | (Finalizing, Failed)
        )
    }
}

/// A per-domain issuance order, the unit of work this crate tracks.
///
/// Persisted across process restarts; the operator publishes the challenge
/// file at their own pace between the `order` and `finalize` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Unique identifier for the order record.
    pub id: String,
    /// Subject domain, normalized to ASCII lowercase. Lookup key.
    pub domain: String,
    /// Account contact email; immutable once the order exists.
    pub email: String,
    /// Opaque HTTP-01 challenge token issued by the CA.
    pub token: Option<String>,
    /// `{token}.{account key thumbprint}`; what the operator must publish.
    pub key_authorization: Option<String>,
    /// Opaque CA-side order identifier, passed back on finalize.
    pub ca_order_handle: Option<String>,
    pub state: OrderState,
    /// PEM certificate chain; present if and only if `state` is `Issued`.
    pub certificate_pem: Option<String>,
    /// PEM leaf private key generated for the CSR; set alongside the
    /// certificate.
    pub private_key_pem: Option<String>,
    /// Expiry of the issued certificate.
    pub not_after: Option<DateTime<Utc>>,
    /// SHA-256 fingerprint of the issued certificate (hex).
    pub fingerprint: Option<String>,
    /// Why the order failed; present only when `state` is `Failed`.
    pub last_error: Option<String>,
    /// Validation attempts consumed so far, cumulative across calls.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A fresh order in `Created` state; the challenge fields are filled in
    /// once the CA assigns a token.
    pub fn new(domain: String, email: String) -> Self {
        let now = Utc::now();
        Self {
            id: format!("order_{}", uuid::Uuid::new_v4().as_simple()),
            domain,
            email,
            token: None,
            key_authorization: None,
            ca_order_handle: None,
            state: OrderState::Created,
            certificate_pem: None,
            private_key_pem: None,
            not_after: None,
            fingerprint: None,
            last_error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderRequest {
    pub domain: String,
    pub email: String,
}

/// What the client shows after placing (or re-requesting) an order.
#[derive(Debug, Clone, Serialize)]
pub struct OrderReceipt {
    pub message: String,
    pub token: String,
    pub key_authorization: String,
}

/// The `(key authorization, token)` pair the operator must publish.
#[derive(Debug, Clone, Serialize)]
pub struct KeyAuthorization {
    pub key_authorization: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReceipt {
    pub message: String,
    pub issued: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_text() {
        for state in [
            OrderState::Created,
            OrderState::PendingValidation,
            OrderState::Validated,
            OrderState::Finalizing,
            OrderState::Issued,
            OrderState::Failed,
        ] {
            assert_eq!(OrderState::parse(state.as_str()), Some(state));
        }
        assert_eq!(OrderState::parse("bogus"), None);
    }

    #[test]
    fn state_serializes_as_snake_case() {
        assert_eq!(
            serde_json::to_string(&OrderState::PendingValidation).unwrap(),
            "\"pending_validation\""
        );
        assert_eq!(
            serde_json::from_str::<OrderState>("\"issued\"").unwrap(),
            OrderState::Issued
        );
    }

    #[test]
    fn receipt_serializes_for_clients() {
        let receipt = OrderReceipt {
            message: "publish the file".to_string(),
            token: "tok".to_string(),
            key_authorization: "tok.thumb".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["token"], "tok");
        assert_eq!(json["key_authorization"], "tok.thumb");
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for next in [
            OrderState::Created,
            OrderState::PendingValidation,
            OrderState::Validated,
            OrderState::Finalizing,
            OrderState::Issued,
            OrderState::Failed,
        ] {
            assert!(!OrderState::Issued.can_transition_to(next));
            assert!(!OrderState::Failed.can_transition_to(next));
        }
    }

    #[test]
    fn happy_path_edges_are_legal() {
        assert!(OrderState::Created.can_transition_to(OrderState::PendingValidation));
        assert!(OrderState::PendingValidation.can_transition_to(OrderState::Validated));
        assert!(OrderState::Validated.can_transition_to(OrderState::Finalizing));
        assert!(OrderState::Finalizing.can_transition_to(OrderState::Issued));
    }

    #[test]
    fn failure_edges_are_legal() {
        assert!(OrderState::Created.can_transition_to(OrderState::Failed));
        assert!(OrderState::PendingValidation.can_transition_to(OrderState::Failed));
        assert!(OrderState::Validated.can_transition_to(OrderState::Failed));
        assert!(OrderState::Finalizing.can_transition_to(OrderState::Failed));
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!OrderState::Created.can_transition_to(OrderState::Issued));
        assert!(!OrderState::PendingValidation.can_transition_to(OrderState::Finalizing));
        assert!(!OrderState::Validated.can_transition_to(OrderState::Issued));
    }
}
