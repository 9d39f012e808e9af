use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingPaymentState {
    /// Waiting for the quoted amount to be deposited
    Funding,
    /// The worker is (re)trying to deliver
    Sending,
    Completed,
    Failed,
}

/// A payment this node is sending on behalf of a wallet address.
///
/// Shares its id with the quote that priced it; the unique key on `quote_id`
/// is what makes quotes single-use. The ledger account holds the reserved
/// source amount from funding until the residual is withdrawn.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingPayment {
    pub id: Uuid,
    pub wallet_address_id: Uuid,
    pub quote_id: Uuid,
    pub state: OutgoingPaymentState,
    pub sent_amount: u64,
    pub state_attempts: u32,
    pub error: Option<String>,
    pub peer_id: Option<Uuid>,
    pub grant_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    pub client: Option<String>,
    /// When the lifecycle worker should next pick this payment up
    pub process_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OutgoingPayment {
    pub fn new(
        quote_id: Uuid,
        wallet_address_id: Uuid,
        grant_id: Option<Uuid>,
        metadata: Option<serde_json::Value>,
        client: Option<String>,
    ) -> Self {
        OutgoingPayment {
            id: quote_id,
            wallet_address_id,
            quote_id,
            state: OutgoingPaymentState::Funding,
            sent_amount: 0,
            state_attempts: 0,
            error: None,
            peer_id: None,
            grant_id,
            metadata,
            client,
            process_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            OutgoingPaymentState::Completed | OutgoingPaymentState::Failed
        )
    }
}
