use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingPaymentState {
    /// Created, nothing received yet
    Pending,
    /// At least one credit has settled
    Processing,
    /// Received the full `incoming_amount`, or completed explicitly
    Completed,
    /// `expires_at` passed before completion
    Expired,
}

/// A payment this node is waiting to receive.
///
/// The ledger account backing it is created lazily on the first credit
/// attempt; `received_amount` mirrors the account's total received.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingPayment {
    pub id: Uuid,
    pub wallet_address_id: Uuid,
    pub asset_id: Uuid,
    pub incoming_amount: Option<u64>,
    pub received_amount: u64,
    pub state: IncomingPaymentState,
    pub expires_at: DateTime<Utc>,
    /// Set while the payment can still receive; nulled on Completed/Expired
    pub connection_id: Option<Uuid>,
    pub metadata: Option<serde_json::Value>,
    /// When the post-completion webhook should fire
    pub process_at: Option<DateTime<Utc>>,
    /// Whether the ledger account exists yet
    pub ledger_account_created: bool,
    pub created_at: DateTime<Utc>,
}

impl IncomingPayment {
    pub fn new(
        wallet_address_id: Uuid,
        asset_id: Uuid,
        incoming_amount: Option<u64>,
        expires_at: DateTime<Utc>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        IncomingPayment {
            id: Uuid::new_v4(),
            wallet_address_id,
            asset_id,
            incoming_amount,
            received_amount: 0,
            state: IncomingPaymentState::Pending,
            expires_at,
            connection_id: Some(Uuid::new_v4()),
            metadata,
            process_at: None,
            ledger_account_created: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            IncomingPaymentState::Completed | IncomingPaymentState::Expired
        )
    }

    /// The most this payment will accept in total.
    pub fn receive_max(&self) -> u64 {
        self.incoming_amount.unwrap_or(u64::max_value())
    }

    /// Applies a settled credit, returning true if the state changed.
    pub fn apply_credit(&mut self, total_received: u64, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let mut changed = false;
        if total_received != self.received_amount {
            self.received_amount = total_received;
            changed = true;
        }
        if self.state == IncomingPaymentState::Pending {
            self.state = IncomingPaymentState::Processing;
            changed = true;
        }
        if let Some(incoming_amount) = self.incoming_amount {
            if total_received >= incoming_amount {
                self.complete(now);
                changed = true;
            }
        }
        changed
    }

    /// Moves to Completed and severs the connection.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = IncomingPaymentState::Completed;
        self.connection_id = None;
        self.process_at = Some(now);
    }

    /// Moves to Expired and severs the connection.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        self.state = IncomingPaymentState::Expired;
        self.connection_id = None;
        self.process_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn payment(incoming_amount: Option<u64>) -> IncomingPayment {
        IncomingPayment::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            incoming_amount,
            Utc::now() + Duration::minutes(10),
            None,
        )
    }

    #[test]
    fn first_credit_moves_pending_to_processing() {
        let mut payment = payment(Some(100));
        assert!(payment.apply_credit(30, Utc::now()));
        assert_eq!(payment.state, IncomingPaymentState::Processing);
        assert_eq!(payment.received_amount, 30);
        assert!(payment.connection_id.is_some());
    }

    #[test]
    fn completes_when_the_incoming_amount_arrives() {
        let mut payment = payment(Some(100));
        payment.apply_credit(100, Utc::now());
        assert_eq!(payment.state, IncomingPaymentState::Completed);
        assert_eq!(payment.connection_id, None);
        assert!(payment.process_at.is_some());
    }

    #[test]
    fn open_ended_payments_never_autocomplete() {
        let mut payment = payment(None);
        payment.apply_credit(1_000_000, Utc::now());
        assert_eq!(payment.state, IncomingPaymentState::Processing);
    }

    #[test]
    fn terminal_states_ignore_credits() {
        let mut payment = payment(Some(100));
        payment.expire(Utc::now());
        assert!(!payment.apply_credit(50, Utc::now()));
        assert_eq!(payment.state, IncomingPaymentState::Expired);
        assert_eq!(payment.connection_id, None);
    }
}
