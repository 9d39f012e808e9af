use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "incoming_payment.created")]
    IncomingPaymentCreated,
    #[serde(rename = "incoming_payment.completed")]
    IncomingPaymentCompleted,
    #[serde(rename = "incoming_payment.expired")]
    IncomingPaymentExpired,
    #[serde(rename = "outgoing_payment.created")]
    OutgoingPaymentCreated,
    #[serde(rename = "outgoing_payment.completed")]
    OutgoingPaymentCompleted,
    #[serde(rename = "outgoing_payment.failed")]
    OutgoingPaymentFailed,
    #[serde(rename = "wallet_address.web_monetization")]
    WalletAddressWebMonetization,
    #[serde(rename = "wallet_address.not_found")]
    WalletAddressNotFound,
}

/// Liquidity movement an event consumer is expected to settle, by calling
/// back into the liquidity API with the event id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventWithdrawal {
    pub account_id: Uuid,
    pub asset_id: Uuid,
    pub amount: u64,
}

/// An at-least-once webhook event, written in the same store transaction as
/// the state change it reports and garbage-collected after delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: WebhookEventType,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawal: Option<EventWithdrawal>,
    #[serde(skip)]
    pub attempts: u32,
    #[serde(skip)]
    pub status_code: Option<u16>,
    /// None once delivery succeeded or was abandoned
    #[serde(skip)]
    pub process_at: Option<DateTime<Utc>>,
    #[serde(skip, default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(kind: WebhookEventType, data: serde_json::Value) -> Self {
        WebhookEvent {
            id: Uuid::new_v4(),
            kind,
            data,
            withdrawal: None,
            attempts: 0,
            status_code: None,
            process_at: Some(Utc::now()),
            created_at: Utc::now(),
        }
    }

    pub fn with_withdrawal(mut self, withdrawal: EventWithdrawal) -> Self {
        self.withdrawal = Some(withdrawal);
        self
    }
}
