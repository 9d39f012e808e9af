use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A user-facing account identifier (a payment pointer URL).
///
/// Web-monetization credits land on a lazily-created ledger account;
/// `total_events_amount` accumulates what previous withdrawal events already
/// swept, and `process_at` schedules the next sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletAddress {
    pub id: Uuid,
    pub url: String,
    pub asset_id: Uuid,
    pub public_name: Option<String>,
    pub total_events_amount: u64,
    pub process_at: Option<DateTime<Utc>>,
    pub deactivated_at: Option<DateTime<Utc>>,
    /// Whether the web-monetization ledger account exists yet
    pub ledger_account_created: bool,
    pub created_at: DateTime<Utc>,
}

impl WalletAddress {
    pub fn new(url: impl Into<String>, asset_id: Uuid) -> Self {
        WalletAddress {
            id: Uuid::new_v4(),
            url: url.into(),
            asset_id,
            public_name: None,
            total_events_amount: 0,
            process_at: None,
            deactivated_at: None,
            ledger_account_created: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.deactivated_at {
            None => true,
            Some(deactivated_at) => deactivated_at > now,
        }
    }
}
