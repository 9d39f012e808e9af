use crate::{LedgerError, LiquidityAccount};
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// A deposit from the asset's settlement pool into a liquidity account.
#[derive(Debug, Clone, Copy)]
pub struct Deposit {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: u64,
}

/// A withdrawal out of a liquidity account back into the settlement pool.
///
/// With a `timeout` the withdrawal is two-phase: it reserves the amount now
/// and must be posted or voided before the timeout elapses, after which it
/// voids on its own.
#[derive(Debug, Clone, Copy)]
pub struct Withdrawal {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: u64,
    pub timeout: Option<Duration>,
}

/// A two-phase transfer between two liquidity accounts. Cross-currency when
/// `destination_amount` differs from `source_amount`.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest {
    pub id: Uuid,
    pub source_account_id: Uuid,
    pub destination_account_id: Uuid,
    pub source_amount: u64,
    pub destination_amount: Option<u64>,
    pub timeout: Duration,
}

/// The double-entry ledger the engine keeps its balances in.
///
/// The ledger is the authority for balances: domain tables only carry
/// derived totals. All mutations are idempotent on their caller-chosen ids;
/// replays observe `TransferExists` / `AccountAlreadyExists`.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Creates the ledger account backing a domain object. For `Asset`
    /// accounts this also provisions the asset's settlement pool.
    async fn create_liquidity_account(
        &self,
        account: LiquidityAccount,
    ) -> Result<(), LedgerError>;

    async fn get_account(&self, account_id: Uuid) -> Result<LiquidityAccount, LedgerError>;

    async fn create_deposit(&self, deposit: Deposit) -> Result<(), LedgerError>;

    async fn create_withdrawal(&self, withdrawal: Withdrawal) -> Result<(), LedgerError>;

    async fn post_withdrawal(&self, withdrawal_id: Uuid) -> Result<(), LedgerError>;

    async fn void_withdrawal(&self, withdrawal_id: Uuid) -> Result<(), LedgerError>;

    /// Reserves a pending transfer. The packet pipeline posts or voids it
    /// exactly once when the packet's fate is known.
    async fn create_transfer(&self, transfer: TransferRequest) -> Result<(), LedgerError>;

    async fn post_transfer(&self, transfer_id: Uuid) -> Result<(), LedgerError>;

    async fn void_transfer(&self, transfer_id: Uuid) -> Result<(), LedgerError>;

    /// Available balance: posted credits minus posted and pending debits.
    async fn get_balance(&self, account_id: Uuid) -> Result<u64, LedgerError>;

    async fn get_total_sent(&self, account_id: Uuid) -> Result<u64, LedgerError>;

    async fn get_total_received(&self, account_id: Uuid) -> Result<u64, LedgerError>;
}
