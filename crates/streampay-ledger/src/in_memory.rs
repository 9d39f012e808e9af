use crate::{
    AccountKind, Deposit, HookRegistry, Ledger, LedgerError, LiquidityAccount, TransferRequest,
    Withdrawal,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::trace;
use uuid::Uuid;

#[derive(Debug)]
struct AccountState {
    info: LiquidityAccount,
    credits_posted: u64,
    debits_posted: u64,
    debits_pending: u64,
    /// Settlement pools may go negative and never fire credit hooks
    is_settlement: bool,
}

impl AccountState {
    fn available(&self) -> u64 {
        self.credits_posted
            .saturating_sub(self.debits_posted)
            .saturating_sub(self.debits_pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TransferState {
    Pending { expires_at: Option<SystemTime> },
    Posted,
    Voided,
}

#[derive(Debug)]
struct TransferRecord {
    state: TransferState,
    source_account_id: Uuid,
    destination_account_id: Uuid,
    source_amount: u64,
    destination_amount: u64,
    is_withdrawal: bool,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<Uuid, AccountState>,
    transfers: HashMap<Uuid, TransferRecord>,
    /// asset id -> settlement pool account id
    settlement_accounts: HashMap<Uuid, Uuid>,
}

/// The reference ledger backend: a double-entry store held under one lock,
/// with a settlement pool per asset.
pub struct InMemoryLedger {
    inner: Mutex<Inner>,
    hooks: Arc<HookRegistry>,
}

/// A credit that settled and may have a hook to run.
struct SettledCredit {
    kind: AccountKind,
    account_id: Uuid,
    total_received: u64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        InMemoryLedger {
            inner: Mutex::new(Inner::default()),
            hooks: Arc::new(HookRegistry::new()),
        }
    }

    pub fn hooks(&self) -> Arc<HookRegistry> {
        self.hooks.clone()
    }

    async fn run_hook(&self, credit: Option<SettledCredit>) {
        if let Some(credit) = credit {
            if let Some(hook) = self.hooks.get(credit.kind) {
                hook.on_credit(credit.account_id, credit.total_received)
                    .await;
            }
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Voids every pending transfer whose timeout has elapsed. Run at the
    /// start of each operation so callers observe auto-void lazily.
    fn expire_pending(&mut self, now: SystemTime) {
        let expired: Vec<Uuid> = self
            .transfers
            .iter()
            .filter_map(|(id, record)| match record.state {
                TransferState::Pending {
                    expires_at: Some(expires_at),
                } if expires_at <= now => Some(*id),
                _ => None,
            })
            .collect();
        for id in expired {
            trace!("Auto-voiding expired pending transfer {}", id);
            let _ = self.void(id);
        }
    }

    fn prepare_transfer(
        &mut self,
        id: Uuid,
        source_account_id: Uuid,
        destination_account_id: Uuid,
        source_amount: u64,
        destination_amount: u64,
        expires_at: Option<SystemTime>,
        is_withdrawal: bool,
    ) -> Result<(), LedgerError> {
        if source_amount == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        if self.transfers.contains_key(&id) {
            return Err(LedgerError::TransferExists);
        }
        let source = self
            .accounts
            .get(&source_account_id)
            .ok_or(LedgerError::UnknownAccount)?;
        if !self.accounts.contains_key(&destination_account_id) {
            return Err(LedgerError::UnknownAccount);
        }
        if !source.is_settlement && source.available() < source_amount {
            return Err(LedgerError::InsufficientBalance);
        }
        let source = self
            .accounts
            .get_mut(&source_account_id)
            .ok_or(LedgerError::UnknownAccount)?;
        source.debits_pending += source_amount;
        self.transfers.insert(
            id,
            TransferRecord {
                state: TransferState::Pending { expires_at },
                source_account_id,
                destination_account_id,
                source_amount,
                destination_amount,
                is_withdrawal,
            },
        );
        Ok(())
    }

    fn post(&mut self, id: Uuid) -> Result<Option<SettledCredit>, LedgerError> {
        let record = self
            .transfers
            .get_mut(&id)
            .ok_or(LedgerError::UnknownTransfer)?;
        match record.state {
            TransferState::Posted => return Err(LedgerError::AlreadyPosted),
            TransferState::Voided => return Err(LedgerError::AlreadyVoided),
            TransferState::Pending { .. } => record.state = TransferState::Posted,
        }
        let (source_id, destination_id) = (record.source_account_id, record.destination_account_id);
        let (source_amount, destination_amount) = (record.source_amount, record.destination_amount);

        if let Some(source) = self.accounts.get_mut(&source_id) {
            source.debits_pending = source.debits_pending.saturating_sub(source_amount);
            source.debits_posted += source_amount;
        }
        let destination = self
            .accounts
            .get_mut(&destination_id)
            .ok_or(LedgerError::UnknownAccount)?;
        destination.credits_posted += destination_amount;
        if destination.is_settlement {
            return Ok(None);
        }
        Ok(Some(SettledCredit {
            kind: destination.info.kind,
            account_id: destination_id,
            total_received: destination.credits_posted,
        }))
    }

    fn void(&mut self, id: Uuid) -> Result<(), LedgerError> {
        let record = self
            .transfers
            .get_mut(&id)
            .ok_or(LedgerError::UnknownTransfer)?;
        match record.state {
            TransferState::Posted => return Err(LedgerError::AlreadyPosted),
            TransferState::Voided => return Err(LedgerError::AlreadyVoided),
            TransferState::Pending { .. } => record.state = TransferState::Voided,
        }
        let source_amount = record.source_amount;
        let source_id = record.source_account_id;
        if let Some(source) = self.accounts.get_mut(&source_id) {
            source.debits_pending = source.debits_pending.saturating_sub(source_amount);
        }
        Ok(())
    }

    fn settlement_account_for(&self, account_id: Uuid) -> Result<Uuid, LedgerError> {
        let account = self
            .accounts
            .get(&account_id)
            .ok_or(LedgerError::UnknownAccount)?;
        self.settlement_accounts
            .get(&account.info.asset_id)
            .copied()
            .ok_or(LedgerError::InvalidAccount)
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn create_liquidity_account(
        &self,
        account: LiquidityAccount,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        if inner.accounts.contains_key(&account.id) {
            return Err(LedgerError::AccountAlreadyExists);
        }
        if account.kind == AccountKind::Asset {
            let settlement_id = Uuid::new_v4();
            inner.accounts.insert(
                settlement_id,
                AccountState {
                    info: LiquidityAccount::new(settlement_id, account.asset_id, AccountKind::Asset),
                    credits_posted: 0,
                    debits_posted: 0,
                    debits_pending: 0,
                    is_settlement: true,
                },
            );
            inner
                .settlement_accounts
                .insert(account.asset_id, settlement_id);
        } else if !inner.settlement_accounts.contains_key(&account.asset_id) {
            return Err(LedgerError::InvalidAccount);
        }
        inner.accounts.insert(
            account.id,
            AccountState {
                info: account,
                credits_posted: 0,
                debits_posted: 0,
                debits_pending: 0,
                is_settlement: false,
            },
        );
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> Result<LiquidityAccount, LedgerError> {
        let inner = self.inner.lock();
        inner
            .accounts
            .get(&account_id)
            .filter(|account| !account.is_settlement)
            .map(|account| account.info)
            .ok_or(LedgerError::UnknownAccount)
    }

    async fn create_deposit(&self, deposit: Deposit) -> Result<(), LedgerError> {
        let credit = {
            let mut inner = self.inner.lock();
            inner.expire_pending(SystemTime::now());
            let settlement_id = inner.settlement_account_for(deposit.account_id)?;
            inner.prepare_transfer(
                deposit.id,
                settlement_id,
                deposit.account_id,
                deposit.amount,
                deposit.amount,
                None,
                false,
            )?;
            inner.post(deposit.id)?
        };
        self.run_hook(credit).await;
        Ok(())
    }

    async fn create_withdrawal(&self, withdrawal: Withdrawal) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();
        inner.expire_pending(now);
        let settlement_id = inner.settlement_account_for(withdrawal.account_id)?;
        let expires_at = withdrawal.timeout.map(|timeout| now + timeout);
        inner.prepare_transfer(
            withdrawal.id,
            withdrawal.account_id,
            settlement_id,
            withdrawal.amount,
            withdrawal.amount,
            expires_at,
            true,
        )?;
        if withdrawal.timeout.is_none() {
            // Single-phase: settle immediately
            inner.post(withdrawal.id)?;
        }
        Ok(())
    }

    async fn post_withdrawal(&self, withdrawal_id: Uuid) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        inner.expire_pending(SystemTime::now());
        match inner.transfers.get(&withdrawal_id) {
            Some(record) if record.is_withdrawal => {}
            Some(_) => return Err(LedgerError::UnknownTransfer),
            None => return Err(LedgerError::UnknownTransfer),
        }
        inner.post(withdrawal_id).map(|_| ())
    }

    async fn void_withdrawal(&self, withdrawal_id: Uuid) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        inner.expire_pending(SystemTime::now());
        match inner.transfers.get(&withdrawal_id) {
            Some(record) if record.is_withdrawal => {}
            Some(_) => return Err(LedgerError::UnknownTransfer),
            None => return Err(LedgerError::UnknownTransfer),
        }
        inner.void(withdrawal_id)
    }

    async fn create_transfer(&self, transfer: TransferRequest) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();
        inner.expire_pending(now);
        inner.prepare_transfer(
            transfer.id,
            transfer.source_account_id,
            transfer.destination_account_id,
            transfer.source_amount,
            transfer.destination_amount.unwrap_or(transfer.source_amount),
            Some(now + transfer.timeout),
            false,
        )
    }

    async fn post_transfer(&self, transfer_id: Uuid) -> Result<(), LedgerError> {
        let credit = {
            let mut inner = self.inner.lock();
            inner.expire_pending(SystemTime::now());
            inner.post(transfer_id)?
        };
        self.run_hook(credit).await;
        Ok(())
    }

    async fn void_transfer(&self, transfer_id: Uuid) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock();
        inner.expire_pending(SystemTime::now());
        inner.void(transfer_id)
    }

    async fn get_balance(&self, account_id: Uuid) -> Result<u64, LedgerError> {
        let mut inner = self.inner.lock();
        inner.expire_pending(SystemTime::now());
        inner
            .accounts
            .get(&account_id)
            .map(AccountState::available)
            .ok_or(LedgerError::UnknownAccount)
    }

    async fn get_total_sent(&self, account_id: Uuid) -> Result<u64, LedgerError> {
        let inner = self.inner.lock();
        inner
            .accounts
            .get(&account_id)
            .map(|account| account.debits_posted)
            .ok_or(LedgerError::UnknownAccount)
    }

    async fn get_total_received(&self, account_id: Uuid) -> Result<u64, LedgerError> {
        let inner = self.inner.lock();
        inner
            .accounts
            .get(&account_id)
            .map(|account| account.credits_posted)
            .ok_or(LedgerError::UnknownAccount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CreditHook;
    use std::sync::atomic::{AtomicU64, Ordering};

    async fn ledger_with_account(kind: AccountKind) -> (InMemoryLedger, Uuid, Uuid) {
        let ledger = InMemoryLedger::new();
        let asset_id = Uuid::new_v4();
        ledger
            .create_liquidity_account(LiquidityAccount::new(asset_id, asset_id, AccountKind::Asset))
            .await
            .unwrap();
        let account_id = Uuid::new_v4();
        ledger
            .create_liquidity_account(LiquidityAccount::new(account_id, asset_id, kind))
            .await
            .unwrap();
        (ledger, asset_id, account_id)
    }

    #[tokio::test]
    async fn account_creation_is_observable_on_replay() {
        let (ledger, asset_id, account_id) = ledger_with_account(AccountKind::Peer).await;
        assert_eq!(
            ledger
                .create_liquidity_account(LiquidityAccount::new(
                    account_id,
                    asset_id,
                    AccountKind::Peer
                ))
                .await,
            Err(LedgerError::AccountAlreadyExists)
        );
    }

    #[tokio::test]
    async fn deposit_is_idempotent_on_id() {
        let (ledger, _, account_id) = ledger_with_account(AccountKind::Peer).await;
        let deposit = Deposit {
            id: Uuid::new_v4(),
            account_id,
            amount: 100,
        };
        ledger.create_deposit(deposit).await.unwrap();
        assert_eq!(
            ledger.create_deposit(deposit).await,
            Err(LedgerError::TransferExists)
        );
        assert_eq!(ledger.get_balance(account_id).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn rejects_zero_deposits() {
        let (ledger, _, account_id) = ledger_with_account(AccountKind::Peer).await;
        let result = ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id,
                amount: 0,
            })
            .await;
        assert_eq!(result, Err(LedgerError::InvalidAmount));
    }

    #[tokio::test]
    async fn two_phase_withdrawal_lifecycle() {
        let (ledger, _, account_id) = ledger_with_account(AccountKind::Peer).await;
        ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id,
                amount: 100,
            })
            .await
            .unwrap();

        let withdrawal_id = Uuid::new_v4();
        ledger
            .create_withdrawal(Withdrawal {
                id: withdrawal_id,
                account_id,
                amount: 10,
                timeout: Some(Duration::from_secs(10)),
            })
            .await
            .unwrap();
        // reserved while pending
        assert_eq!(ledger.get_balance(account_id).await.unwrap(), 90);

        ledger.post_withdrawal(withdrawal_id).await.unwrap();
        assert_eq!(ledger.get_balance(account_id).await.unwrap(), 90);
        assert_eq!(ledger.get_total_sent(account_id).await.unwrap(), 10);

        assert_eq!(
            ledger.post_withdrawal(withdrawal_id).await,
            Err(LedgerError::AlreadyPosted)
        );
        assert_eq!(
            ledger.void_withdrawal(withdrawal_id).await,
            Err(LedgerError::AlreadyPosted)
        );
    }

    #[tokio::test]
    async fn voided_withdrawal_has_no_net_effect() {
        let (ledger, _, account_id) = ledger_with_account(AccountKind::Peer).await;
        ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id,
                amount: 100,
            })
            .await
            .unwrap();
        let withdrawal_id = Uuid::new_v4();
        ledger
            .create_withdrawal(Withdrawal {
                id: withdrawal_id,
                account_id,
                amount: 40,
                timeout: Some(Duration::from_secs(10)),
            })
            .await
            .unwrap();
        ledger.void_withdrawal(withdrawal_id).await.unwrap();
        assert_eq!(ledger.get_balance(account_id).await.unwrap(), 100);
        assert_eq!(
            ledger.post_withdrawal(withdrawal_id).await,
            Err(LedgerError::AlreadyVoided)
        );
    }

    #[tokio::test]
    async fn pending_withdrawals_void_at_timeout() {
        let (ledger, _, account_id) = ledger_with_account(AccountKind::Peer).await;
        ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id,
                amount: 100,
            })
            .await
            .unwrap();
        let withdrawal_id = Uuid::new_v4();
        ledger
            .create_withdrawal(Withdrawal {
                id: withdrawal_id,
                account_id,
                amount: 40,
                timeout: Some(Duration::from_millis(0)),
            })
            .await
            .unwrap();
        // the next operation observes the expiry
        assert_eq!(ledger.get_balance(account_id).await.unwrap(), 100);
        assert_eq!(
            ledger.post_withdrawal(withdrawal_id).await,
            Err(LedgerError::AlreadyVoided)
        );
    }

    #[tokio::test]
    async fn withdrawal_up_to_balance_but_not_over() {
        let (ledger, _, account_id) = ledger_with_account(AccountKind::Peer).await;
        ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id,
                amount: 100,
            })
            .await
            .unwrap();
        assert_eq!(
            ledger
                .create_withdrawal(Withdrawal {
                    id: Uuid::new_v4(),
                    account_id,
                    amount: 101,
                    timeout: None,
                })
                .await,
            Err(LedgerError::InsufficientBalance)
        );
        ledger
            .create_withdrawal(Withdrawal {
                id: Uuid::new_v4(),
                account_id,
                amount: 100,
                timeout: None,
            })
            .await
            .unwrap();
        assert_eq!(ledger.get_balance(account_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cross_currency_transfer_credits_destination_amount() {
        let ledger = InMemoryLedger::new();
        let usd = Uuid::new_v4();
        let xrp = Uuid::new_v4();
        for asset_id in &[usd, xrp] {
            ledger
                .create_liquidity_account(LiquidityAccount::new(
                    *asset_id,
                    *asset_id,
                    AccountKind::Asset,
                ))
                .await
                .unwrap();
        }
        let source = Uuid::new_v4();
        let destination = Uuid::new_v4();
        ledger
            .create_liquidity_account(LiquidityAccount::new(source, usd, AccountKind::Peer))
            .await
            .unwrap();
        ledger
            .create_liquidity_account(LiquidityAccount::new(
                destination,
                xrp,
                AccountKind::Incoming,
            ))
            .await
            .unwrap();
        ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id: source,
                amount: 100,
            })
            .await
            .unwrap();

        let transfer_id = Uuid::new_v4();
        ledger
            .create_transfer(TransferRequest {
                id: transfer_id,
                source_account_id: source,
                destination_account_id: destination,
                source_amount: 10,
                destination_amount: Some(5),
                timeout: Duration::from_secs(5),
            })
            .await
            .unwrap();
        ledger.post_transfer(transfer_id).await.unwrap();

        assert_eq!(ledger.get_total_sent(source).await.unwrap(), 10);
        assert_eq!(ledger.get_total_received(destination).await.unwrap(), 5);
    }

    struct CountingHook(AtomicU64);

    #[async_trait]
    impl CreditHook for CountingHook {
        async fn on_credit(&self, _account_id: Uuid, total_received: u64) {
            self.0.store(total_received, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn settled_credits_fire_the_kind_hook() {
        let (ledger, _, account_id) = ledger_with_account(AccountKind::Incoming).await;
        let hook = Arc::new(CountingHook(AtomicU64::new(0)));
        ledger.hooks().register(AccountKind::Incoming, hook.clone());

        ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id,
                amount: 25,
            })
            .await
            .unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 25);

        ledger
            .create_deposit(Deposit {
                id: Uuid::new_v4(),
                account_id,
                amount: 5,
            })
            .await
            .unwrap();
        assert_eq!(hook.0.load(Ordering::SeqCst), 30);
    }
}
