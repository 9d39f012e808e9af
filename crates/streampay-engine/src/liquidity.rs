//! Admin-facing liquidity operations, idempotent per idempotency key.
//!
//! Each operation records its response under the key in the same store pass
//! as the ledger transfer, so a replay returns the stored envelope and the
//! ledger sees at most one transfer.

use crate::lifecycle::{FundParams, OutgoingPaymentError, OutgoingPaymentService, PaymentStore};
use ring::digest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use streampay_ledger::{Deposit, Ledger, LedgerError, Withdrawal};
use streampay_payments::store::{IdempotencyStore, IdempotentRecord};
use streampay_payments::WebhookEventType;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Two-phase liquidity withdrawals must be posted or voided within this
/// window unless the caller chooses otherwise.
const DEFAULT_WITHDRAWAL_TIMEOUT_SECONDS: u64 = 60;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LiquidityError {
    #[error("InvalidId")]
    InvalidId,
    #[error("UnknownAsset")]
    UnknownAsset,
    #[error("UnknownPeer")]
    UnknownPeer,
    #[error("UnknownWalletAddress")]
    UnknownWalletAddress,
    #[error("UnknownTransfer")]
    UnknownTransfer,
    #[error("AmountZero")]
    AmountZero,
    #[error("InsufficientBalance")]
    InsufficientBalance,
    #[error("TransferExists")]
    TransferExists,
    #[error("AlreadyPosted")]
    AlreadyPosted,
    #[error("AlreadyVoided")]
    AlreadyVoided,
}

impl LiquidityError {
    fn code(&self) -> &'static str {
        match self {
            LiquidityError::InvalidId | LiquidityError::AmountZero => "400",
            LiquidityError::InsufficientBalance => "403",
            LiquidityError::UnknownAsset
            | LiquidityError::UnknownPeer
            | LiquidityError::UnknownWalletAddress
            | LiquidityError::UnknownTransfer => "404",
            LiquidityError::TransferExists
            | LiquidityError::AlreadyPosted
            | LiquidityError::AlreadyVoided => "409",
        }
    }
}

/// The liquidity operations consumed by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "camelCase")]
pub enum LiquidityOp {
    #[serde(rename_all = "camelCase")]
    AddAssetLiquidity {
        id: Uuid,
        asset_id: Uuid,
        amount: u64,
    },
    #[serde(rename_all = "camelCase")]
    AddPeerLiquidity { id: Uuid, peer_id: Uuid, amount: u64 },
    #[serde(rename_all = "camelCase")]
    CreateAssetLiquidityWithdrawal {
        id: Uuid,
        asset_id: Uuid,
        amount: u64,
        timeout_seconds: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    CreatePeerLiquidityWithdrawal {
        id: Uuid,
        peer_id: Uuid,
        amount: u64,
        timeout_seconds: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    CreateWalletAddressWithdrawal {
        id: Uuid,
        wallet_address_id: Uuid,
        amount: u64,
        timeout_seconds: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    PostLiquidityWithdrawal { withdrawal_id: Uuid },
    #[serde(rename_all = "camelCase")]
    VoidLiquidityWithdrawal { withdrawal_id: Uuid },
    #[serde(rename_all = "camelCase")]
    DepositEventLiquidity { event_id: Uuid },
    #[serde(rename_all = "camelCase")]
    WithdrawEventLiquidity { event_id: Uuid },
}

/// The response envelope the admin surface returns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquidityResponse {
    pub code: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LiquidityResponse {
    fn ok() -> Self {
        LiquidityResponse {
            code: "200".to_string(),
            success: true,
            message: None,
            error: None,
        }
    }

    fn err(error: &LiquidityError) -> Self {
        LiquidityResponse {
            code: error.code().to_string(),
            success: false,
            message: None,
            error: Some(error.to_string()),
        }
    }

    fn idempotency_conflict() -> Self {
        LiquidityResponse {
            code: "409".to_string(),
            success: false,
            message: Some("idempotency key re-used with different input".to_string()),
            error: None,
        }
    }
}

pub struct LiquidityService<S> {
    store: S,
    ledger: Arc<dyn Ledger>,
    payments: Arc<OutgoingPaymentService<S>>,
}

impl<S> LiquidityService<S>
where
    S: PaymentStore + IdempotencyStore,
{
    pub fn new(store: S, ledger: Arc<dyn Ledger>, payments: Arc<OutgoingPaymentService<S>>) -> Self {
        LiquidityService {
            store,
            ledger,
            payments,
        }
    }

    /// Runs one operation. With an idempotency key, a replay returns the
    /// stored response; re-using a key for different input is refused.
    pub async fn execute(
        &self,
        op: LiquidityOp,
        idempotency_key: Option<String>,
    ) -> LiquidityResponse {
        let input_hash = hash_input(&op);
        if let Some(ref key) = idempotency_key {
            if let Some(record) = self.store.load_idempotent_record(key).await {
                if record.input_hash != input_hash {
                    return LiquidityResponse::idempotency_conflict();
                }
                if let Ok(stored) = serde_json::from_str::<LiquidityResponse>(&record.body) {
                    return stored;
                }
            }
        }

        let response = match self.apply(op).await {
            Ok(()) => LiquidityResponse::ok(),
            Err(error) => LiquidityResponse::err(&error),
        };

        if let Some(key) = idempotency_key {
            let record = IdempotentRecord {
                input_hash,
                status: response.code.parse().unwrap_or(500),
                body: serde_json::to_string(&response).unwrap_or_default(),
            };
            self.store.save_idempotent_record(key, record).await;
        }
        response
    }

    async fn apply(&self, op: LiquidityOp) -> Result<(), LiquidityError> {
        match op {
            LiquidityOp::AddAssetLiquidity {
                id,
                asset_id,
                amount,
            } => {
                use streampay_payments::store::AssetStore;
                self.store
                    .get_asset(asset_id)
                    .await
                    .ok_or(LiquidityError::UnknownAsset)?;
                self.deposit(id, asset_id, amount).await
            }
            LiquidityOp::AddPeerLiquidity { id, peer_id, amount } => {
                use streampay_payments::store::PeerStore;
                self.store
                    .get_peer(peer_id)
                    .await
                    .ok_or(LiquidityError::UnknownPeer)?;
                self.deposit(id, peer_id, amount).await
            }
            LiquidityOp::CreateAssetLiquidityWithdrawal {
                id,
                asset_id,
                amount,
                timeout_seconds,
            } => {
                use streampay_payments::store::AssetStore;
                self.store
                    .get_asset(asset_id)
                    .await
                    .ok_or(LiquidityError::UnknownAsset)?;
                self.withdraw(id, asset_id, amount, timeout_seconds).await
            }
            LiquidityOp::CreatePeerLiquidityWithdrawal {
                id,
                peer_id,
                amount,
                timeout_seconds,
            } => {
                use streampay_payments::store::PeerStore;
                self.store
                    .get_peer(peer_id)
                    .await
                    .ok_or(LiquidityError::UnknownPeer)?;
                self.withdraw(id, peer_id, amount, timeout_seconds).await
            }
            LiquidityOp::CreateWalletAddressWithdrawal {
                id,
                wallet_address_id,
                amount,
                timeout_seconds,
            } => {
                use streampay_payments::store::WalletAddressStore;
                self.store
                    .get_wallet_address(wallet_address_id)
                    .await
                    .ok_or(LiquidityError::UnknownWalletAddress)?;
                self.withdraw(id, wallet_address_id, amount, timeout_seconds)
                    .await
            }
            LiquidityOp::PostLiquidityWithdrawal { withdrawal_id } => self
                .ledger
                .post_withdrawal(withdrawal_id)
                .await
                .map_err(map_transfer_error),
            LiquidityOp::VoidLiquidityWithdrawal { withdrawal_id } => self
                .ledger
                .void_withdrawal(withdrawal_id)
                .await
                .map_err(map_transfer_error),
            LiquidityOp::DepositEventLiquidity { event_id } => {
                self.deposit_event(event_id).await
            }
            LiquidityOp::WithdrawEventLiquidity { event_id } => {
                self.withdraw_event(event_id).await
            }
        }
    }

    async fn deposit(&self, id: Uuid, account_id: Uuid, amount: u64) -> Result<(), LiquidityError> {
        if amount == 0 {
            return Err(LiquidityError::AmountZero);
        }
        self.ledger
            .create_deposit(Deposit {
                id,
                account_id,
                amount,
            })
            .await
            .map_err(map_transfer_error)
    }

    async fn withdraw(
        &self,
        id: Uuid,
        account_id: Uuid,
        amount: u64,
        timeout_seconds: Option<u64>,
    ) -> Result<(), LiquidityError> {
        if amount == 0 {
            return Err(LiquidityError::AmountZero);
        }
        let timeout = timeout_seconds.unwrap_or(DEFAULT_WITHDRAWAL_TIMEOUT_SECONDS);
        self.ledger
            .create_withdrawal(Withdrawal {
                id,
                account_id,
                amount,
                timeout: Some(Duration::from_secs(timeout)),
            })
            .await
            .map_err(map_transfer_error)
    }

    /// For an `outgoing_payment.created` event: funds the payment with the
    /// quoted amount, using the event id as the transfer id.
    async fn deposit_event(&self, event_id: Uuid) -> Result<(), LiquidityError> {
        use streampay_payments::store::{EventStore, QuoteStore};
        let event = self
            .store
            .get_event(event_id)
            .await
            .ok_or(LiquidityError::InvalidId)?;
        if event.kind != WebhookEventType::OutgoingPaymentCreated {
            return Err(LiquidityError::InvalidId);
        }
        let payment_id = event
            .data
            .get("id")
            .and_then(|value| value.as_str())
            .and_then(|value| Uuid::parse_str(value).ok())
            .ok_or(LiquidityError::InvalidId)?;
        use streampay_payments::store::OutgoingPaymentStore;
        let payment = self
            .store
            .get_outgoing_payment(payment_id)
            .await
            .ok_or(LiquidityError::InvalidId)?;
        let quote = self
            .store
            .get_quote(payment.quote_id)
            .await
            .ok_or(LiquidityError::InvalidId)?;

        match self
            .payments
            .fund(FundParams {
                id: payment.id,
                amount: quote.debit_amount.value,
                transfer_id: event_id,
            })
            .await
        {
            Ok(_) => Ok(()),
            Err(OutgoingPaymentError::WrongState) => Err(LiquidityError::TransferExists),
            Err(err) => {
                warn!("Event-liquidity deposit for {} failed: {}", payment.id, err);
                Err(LiquidityError::InvalidId)
            }
        }
    }

    /// Posts an event's attached withdrawal against the bound account.
    async fn withdraw_event(&self, event_id: Uuid) -> Result<(), LiquidityError> {
        use streampay_payments::store::EventStore;
        let event = self
            .store
            .get_event(event_id)
            .await
            .ok_or(LiquidityError::InvalidId)?;
        let withdrawal = event.withdrawal.ok_or(LiquidityError::InvalidId)?;
        self.ledger
            .create_withdrawal(Withdrawal {
                id: event_id,
                account_id: withdrawal.account_id,
                amount: withdrawal.amount,
                timeout: None,
            })
            .await
            .map_err(map_transfer_error)
    }
}

fn map_transfer_error(error: LedgerError) -> LiquidityError {
    match error {
        LedgerError::TransferExists => LiquidityError::TransferExists,
        LedgerError::UnknownTransfer => LiquidityError::UnknownTransfer,
        LedgerError::AlreadyPosted => LiquidityError::AlreadyPosted,
        LedgerError::AlreadyVoided => LiquidityError::AlreadyVoided,
        LedgerError::InsufficientBalance => LiquidityError::InsufficientBalance,
        LedgerError::InvalidAmount => LiquidityError::AmountZero,
        LedgerError::UnknownAccount | LedgerError::InvalidAccount => LiquidityError::InvalidId,
        LedgerError::AccountAlreadyExists => LiquidityError::InvalidId,
    }
}

fn hash_input(op: &LiquidityOp) -> [u8; 32] {
    let serialized = serde_json::to_vec(op).unwrap_or_default();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(digest::digest(&digest::SHA256, &serialized).as_ref());
    hash
}
