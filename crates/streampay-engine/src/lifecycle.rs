//! The outgoing-payment state machine: Funding → Sending → Completed/Failed.

use chrono::{Duration, Utc};
use std::sync::Arc;
use streampay_ledger::{AccountKind, Deposit, Ledger, LedgerError, LiquidityAccount};
use streampay_payments::store::{
    AssetStore, EventStore, GrantLockStore, IncomingPaymentStore, OutgoingPaymentStore, PeerStore,
    QuoteStore, StoreError, WalletAddressStore,
};
use streampay_payments::{
    Amount, Asset, EventWithdrawal, Grant, GrantLimits, OutgoingPayment, OutgoingPaymentState,
    Quote, ReceiverResolver, WebhookEvent, WebhookEventType,
};
use streampay_stream::{pay, IlpSender, PaymentError, PaymentPlan};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Base of the exponential retry backoff.
pub const RETRY_BACKOFF_SECONDS: i64 = 10;
/// Sending attempts before a retryable error becomes permanent.
pub const MAX_STATE_ATTEMPTS: u32 = 5;

/// The combined store surface the lifecycle engine needs.
pub trait PaymentStore:
    OutgoingPaymentStore
    + QuoteStore
    + WalletAddressStore
    + AssetStore
    + PeerStore
    + IncomingPaymentStore
    + EventStore
    + GrantLockStore
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> PaymentStore for T where
    T: OutgoingPaymentStore
        + QuoteStore
        + WalletAddressStore
        + AssetStore
        + PeerStore
        + IncomingPaymentStore
        + EventStore
        + GrantLockStore
        + Clone
        + Send
        + Sync
        + 'static
{
}

/// Builds the packet sender a given payment's pay step should use. The node
/// wires this to the pipeline; tests substitute loopbacks.
pub trait SenderFactory: Send + Sync {
    fn sender_for(&self, payment: &OutgoingPayment, asset: &Asset) -> Arc<dyn IlpSender>;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OutgoingPaymentError {
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    #[error("wallet address is deactivated")]
    InactiveWalletAddress,
    #[error("unknown quote")]
    UnknownQuote,
    #[error("invalid quote")]
    InvalidQuote,
    #[error("grant budget exhausted")]
    InsufficientGrant,
    #[error("unknown payment")]
    UnknownPayment,
    #[error("payment is not in the required state")]
    WrongState,
    #[error("invalid amount")]
    InvalidAmount,
}

#[derive(Debug, Clone)]
pub struct CreateOutgoingPaymentParams {
    pub wallet_address_id: Uuid,
    pub quote_id: Uuid,
    pub metadata: Option<serde_json::Value>,
    pub client: Option<String>,
    pub grant: Option<Grant>,
}

#[derive(Debug, Clone, Copy)]
pub struct FundParams {
    pub id: Uuid,
    pub amount: u64,
    pub transfer_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub retry_backoff: Duration,
    pub max_attempts: u32,
    /// Source address stamped into outgoing STREAM connections
    pub source_address: streampay_packet::Address,
}

pub struct OutgoingPaymentService<S> {
    store: S,
    ledger: Arc<dyn Ledger>,
    resolver: Arc<dyn ReceiverResolver>,
    senders: Arc<dyn SenderFactory>,
    config: LifecycleConfig,
}

impl<S: PaymentStore> OutgoingPaymentService<S> {
    pub fn new(
        store: S,
        ledger: Arc<dyn Ledger>,
        resolver: Arc<dyn ReceiverResolver>,
        senders: Arc<dyn SenderFactory>,
        config: LifecycleConfig,
    ) -> Self {
        OutgoingPaymentService {
            store,
            ledger,
            resolver,
            senders,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates a payment in Funding against a fresh quote, enforcing grant
    /// limits under the grant's row lock.
    pub async fn create(
        &self,
        params: CreateOutgoingPaymentParams,
    ) -> Result<OutgoingPayment, OutgoingPaymentError> {
        let now = Utc::now();
        let wallet = self
            .store
            .get_wallet_address(params.wallet_address_id)
            .await
            .ok_or(OutgoingPaymentError::UnknownWalletAddress)?;
        if !wallet.is_active(now) {
            return Err(OutgoingPaymentError::InactiveWalletAddress);
        }
        let quote = self
            .store
            .get_quote(params.quote_id)
            .await
            .ok_or(OutgoingPaymentError::UnknownQuote)?;
        if quote.wallet_address_id != wallet.id || quote.is_expired(now) {
            return Err(OutgoingPaymentError::InvalidQuote);
        }
        let receiver = self
            .resolver
            .resolve(&quote.receiver)
            .await
            .ok_or(OutgoingPaymentError::InvalidQuote)?;

        // Creations sharing a grant serialize on the grant row
        let _grant_lock = match &params.grant {
            Some(grant) => Some(self.store.lock_grant(grant.id).await),
            None => None,
        };
        if let Some(grant) = &params.grant {
            if let Some(limits) = &grant.limits {
                self.check_grant_limits(grant.id, limits, &quote, now)
                    .await?;
            }
        }

        let mut payment = OutgoingPayment::new(
            quote.id,
            wallet.id,
            params.grant.as_ref().map(|grant| grant.id),
            params.metadata,
            params.client,
        );
        payment.peer_id = self
            .store
            .route_to_peer(&receiver.ilp_address)
            .await
            .map(|peer| peer.id);

        match self.store.insert_outgoing_payment(payment.clone()).await {
            Ok(()) => {}
            Err(StoreError::DuplicateQuote) => return Err(OutgoingPaymentError::InvalidQuote),
            Err(err) => {
                warn!("Error inserting outgoing payment: {}", err);
                return Err(OutgoingPaymentError::InvalidQuote);
            }
        }

        // The payment's own ledger account holds the funded amount
        match self
            .ledger
            .create_liquidity_account(LiquidityAccount::new(
                payment.id,
                quote.asset_id,
                AccountKind::Outgoing,
            ))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
            Err(err) => warn!("Error creating payment account {}: {}", payment.id, err),
        }

        self.store
            .enqueue_event(
                WebhookEvent::new(
                    WebhookEventType::OutgoingPaymentCreated,
                    payment_event_data(&payment, &quote),
                ),
            )
            .await
            .ok();
        info!("Created outgoing payment {} in Funding", payment.id);
        Ok(payment)
    }

    async fn check_grant_limits(
        &self,
        grant_id: Uuid,
        limits: &GrantLimits,
        quote: &Quote,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), OutgoingPaymentError> {
        if let Some(ref receiver) = limits.receiver {
            if !quote.receiver.starts_with(receiver.as_str()) {
                return Err(OutgoingPaymentError::InsufficientGrant);
            }
        }
        let cycle = match &limits.interval {
            Some(interval) => Some(
                interval
                    .current_cycle(now)
                    .ok_or(OutgoingPaymentError::InsufficientGrant)?,
            ),
            None => None,
        };
        if let Some(ref debit_limit) = limits.debit_amount {
            if !debit_limit.same_asset(&quote.debit_amount) {
                return Err(OutgoingPaymentError::InsufficientGrant);
            }
        }
        if let Some(ref receive_limit) = limits.receive_amount {
            if !receive_limit.same_asset(&quote.receive_amount) {
                return Err(OutgoingPaymentError::InsufficientGrant);
            }
        }
        if limits.debit_amount.is_none() && limits.receive_amount.is_none() {
            return Ok(());
        }

        // Prior payments inside the current cycle consume the budget; a
        // Failed payment only consumed what it actually sent
        let mut spent_debit: u64 = 0;
        let mut spent_receive: u64 = 0;
        for prior in self.store.outgoing_payments_for_grant(grant_id).await {
            if let Some((cycle_start, cycle_end)) = cycle {
                if prior.created_at < cycle_start || prior.created_at >= cycle_end {
                    continue;
                }
            }
            let prior_quote = match self.store.get_quote(prior.quote_id).await {
                Some(quote) => quote,
                None => continue,
            };
            if prior.state == OutgoingPaymentState::Failed {
                spent_debit += prior.sent_amount;
                spent_receive += estimate_delivered(&prior_quote, prior.sent_amount);
            } else {
                spent_debit += prior_quote.debit_amount.value;
                spent_receive += prior_quote.receive_amount.value;
            }
        }

        if let Some(ref debit_limit) = limits.debit_amount {
            let remaining = debit_limit.value.saturating_sub(spent_debit);
            if quote.debit_amount.value > remaining {
                return Err(OutgoingPaymentError::InsufficientGrant);
            }
        }
        if let Some(ref receive_limit) = limits.receive_amount {
            let remaining = receive_limit.value.saturating_sub(spent_receive);
            if quote.receive_amount.value > remaining {
                return Err(OutgoingPaymentError::InsufficientGrant);
            }
        }
        Ok(())
    }

    /// Funding → Sending, atomic with the ledger deposit of the quoted
    /// amount into the payment's account.
    pub async fn fund(&self, params: FundParams) -> Result<OutgoingPayment, OutgoingPaymentError> {
        let mut payment = self
            .store
            .get_outgoing_payment(params.id)
            .await
            .ok_or(OutgoingPaymentError::UnknownPayment)?;
        if payment.state != OutgoingPaymentState::Funding {
            return Err(OutgoingPaymentError::WrongState);
        }
        let quote = self
            .store
            .get_quote(payment.quote_id)
            .await
            .ok_or(OutgoingPaymentError::UnknownPayment)?;
        if params.amount != quote.debit_amount.value {
            return Err(OutgoingPaymentError::InvalidAmount);
        }

        match self
            .ledger
            .create_deposit(Deposit {
                id: params.transfer_id,
                account_id: payment.id,
                amount: params.amount,
            })
            .await
        {
            // a replayed deposit already funded the account
            Ok(()) | Err(LedgerError::TransferExists) => {}
            Err(LedgerError::InvalidAmount) => return Err(OutgoingPaymentError::InvalidAmount),
            Err(err) => {
                warn!("Error funding payment {}: {}", payment.id, err);
                return Err(OutgoingPaymentError::UnknownPayment);
            }
        }

        payment.state = OutgoingPaymentState::Sending;
        payment.process_at = Some(Utc::now());
        self.store
            .update_outgoing_payment(payment.clone())
            .await
            .map_err(|_| OutgoingPaymentError::UnknownPayment)?;
        info!("Funded outgoing payment {}, now Sending", payment.id);
        Ok(payment)
    }

    /// Claims one due payment, drives one pay step, releases the claim.
    /// Returns the payment id if one was processed.
    pub async fn process_next(&self) -> Option<Uuid> {
        let payment = self.store.claim_due_outgoing_payment(Utc::now()).await?;
        let id = payment.id;
        self.pay_step(payment).await;
        self.store.release_outgoing_payment(id).await;
        Some(id)
    }

    async fn pay_step(&self, mut payment: OutgoingPayment) {
        let quote = match self.store.get_quote(payment.quote_id).await {
            Some(quote) => quote,
            None => {
                self.fail(payment, None, "UnknownQuote").await;
                return;
            }
        };
        let wallet = match self.store.get_wallet_address(payment.wallet_address_id).await {
            Some(wallet) => wallet,
            None => {
                self.fail(payment, Some(&quote), "UnknownWalletAddress").await;
                return;
            }
        };
        let asset = match self.store.get_asset(quote.asset_id).await {
            Some(asset) => asset,
            None => {
                self.fail(payment, Some(&quote), "SourceAssetConflict").await;
                return;
            }
        };
        if wallet.asset_id != quote.asset_id {
            self.fail(payment, Some(&quote), "SourceAssetConflict").await;
            return;
        }

        let receiver = match self.resolver.resolve(&quote.receiver).await {
            Some(receiver) => receiver,
            None => {
                // the receiver may come back; retry like a dropped connection
                self.retry(payment, &quote, PaymentError::EstablishmentFailed)
                    .await;
                return;
            }
        };

        let sendable_total = quote.debit_amount.value.saturating_sub(quote.fee);
        let debit_remaining = sendable_total.saturating_sub(payment.sent_amount);
        let delivered_estimate = estimate_delivered(&quote, payment.sent_amount);
        let receive_remaining = quote
            .receive_amount
            .value
            .saturating_sub(delivered_estimate);
        if debit_remaining == 0 || receive_remaining == 0 {
            self.complete(payment, &quote).await;
            return;
        }

        let plan = PaymentPlan {
            source_address: self.config.source_address.clone(),
            destination: receiver.ilp_address.clone(),
            shared_secret: receiver.shared_secret,
            debit_amount: debit_remaining,
            receive_amount: receive_remaining,
            max_packet_amount: quote.max_packet_amount,
            min_exchange_rate: quote.min_exchange_rate,
            expected_asset: Some((receiver.asset_code.clone(), receiver.asset_scale)),
        };
        let sender = self.senders.sender_for(&payment, &asset);
        let result = pay(sender.as_ref(), &plan).await;

        payment.sent_amount += result.outcome.amount_sent;
        debug!(
            "Pay step for {} sent {} (total {}), delivered {}",
            payment.id, result.outcome.amount_sent, payment.sent_amount, result.outcome.amount_delivered
        );

        match result.error {
            None => self.complete(payment, &quote).await,
            Some(error) if error.is_retryable() => self.retry(payment, &quote, error).await,
            Some(error) => {
                self.fail(payment, Some(&quote), &error.to_string()).await;
            }
        }
    }

    async fn retry(&self, mut payment: OutgoingPayment, quote: &Quote, error: PaymentError) {
        payment.state_attempts += 1;
        if payment.state_attempts >= self.config.max_attempts {
            warn!(
                "Payment {} exhausted its {} attempts: {}",
                payment.id, self.config.max_attempts, error
            );
            self.fail(payment, Some(quote), &error.to_string()).await;
            return;
        }
        let backoff = self.config.retry_backoff * 2i32.pow(payment.state_attempts);
        payment.process_at = Some(Utc::now() + backoff);
        debug!(
            "Payment {} attempt {} failed ({}), retrying in {}s",
            payment.id,
            payment.state_attempts,
            error,
            backoff.num_seconds()
        );
        self.store.update_outgoing_payment(payment).await.ok();
    }

    async fn complete(&self, mut payment: OutgoingPayment, quote: &Quote) {
        payment.state = OutgoingPaymentState::Completed;
        payment.process_at = None;
        payment.error = None;
        self.finish(payment, quote, WebhookEventType::OutgoingPaymentCompleted)
            .await;
    }

    async fn fail(&self, mut payment: OutgoingPayment, quote: Option<&Quote>, error: &str) {
        payment.state = OutgoingPaymentState::Failed;
        payment.process_at = None;
        payment.error = Some(error.to_string());
        warn!("Payment {} failed: {}", payment.id, error);
        match quote {
            Some(quote) => {
                self.finish(payment, quote, WebhookEventType::OutgoingPaymentFailed)
                    .await
            }
            None => {
                self.store.update_outgoing_payment(payment).await.ok();
            }
        }
    }

    /// Terminal bookkeeping: persist the state, and hand the residual funded
    /// balance back through a withdrawal-bearing webhook event.
    async fn finish(&self, payment: OutgoingPayment, quote: &Quote, kind: WebhookEventType) {
        let residual = quote.debit_amount.value.saturating_sub(payment.sent_amount);
        self.store.update_outgoing_payment(payment.clone()).await.ok();

        let mut event = WebhookEvent::new(kind, payment_event_data(&payment, quote));
        if residual > 0 {
            event = event.with_withdrawal(EventWithdrawal {
                account_id: payment.id,
                asset_id: quote.asset_id,
                amount: residual,
            });
        }
        self.store.enqueue_event(event).await.ok();
        info!(
            "Payment {} finished in {:?} with sent amount {}",
            payment.id, payment.state, payment.sent_amount
        );
    }
}

/// Destination units a partial send is counted as, for grant accounting and
/// resumed sends.
fn estimate_delivered(quote: &Quote, sent: u64) -> u64 {
    if quote.debit_amount.value == 0 {
        return 0;
    }
    let ratio = quote.receive_amount.value as f64 / quote.debit_amount.value as f64;
    (sent as f64 * ratio).floor() as u64
}

fn payment_event_data(payment: &OutgoingPayment, quote: &Quote) -> serde_json::Value {
    serde_json::json!({
        "id": payment.id,
        "walletAddressId": payment.wallet_address_id,
        "state": payment.state,
        "receiver": quote.receiver,
        "debitAmount": quote.debit_amount,
        "receiveAmount": quote.receive_amount,
        "sentAmount": Amount::new(
            payment.sent_amount,
            quote.debit_amount.asset_code.clone(),
            quote.debit_amount.asset_scale,
        ),
        "metadata": payment.metadata,
    })
}
