//! The quote engine: prices a payment from a source wallet address to a
//! resolved receiver and fixes the terms an outgoing payment must honor.

use crate::rates::RateProvider;
use crate::receiver::{Receiver, ReceiverResolver};
use crate::store::{AssetStore, QuoteStore, WalletAddressStore};
use crate::{Amount, FeeType};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Packet size is only narrowed later by the peer's cap.
const NETWORK_MAX_PACKET_AMOUNT: u64 = i64::max_value() as u64;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QuoteError {
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    #[error("wallet address is deactivated")]
    InactiveWalletAddress,
    #[error("invalid amount")]
    InvalidAmount,
    #[error("invalid receiver")]
    InvalidReceiver,
    #[error("exchange rate probe failed")]
    RateProbeFailed,
}

/// A time-bounded commitment of source and destination amounts. Single-use:
/// consuming it twice is refused at outgoing-payment creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub id: Uuid,
    pub wallet_address_id: Uuid,
    pub asset_id: Uuid,
    pub receiver: String,
    pub debit_amount: Amount,
    pub receive_amount: Amount,
    /// The slice of `debit_amount` that is operator fee, not sent onward
    pub fee: u64,
    pub max_packet_amount: u64,
    /// Destination smallest-units per source smallest-unit, floor-enforced
    pub min_exchange_rate: f64,
    pub low_estimated_exchange_rate: f64,
    /// Exclusive upper bound on the estimated rate
    pub high_estimated_exchange_rate: f64,
    pub expires_at: DateTime<Utc>,
    pub client: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Quote {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone)]
pub struct CreateQuoteParams {
    pub wallet_address_id: Uuid,
    pub receiver: String,
    pub debit_amount: Option<Amount>,
    pub receive_amount: Option<Amount>,
    pub client: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct QuoteConfig {
    /// Tolerated rate worsening, 0..1
    pub slippage: f64,
    pub lifespan: Duration,
}

pub struct QuoteService<S, R: ?Sized, P: ?Sized> {
    store: S,
    resolver: Arc<R>,
    rates: Arc<P>,
    config: QuoteConfig,
}

impl<S, R, P> QuoteService<S, R, P>
where
    S: WalletAddressStore + AssetStore + QuoteStore + Clone,
    R: ReceiverResolver + ?Sized,
    P: RateProvider + ?Sized,
{
    pub fn new(store: S, resolver: Arc<R>, rates: Arc<P>, config: QuoteConfig) -> Self {
        QuoteService {
            store,
            resolver,
            rates,
            config,
        }
    }

    pub async fn create(&self, params: CreateQuoteParams) -> Result<Quote, QuoteError> {
        if params.debit_amount.is_some() && params.receive_amount.is_some() {
            return Err(QuoteError::InvalidAmount);
        }
        let now = Utc::now();

        let wallet = self
            .store
            .get_wallet_address(params.wallet_address_id)
            .await
            .ok_or(QuoteError::UnknownWalletAddress)?;
        if !wallet.is_active(now) {
            return Err(QuoteError::InactiveWalletAddress);
        }
        let asset = self
            .store
            .get_asset(wallet.asset_id)
            .await
            .ok_or(QuoteError::UnknownWalletAddress)?;

        let receiver = self
            .resolver
            .resolve(&params.receiver)
            .await
            .ok_or(QuoteError::InvalidReceiver)?;

        if let Some(ref debit) = params.debit_amount {
            if debit.value == 0 || debit.asset_code != asset.code || debit.asset_scale != asset.scale
            {
                return Err(QuoteError::InvalidAmount);
            }
        }
        if let Some(ref receive) = params.receive_amount {
            if receive.value == 0
                || receive.asset_code != receiver.asset_code
                || receive.asset_scale != receiver.asset_scale
            {
                return Err(QuoteError::InvalidAmount);
            }
        }

        // Rate in destination smallest-units per source smallest-unit
        let code_rate = self
            .rates
            .rate(&asset.code, &receiver.asset_code)
            .await
            .map_err(|_| QuoteError::RateProbeFailed)?;
        let scale_shift = i32::from(receiver.asset_scale) - i32::from(asset.scale);
        let low_rate = code_rate * 10f64.powi(scale_shift);
        if !low_rate.is_finite() || low_rate <= 0.0 {
            return Err(QuoteError::RateProbeFailed);
        }
        let high_rate = f64::from_bits(low_rate.to_bits() + 1);
        let min_rate = low_rate * (1.0 - self.config.slippage);

        let sending_fee = self.store.get_fee(asset.id, FeeType::Sending).await;

        let (debit_value, receive_value, fee) = match (&params.debit_amount, &params.receive_amount)
        {
            // Fixed source: fees come out of what converts onward
            (Some(debit), None) => {
                let fee = sending_fee
                    .map(|schedule| schedule.charge(debit.value))
                    .unwrap_or(0);
                let sendable = debit.value.saturating_sub(fee);
                let receive = (sendable as f64 * low_rate).floor() as u64;
                (debit.value, receive, fee)
            }
            // Fixed delivery: fees inflate what the sender is debited
            (None, receive) => {
                let target = match receive {
                    Some(amount) => amount.value,
                    None => receiver
                        .remaining_receivable()
                        .ok_or(QuoteError::InvalidAmount)?,
                };
                if target == 0 {
                    return Err(QuoteError::InvalidAmount);
                }
                let base_debit = (target as f64 / low_rate).ceil() as u64;
                let fee = sending_fee
                    .map(|schedule| schedule.charge(base_debit))
                    .unwrap_or(0);
                (base_debit + fee, target, fee)
            }
            (Some(_), Some(_)) => unreachable!("rejected above"),
        };

        if receive_value == 0 || debit_value == 0 {
            return Err(QuoteError::InvalidAmount);
        }
        if let Some(remaining) = receiver.remaining_receivable() {
            if receive_value > remaining {
                return Err(QuoteError::InvalidAmount);
            }
        }

        let mut expires_at = now + self.config.lifespan;
        if let Some(receiver_expiry) = receiver.expires_at {
            expires_at = expires_at.min(receiver_expiry);
        }

        let quote = Quote {
            id: Uuid::new_v4(),
            wallet_address_id: wallet.id,
            asset_id: asset.id,
            receiver: receiver.url.clone(),
            debit_amount: Amount::new(debit_value, asset.code.clone(), asset.scale),
            receive_amount: Amount::new(
                receive_value,
                receiver.asset_code.clone(),
                receiver.asset_scale,
            ),
            fee,
            max_packet_amount: NETWORK_MAX_PACKET_AMOUNT,
            min_exchange_rate: min_rate,
            low_estimated_exchange_rate: low_rate,
            high_estimated_exchange_rate: high_rate,
            expires_at,
            client: params.client,
            created_at: now,
        };
        debug!(
            "Quoted {} {} -> {} {} (rate {}, fee {})",
            quote.debit_amount.value,
            quote.debit_amount.asset_code,
            quote.receive_amount.value,
            quote.receive_amount.asset_code,
            low_rate,
            fee
        );
        self.store
            .insert_quote(quote.clone())
            .await
            .map_err(|_| QuoteError::InvalidAmount)?;
        Ok(quote)
    }

    /// Convenience used by the lifecycle engine when re-reading terms.
    pub async fn get(&self, id: Uuid) -> Option<Quote> {
        self.store.get_quote(id).await
    }
}

/// Resolver plumbing for tests and for callers that already hold a receiver.
pub struct FixedReceiver(pub Receiver);

#[async_trait::async_trait]
impl ReceiverResolver for FixedReceiver {
    async fn resolve(&self, _url: &str) -> Option<Receiver> {
        Some(self.0.clone())
    }

    async fn create_receiver(
        &self,
        _wallet_address_url: &str,
        _incoming_amount: Option<Amount>,
        _expires_at: Option<DateTime<Utc>>,
        _metadata: Option<serde_json::Value>,
    ) -> Result<Receiver, crate::receiver::ReceiverError> {
        Err(crate::receiver::ReceiverError::InvalidReceiver)
    }
}
