//! Credit hooks: what happens when money settles on a local account.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use streampay_ledger::{AccountKind, CreditHook, HookRegistry};
use streampay_payments::store::{AssetStore, EventStore, IncomingPaymentStore, WalletAddressStore};
use streampay_payments::{
    Amount, EventWithdrawal, IncomingPaymentState, WebhookEvent, WebhookEventType,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Advances an incoming payment when its account is credited: Pending →
/// Processing on first money, Completed once the target amount is in, with
/// the completion webhook carrying the withdrawal for the received total.
pub struct IncomingPaymentHook<S> {
    store: S,
}

impl<S> IncomingPaymentHook<S> {
    pub fn new(store: S) -> Self {
        IncomingPaymentHook { store }
    }
}

#[async_trait]
impl<S> CreditHook for IncomingPaymentHook<S>
where
    S: IncomingPaymentStore + AssetStore + EventStore + Send + Sync,
{
    async fn on_credit(&self, account_id: Uuid, total_received: u64) {
        let mut payment = match self.store.get_incoming_payment(account_id).await {
            Some(payment) => payment,
            None => {
                warn!("Credit on unknown incoming payment account {}", account_id);
                return;
            }
        };
        let now = Utc::now();
        if !payment.apply_credit(total_received, now) {
            return;
        }
        debug!(
            "Incoming payment {} received {} (state {:?})",
            payment.id, total_received, payment.state
        );
        if self.store.update_incoming_payment(payment.clone()).await.is_err() {
            warn!("Unable to persist credit on incoming payment {}", payment.id);
            return;
        }
        if payment.state == IncomingPaymentState::Completed {
            let asset_code = self
                .store
                .get_asset(payment.asset_id)
                .await
                .map(|asset| (asset.code, asset.scale));
            let received = asset_code
                .map(|(code, scale)| Amount::new(payment.received_amount, code, scale));
            let event = WebhookEvent::new(
                WebhookEventType::IncomingPaymentCompleted,
                serde_json::json!({
                    "id": payment.id,
                    "walletAddressId": payment.wallet_address_id,
                    "receivedAmount": received,
                    "metadata": payment.metadata,
                }),
            )
            .with_withdrawal(EventWithdrawal {
                account_id: payment.id,
                asset_id: payment.asset_id,
                amount: payment.received_amount,
            });
            self.store.enqueue_event(event).await.ok();
        }
    }
}

/// Schedules a throttled web-monetization sweep when a wallet address's
/// account is credited.
pub struct WebMonetizationHook<S> {
    store: S,
    throttle_delay: Duration,
}

impl<S> WebMonetizationHook<S> {
    pub fn new(store: S, throttle_delay: Duration) -> Self {
        WebMonetizationHook {
            store,
            throttle_delay,
        }
    }
}

#[async_trait]
impl<S> CreditHook for WebMonetizationHook<S>
where
    S: WalletAddressStore + Send + Sync,
{
    async fn on_credit(&self, account_id: Uuid, _total_received: u64) {
        let mut wallet = match self.store.get_wallet_address(account_id).await {
            Some(wallet) => wallet,
            None => {
                warn!("Credit on unknown wallet address account {}", account_id);
                return;
            }
        };
        if wallet.process_at.is_none() {
            wallet.process_at = Some(Utc::now() + self.throttle_delay);
            self.store.update_wallet_address(wallet).await.ok();
        }
    }
}

/// Wires both hooks into a ledger's registry.
pub fn register_credit_hooks<S>(registry: &HookRegistry, store: S, throttle_delay: Duration)
where
    S: IncomingPaymentStore
        + WalletAddressStore
        + AssetStore
        + EventStore
        + Clone
        + Send
        + Sync
        + 'static,
{
    registry.register(
        AccountKind::Incoming,
        Arc::new(IncomingPaymentHook::new(store.clone())),
    );
    registry.register(
        AccountKind::WebMonetization,
        Arc::new(WebMonetizationHook::new(store, throttle_delay)),
    );
}
