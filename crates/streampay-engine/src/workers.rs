//! Background worker loops. Each worker exposes a `tick()` that does one
//! round of work (what the tests drive) and a `spawn()` that runs it on an
//! interval until stopped; an error tick never kills the loop.

use crate::lifecycle::{OutgoingPaymentService, PaymentStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use streampay_ledger::Ledger;
use streampay_payments::store::{
    AssetStore, EventStore, IncomingPaymentStore, WalletAddressStore,
};
use streampay_payments::{Amount, EventWithdrawal, WebhookEvent, WebhookEventType};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

const WORK_BATCH: usize = 20;

/// Stops the spawned loop when dropped or told to.
pub struct WorkerHandle {
    stop: oneshot::Sender<()>,
}

impl WorkerHandle {
    pub fn stop(self) {
        let _ = self.stop.send(());
    }
}

fn spawn_loop<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (stop, mut stopped) = oneshot::channel::<()>();
    tokio::spawn(async move {
        info!("Starting {} worker (interval {:?})", name, interval);
        let mut timer = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = timer.tick() => tick().await,
                _ = &mut stopped => {
                    info!("Stopping {} worker", name);
                    return;
                }
            }
        }
    });
    WorkerHandle { stop }
}

/// Polls for due outgoing payments and drives one pay step per claim.
pub struct OutgoingPaymentWorker<S> {
    service: Arc<OutgoingPaymentService<S>>,
}

impl<S: PaymentStore> OutgoingPaymentWorker<S> {
    pub fn new(service: Arc<OutgoingPaymentService<S>>) -> Self {
        OutgoingPaymentWorker { service }
    }

    /// Processes claims until none are due.
    pub async fn tick(&self) {
        while let Some(id) = self.service.process_next().await {
            debug!("Processed outgoing payment {}", id);
        }
    }

    pub fn spawn(self, interval: Duration) -> WorkerHandle {
        spawn_loop("outgoing-payment", interval, move || {
            let service = self.service.clone();
            async move {
                while let Some(id) = service.process_next().await {
                    debug!("Processed outgoing payment {}", id);
                }
            }
        })
    }
}

/// Expires Pending/Processing incoming payments past their deadline.
pub struct IncomingPaymentExpiryWorker<S> {
    store: S,
}

impl<S> IncomingPaymentExpiryWorker<S>
where
    S: IncomingPaymentStore + AssetStore + EventStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        IncomingPaymentExpiryWorker { store }
    }

    pub async fn tick(&self) {
        let now = Utc::now();
        for mut payment in self.store.incoming_payments_due_expiry(now, WORK_BATCH).await {
            payment.expire(now);
            if self
                .store
                .update_incoming_payment(payment.clone())
                .await
                .is_err()
            {
                warn!("Unable to expire incoming payment {}", payment.id);
                continue;
            }
            let mut event = WebhookEvent::new(
                WebhookEventType::IncomingPaymentExpired,
                serde_json::json!({
                    "id": payment.id,
                    "walletAddressId": payment.wallet_address_id,
                }),
            );
            if payment.received_amount > 0 {
                event = event.with_withdrawal(EventWithdrawal {
                    account_id: payment.id,
                    asset_id: payment.asset_id,
                    amount: payment.received_amount,
                });
            }
            self.store.enqueue_event(event).await.ok();
            debug!("Expired incoming payment {}", payment.id);
        }
    }

    pub fn spawn(self, interval: Duration) -> WorkerHandle {
        spawn_loop("incoming-expiry", interval, move || {
            let worker = IncomingPaymentExpiryWorker {
                store: self.store.clone(),
            };
            async move { worker.tick().await }
        })
    }
}

/// Sweeps accumulated web-monetization credits into withdrawal events.
pub struct WalletAddressWorker<S> {
    store: S,
    ledger: Arc<dyn Ledger>,
}

impl<S> WalletAddressWorker<S>
where
    S: WalletAddressStore + AssetStore + EventStore + Clone + Send + Sync + 'static,
{
    pub fn new(store: S, ledger: Arc<dyn Ledger>) -> Self {
        WalletAddressWorker { store, ledger }
    }

    pub async fn tick(&self) {
        let now = Utc::now();
        for mut wallet in self.store.wallet_addresses_due(now, WORK_BATCH).await {
            let total_received = self
                .ledger
                .get_total_received(wallet.id)
                .await
                .unwrap_or(wallet.total_events_amount);
            let delta = total_received.saturating_sub(wallet.total_events_amount);
            let asset = self.store.get_asset(wallet.asset_id).await;
            let threshold = asset
                .as_ref()
                .and_then(|asset| asset.withdrawal_threshold)
                .unwrap_or(1);

            wallet.process_at = None;
            if delta >= threshold.max(1) {
                let amount = asset
                    .map(|asset| Amount::new(delta, asset.code, asset.scale));
                let event = WebhookEvent::new(
                    WebhookEventType::WalletAddressWebMonetization,
                    serde_json::json!({
                        "walletAddressId": wallet.id,
                        "amount": amount,
                    }),
                )
                .with_withdrawal(EventWithdrawal {
                    account_id: wallet.id,
                    asset_id: wallet.asset_id,
                    amount: delta,
                });
                self.store.enqueue_event(event).await.ok();
                wallet.total_events_amount += delta;
                debug!(
                    "Swept {} web-monetization units from wallet address {}",
                    delta, wallet.id
                );
            }
            self.store.update_wallet_address(wallet).await.ok();
        }
    }

    pub fn spawn(self, interval: Duration) -> WorkerHandle {
        spawn_loop("wallet-address", interval, move || {
            let worker = WalletAddressWorker {
                store: self.store.clone(),
                ledger: self.ledger.clone(),
            };
            async move { worker.tick().await }
        })
    }
}
