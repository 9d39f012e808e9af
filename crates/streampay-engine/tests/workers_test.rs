//! Timer-driven workers: incoming-payment expiry, web-monetization sweeps,
//! and the credit hooks that schedule them.

mod common;

use chrono::{Duration, Utc};
use common::*;
use streampay_engine::{IncomingPaymentExpiryWorker, WalletAddressWorker};
use streampay_ledger::{AccountKind, Deposit, Ledger, LiquidityAccount};
use streampay_payments::store::{EventStore, IncomingPaymentStore, WalletAddressStore};
use streampay_payments::{IncomingPayment, IncomingPaymentState, WebhookEventType};
use uuid::Uuid;

#[tokio::test]
async fn overdue_incoming_payments_expire_with_an_event() {
    let node = test_node(1.0, 0.0).await;
    let usd = node.create_asset("USD", 2).await;
    let wallet = node.create_wallet("alice", &usd).await;

    let mut payment = IncomingPayment::new(
        wallet.id,
        usd.id,
        Some(100),
        Utc::now() - Duration::seconds(1),
        None,
    );
    payment.received_amount = 30;
    payment.state = IncomingPaymentState::Processing;
    node.store
        .insert_incoming_payment(payment.clone())
        .await
        .unwrap();

    IncomingPaymentExpiryWorker::new(node.store.clone()).tick().await;

    let expired = node.store.get_incoming_payment(payment.id).await.unwrap();
    assert_eq!(expired.state, IncomingPaymentState::Expired);
    assert_eq!(expired.connection_id, None);

    let event = node
        .store
        .events_due(Utc::now(), 50)
        .await
        .into_iter()
        .find(|event| event.kind == WebhookEventType::IncomingPaymentExpired)
        .expect("expiry event");
    // the partial receipt is handed back for withdrawal
    assert_eq!(event.withdrawal.unwrap().amount, 30);
}

#[tokio::test]
async fn credits_schedule_a_web_monetization_sweep() {
    let node = test_node(1.0, 0.0).await;
    let usd = node.create_asset("USD", 2).await;
    let wallet = node.create_wallet("alice", &usd).await;

    // the account exists once the first packet is credited
    node.ledger
        .create_liquidity_account(LiquidityAccount::new(
            wallet.id,
            usd.id,
            AccountKind::WebMonetization,
        ))
        .await
        .unwrap();
    node.ledger
        .create_deposit(Deposit {
            id: Uuid::new_v4(),
            account_id: wallet.id,
            amount: 45,
        })
        .await
        .unwrap();

    // the credit hook scheduled the sweep
    let scheduled = node.store.get_wallet_address(wallet.id).await.unwrap();
    assert!(scheduled.process_at.is_some());

    WalletAddressWorker::new(node.store.clone(), node.ledger.clone())
        .tick()
        .await;

    let swept = node.store.get_wallet_address(wallet.id).await.unwrap();
    assert_eq!(swept.total_events_amount, 45);
    assert_eq!(swept.process_at, None);

    let event = node
        .store
        .events_due(Utc::now(), 50)
        .await
        .into_iter()
        .find(|event| event.kind == WebhookEventType::WalletAddressWebMonetization)
        .expect("web monetization event");
    let withdrawal = event.withdrawal.unwrap();
    assert_eq!(withdrawal.amount, 45);
    assert_eq!(withdrawal.account_id, wallet.id);

    // a second sweep with no new credits emits nothing further
    WalletAddressWorker::new(node.store.clone(), node.ledger.clone())
        .tick()
        .await;
    assert_eq!(
        node.store
            .get_wallet_address(wallet.id)
            .await
            .unwrap()
            .total_events_amount,
        45
    );
}

#[tokio::test]
async fn sweeps_wait_for_the_withdrawal_threshold() {
    let node = test_node(1.0, 0.0).await;
    let mut usd = node.create_asset("USD", 2).await;
    usd.withdrawal_threshold = Some(100);
    use streampay_payments::store::AssetStore;
    node.store.update_asset(usd.clone()).await.unwrap();
    let wallet = node.create_wallet("alice", &usd).await;

    node.ledger
        .create_liquidity_account(LiquidityAccount::new(
            wallet.id,
            usd.id,
            AccountKind::WebMonetization,
        ))
        .await
        .unwrap();
    node.ledger
        .create_deposit(Deposit {
            id: Uuid::new_v4(),
            account_id: wallet.id,
            amount: 45,
        })
        .await
        .unwrap();

    WalletAddressWorker::new(node.store.clone(), node.ledger.clone())
        .tick()
        .await;

    // below the threshold nothing is swept, the delta keeps accruing
    let wallet_after = node.store.get_wallet_address(wallet.id).await.unwrap();
    assert_eq!(wallet_after.total_events_amount, 0);
    assert!(node
        .store
        .events_due(Utc::now(), 50)
        .await
        .into_iter()
        .all(|event| event.kind != WebhookEventType::WalletAddressWebMonetization));
}
