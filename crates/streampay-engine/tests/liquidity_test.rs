//! Liquidity operations: deposits, two-phase withdrawals, event-bound
//! liquidity, and idempotency-key replay.

mod common;

use chrono::Utc;
use common::*;
use secrecy::SecretString;
use std::str::FromStr;
use std::sync::Arc;
use streampay_engine::{
    CreateOutgoingPaymentParams, LiquidityOp, LiquidityService, OutgoingPaymentWorker,
};
use streampay_packet::Address;
use streampay_payments::store::{EventStore, OutgoingPaymentStore, PeerStore, QuoteStore};
use streampay_payments::{
    Amount, OutgoingPaymentState, Peer, PeerHttp, Quote, Receiver, WebhookEventType,
};
use uuid::Uuid;

async fn liquidity_node() -> (TestNode, LiquidityService<streampay_payments::store::InMemoryStore>)
{
    let shared_secret = [7u8; 32];
    let receiver = Receiver {
        url: "https://faraway.example/carol/incoming-payments/1".to_string(),
        asset_code: "USD".to_string(),
        asset_scale: 2,
        ilp_address: Address::from_str("test.faraway.carol").unwrap(),
        shared_secret,
        incoming_amount: None,
        received_amount: None,
        expires_at: None,
    };
    let node = test_node_with_resolver_and_senders(
        1.0,
        0.0,
        Some(Arc::new(streampay_payments::quote::FixedReceiver(receiver))),
        None,
    )
    .await;
    let service = LiquidityService::new(
        node.store.clone(),
        node.ledger.clone(),
        node.payments.clone(),
    );
    (node, service)
}

async fn create_peer(node: &TestNode, asset_id: Uuid) -> Peer {
    use streampay_ledger::{AccountKind, Ledger, LiquidityAccount};
    let peer = Peer {
        id: Uuid::new_v4(),
        asset_id,
        static_ilp_address: Address::from_str("test.peer-a").unwrap(),
        http: PeerHttp {
            incoming_token: SecretString::new("in".to_string()),
            outgoing_token: SecretString::new("out".to_string()),
            outgoing_endpoint: "http://peer-a.example/ilp".to_string(),
        },
        max_packet_amount: None,
        packets_per_second: None,
        amount_per_second: None,
        max_hold_time: std::time::Duration::from_secs(30),
        liquidity_threshold: None,
        created_at: Utc::now(),
    };
    node.store.insert_peer(peer.clone()).await.unwrap();
    node.ledger
        .create_liquidity_account(LiquidityAccount::new(peer.id, asset_id, AccountKind::Peer))
        .await
        .unwrap();
    peer
}

#[tokio::test]
async fn peer_withdrawal_lifecycle() {
    let (node, service) = liquidity_node().await;
    let usd = node.create_asset("USD", 2).await;
    let peer = create_peer(&node, usd.id).await;

    let response = service
        .execute(
            LiquidityOp::AddPeerLiquidity {
                id: Uuid::new_v4(),
                peer_id: peer.id,
                amount: 100,
            },
            None,
        )
        .await;
    assert!(response.success, "{:?}", response);

    let withdrawal_id = Uuid::new_v4();
    let response = service
        .execute(
            LiquidityOp::CreatePeerLiquidityWithdrawal {
                id: withdrawal_id,
                peer_id: peer.id,
                amount: 10,
                timeout_seconds: Some(10),
            },
            None,
        )
        .await;
    assert!(response.success);

    let response = service
        .execute(LiquidityOp::PostLiquidityWithdrawal { withdrawal_id }, None)
        .await;
    assert!(response.success);

    // posting twice, or voiding after the post, both report the posted state
    let repost = service
        .execute(LiquidityOp::PostLiquidityWithdrawal { withdrawal_id }, None)
        .await;
    assert_eq!(repost.code, "409");
    assert_eq!(repost.error.as_deref(), Some("AlreadyPosted"));
    let void = service
        .execute(LiquidityOp::VoidLiquidityWithdrawal { withdrawal_id }, None)
        .await;
    assert_eq!(void.code, "409");
    assert_eq!(void.error.as_deref(), Some("AlreadyPosted"));

    use streampay_ledger::Ledger;
    assert_eq!(node.ledger.get_balance(peer.id).await.unwrap(), 90);
}

#[tokio::test]
async fn withdrawal_boundary_is_the_exact_balance() {
    let (node, service) = liquidity_node().await;
    let usd = node.create_asset("USD", 2).await;
    let peer = create_peer(&node, usd.id).await;
    service
        .execute(
            LiquidityOp::AddPeerLiquidity {
                id: Uuid::new_v4(),
                peer_id: peer.id,
                amount: 100,
            },
            None,
        )
        .await;

    let over = service
        .execute(
            LiquidityOp::CreatePeerLiquidityWithdrawal {
                id: Uuid::new_v4(),
                peer_id: peer.id,
                amount: 101,
                timeout_seconds: None,
            },
            None,
        )
        .await;
    assert_eq!(over.code, "403");
    assert_eq!(over.error.as_deref(), Some("InsufficientBalance"));

    let exact = service
        .execute(
            LiquidityOp::CreatePeerLiquidityWithdrawal {
                id: Uuid::new_v4(),
                peer_id: peer.id,
                amount: 100,
                timeout_seconds: None,
            },
            None,
        )
        .await;
    assert!(exact.success);
}

#[tokio::test]
async fn unknown_entities_are_404() {
    let (_node, service) = liquidity_node().await;
    let response = service
        .execute(
            LiquidityOp::AddAssetLiquidity {
                id: Uuid::new_v4(),
                asset_id: Uuid::new_v4(),
                amount: 5,
            },
            None,
        )
        .await;
    assert_eq!(response.code, "404");
    assert_eq!(response.error.as_deref(), Some("UnknownAsset"));
}

#[tokio::test]
async fn idempotency_key_replays_the_stored_response() {
    let (node, service) = liquidity_node().await;
    let usd = node.create_asset("USD", 2).await;
    let peer = create_peer(&node, usd.id).await;

    let op = LiquidityOp::AddPeerLiquidity {
        id: Uuid::new_v4(),
        peer_id: peer.id,
        amount: 40,
    };
    let first = service
        .execute(op.clone(), Some("key-1".to_string()))
        .await;
    let second = service
        .execute(op.clone(), Some("key-1".to_string()))
        .await;
    assert_eq!(first, second);
    // the ledger saw exactly one transfer
    use streampay_ledger::Ledger;
    assert_eq!(node.ledger.get_balance(peer.id).await.unwrap(), 40);

    // the same key with different input is refused
    let conflicting = service
        .execute(
            LiquidityOp::AddPeerLiquidity {
                id: Uuid::new_v4(),
                peer_id: peer.id,
                amount: 41,
            },
            Some("key-1".to_string()),
        )
        .await;
    assert_eq!(conflicting.code, "409");
    assert!(!conflicting.success);
    assert_eq!(node.ledger.get_balance(peer.id).await.unwrap(), 40);
}

#[tokio::test]
async fn event_liquidity_funds_and_withdraws() {
    let (node, service) = liquidity_node().await;
    let usd = node.create_asset("USD", 2).await;
    let wallet = node.create_wallet("alice", &usd).await;

    let quote = Quote {
        id: Uuid::new_v4(),
        wallet_address_id: wallet.id,
        asset_id: usd.id,
        receiver: "https://faraway.example/carol/incoming-payments/1".to_string(),
        debit_amount: Amount::new(100, "USD", 2),
        receive_amount: Amount::new(50, "USD", 2),
        fee: 0,
        max_packet_amount: 10,
        min_exchange_rate: 0.5,
        low_estimated_exchange_rate: 0.5,
        high_estimated_exchange_rate: 0.5 + f64::EPSILON,
        expires_at: Utc::now() + chrono::Duration::minutes(5),
        client: None,
        created_at: Utc::now(),
    };
    node.store.insert_quote(quote.clone()).await.unwrap();
    let payment = node
        .payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: wallet.id,
            quote_id: quote.id,
            metadata: None,
            client: None,
            grant: None,
        })
        .await
        .unwrap();

    let created_event = node
        .store
        .events_due(Utc::now(), 50)
        .await
        .into_iter()
        .find(|event| event.kind == WebhookEventType::OutgoingPaymentCreated)
        .expect("created event");

    // the event consumer deposits the quoted amount, funding the payment
    let response = service
        .execute(
            LiquidityOp::DepositEventLiquidity {
                event_id: created_event.id,
            },
            None,
        )
        .await;
    assert!(response.success, "{:?}", response);
    use streampay_ledger::Ledger;
    assert_eq!(node.ledger.get_balance(payment.id).await.unwrap(), 100);
    let funded = node.store.get_outgoing_payment(payment.id).await.unwrap();
    assert_eq!(funded.state, OutgoingPaymentState::Sending);

    // a replay is refused as an existing transfer
    let replay = service
        .execute(
            LiquidityOp::DepositEventLiquidity {
                event_id: created_event.id,
            },
            None,
        )
        .await;
    assert_eq!(replay.error.as_deref(), Some("TransferExists"));

    // drive the payment to its terminal state, then withdraw the residual
    // via the terminal event
    let worker = OutgoingPaymentWorker::new(node.payments.clone());
    node.make_due(payment.id).await;
    for _ in 0..5 {
        worker.tick().await;
        node.make_due(payment.id).await;
    }
    let finished = node.store.get_outgoing_payment(payment.id).await.unwrap();
    assert!(finished.is_terminal());

    let terminal_event = node
        .store
        .events_due(Utc::now(), 50)
        .await
        .into_iter()
        .find(|event| {
            matches!(
                event.kind,
                WebhookEventType::OutgoingPaymentCompleted | WebhookEventType::OutgoingPaymentFailed
            )
        })
        .expect("terminal event");
    if let Some(withdrawal) = terminal_event.withdrawal {
        let response = service
            .execute(
                LiquidityOp::WithdrawEventLiquidity {
                    event_id: terminal_event.id,
                },
                None,
            )
            .await;
        assert!(response.success, "{:?}", response);
        assert_eq!(
            node.ledger.get_balance(payment.id).await.unwrap(),
            100 - finished.sent_amount - withdrawal.amount
        );
    }
}
