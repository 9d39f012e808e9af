//! End-to-end lifecycle flows over the in-memory node.

mod common;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use std::str::FromStr;
use std::sync::Arc;
use streampay_ledger::Ledger;
use streampay_payments::ReceiverResolver;
use streampay_engine::{
    CreateOutgoingPaymentParams, FundParams, OutgoingPaymentError, OutgoingPaymentWorker,
};
use streampay_packet::{Address, PacketType};
use streampay_payments::store::{EventStore, IncomingPaymentStore, OutgoingPaymentStore, QuoteStore};
use streampay_payments::{
    Amount, CreateQuoteParams, Grant, GrantLimits, OutgoingPaymentState, Quote, Receiver,
    RepeatingInterval, WebhookEventType,
};
use streampay_stream::crypto::generate_fulfillment;
use streampay_stream::{
    ConnectionCloseFrame, Frame, IlpSender, StreamErrorCode, StreamPacket, StreamPacketBuilder,
};
use uuid::Uuid;

/// Fixed-send payment into a local incoming payment, cross-currency at a
/// rate of 0.5.
#[tokio::test]
async fn fixed_send_to_local_incoming_payment() {
    let node = test_node(0.5, 0.0).await;
    let usd = node.create_asset("USD", 9).await;
    let xrp = node.create_asset("XRP", 9).await;
    let wallet_a = node.create_wallet("alice", &usd).await;
    let _wallet_b = node.create_wallet("bob", &xrp).await;

    // the receiver: an incoming payment for 56 XRP on wallet B
    let receiver = node
        .resolver
        .create_receiver(
            &format!("{}/bob", OPEN_PAYMENTS_URL),
            Some(Amount::new(56_000_000_000, "XRP", 9)),
            None,
            None,
        )
        .await
        .unwrap();
    let incoming_id = node.generator.decode_tag(&receiver.ilp_address).unwrap();

    let quote = node
        .quotes
        .create(CreateQuoteParams {
            wallet_address_id: wallet_a.id,
            receiver: receiver.url.clone(),
            debit_amount: Some(Amount::new(123, "USD", 9)),
            receive_amount: None,
            client: None,
        })
        .await
        .unwrap();
    assert_eq!(quote.receive_amount.value, 61);
    assert!((quote.min_exchange_rate - 0.5).abs() < 1e-12);

    let payment = node
        .payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: wallet_a.id,
            quote_id: quote.id,
            metadata: None,
            client: None,
            grant: None,
        })
        .await
        .unwrap();
    assert_eq!(payment.state, OutgoingPaymentState::Funding);

    node.payments
        .fund(FundParams {
            id: payment.id,
            amount: 123,
            transfer_id: Uuid::new_v4(),
        })
        .await
        .unwrap();

    OutgoingPaymentWorker::new(node.payments.clone()).tick().await;

    let finished = node.store.get_outgoing_payment(payment.id).await.unwrap();
    assert_eq!(finished.state, OutgoingPaymentState::Completed);
    // delivering 61 at a rate of 0.5 costs exactly twice the receive amount
    assert_eq!(finished.sent_amount, 122);
    assert_eq!(node.ledger.get_total_sent(payment.id).await.unwrap(), 122);

    // the receiver's state advanced through the credit hook
    let incoming = node.store.get_incoming_payment(incoming_id).await.unwrap();
    assert_eq!(incoming.received_amount, 61);
    assert_eq!(
        node.ledger.get_total_received(incoming_id).await.unwrap(),
        61
    );

    // residual funding goes back out through the completion event
    let completed_event = node
        .store
        .events_due(Utc::now(), 50)
        .await
        .into_iter()
        .find(|event| event.kind == WebhookEventType::OutgoingPaymentCompleted)
        .expect("completion event");
    let withdrawal = completed_event.withdrawal.expect("residual withdrawal");
    assert_eq!(withdrawal.amount, 123 - 122);
    assert_eq!(withdrawal.account_id, payment.id);
    // invariant: total sent plus residual equals the funded amount
    assert_eq!(
        node.ledger.get_total_sent(payment.id).await.unwrap() + withdrawal.amount,
        123
    );
}

/// A receiver that accepts one 10-unit packet per connection (delivering 5)
/// and then closes the stream.
struct ClosingReceiver {
    shared_secret: [u8; 32],
}

#[async_trait]
impl IlpSender for ClosingReceiver {
    async fn send_prepare(
        &self,
        prepare: streampay_packet::Prepare,
    ) -> Result<streampay_packet::Fulfill, streampay_packet::Reject> {
        let request = StreamPacket::from_encrypted(
            &self.shared_secret,
            bytes::BytesMut::from(prepare.data()),
        )
        .map_err(|_| {
            streampay_packet::RejectBuilder {
                code: streampay_packet::ErrorCode::F06_UNEXPECTED_PAYMENT,
                message: &[],
                triggered_by: None,
                data: &[],
            }
            .build()
        })?;
        let response = StreamPacketBuilder {
            sequence: request.sequence(),
            ilp_packet_type: PacketType::Fulfill,
            prepare_amount: prepare.amount() / 2,
            frames: &[Frame::ConnectionClose(ConnectionCloseFrame {
                code: StreamErrorCode::ApplicationError,
                message: "done for today".to_string(),
            })],
        }
        .build();
        let fulfillment = generate_fulfillment(&self.shared_secret, prepare.data());
        Ok(streampay_packet::FulfillBuilder {
            fulfillment: &fulfillment,
            data: &response.into_encrypted(&self.shared_secret)[..],
        }
        .build())
    }
}

struct ClosingSenderFactory {
    shared_secret: [u8; 32],
}

impl streampay_engine::SenderFactory for ClosingSenderFactory {
    fn sender_for(
        &self,
        _payment: &streampay_payments::OutgoingPayment,
        _asset: &streampay_payments::Asset,
    ) -> Arc<dyn IlpSender> {
        Arc::new(ClosingReceiver {
            shared_secret: self.shared_secret,
        })
    }
}

fn fixed_receiver(shared_secret: [u8; 32]) -> Receiver {
    Receiver {
        url: "https://faraway.example/carol/incoming-payments/1".to_string(),
        asset_code: "USD".to_string(),
        asset_scale: 2,
        ilp_address: Address::from_str("test.faraway.carol").unwrap(),
        shared_secret,
        incoming_amount: None,
        received_amount: None,
        expires_at: None,
    }
}

fn manual_quote(wallet_address_id: Uuid, asset_id: Uuid, receiver_url: &str) -> Quote {
    Quote {
        id: Uuid::new_v4(),
        wallet_address_id,
        asset_id,
        receiver: receiver_url.to_string(),
        debit_amount: Amount::new(100, "USD", 2),
        receive_amount: Amount::new(50, "USD", 2),
        fee: 0,
        max_packet_amount: 10,
        min_exchange_rate: 0.5,
        low_estimated_exchange_rate: 0.5,
        high_estimated_exchange_rate: 0.5 + f64::EPSILON,
        expires_at: Utc::now() + ChronoDuration::minutes(5),
        client: None,
        created_at: Utc::now(),
    }
}

/// A payment that keeps hitting a retryable error accrues partial progress,
/// backs off exponentially, and lands in Failed with the residual intact.
#[tokio::test]
async fn retryable_errors_back_off_and_eventually_fail() {
    let shared_secret = [7u8; 32];
    let receiver = fixed_receiver(shared_secret);
    let node = test_node_with_resolver_and_senders(
        1.0,
        0.0,
        Some(Arc::new(streampay_payments::quote::FixedReceiver(
            receiver,
        ))),
        Some(Arc::new(ClosingSenderFactory { shared_secret })),
    )
    .await;
    let usd = node.create_asset("USD", 2).await;
    let wallet = node.create_wallet("alice", &usd).await;

    let quote = manual_quote(wallet.id, usd.id, "https://faraway.example/carol/incoming-payments/1");
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
    node.payments
        .fund(FundParams {
            id: payment.id,
            amount: 100,
            transfer_id: Uuid::new_v4(),
        })
        .await
        .unwrap();

    let worker = OutgoingPaymentWorker::new(node.payments.clone());
    for attempt in 1..=5u32 {
        node.make_due(payment.id).await;
        worker.tick().await;
        let current = node.store.get_outgoing_payment(payment.id).await.unwrap();
        // each attempt moves 10 source units before the receiver closes
        assert_eq!(current.sent_amount, u64::from(attempt) * 10);
        if attempt < 5 {
            assert_eq!(current.state, OutgoingPaymentState::Sending);
            assert_eq!(current.state_attempts, attempt);
            // backoff pushed the next attempt into the future
            assert!(current.process_at.unwrap() > Utc::now());
        }
    }

    let failed = node.store.get_outgoing_payment(payment.id).await.unwrap();
    assert_eq!(failed.state, OutgoingPaymentState::Failed);
    assert_eq!(failed.sent_amount, 50);
    assert!(failed.error.is_some());

    let failed_event = node
        .store
        .events_due(Utc::now(), 50)
        .await
        .into_iter()
        .find(|event| event.kind == WebhookEventType::OutgoingPaymentFailed)
        .expect("failure event");
    assert_eq!(failed_event.withdrawal.unwrap().amount, 100 - 50);
}

/// Grant budgets: an exact fit succeeds, one unit over fails, and the
/// second payment in the same interval sees the first one's spend.
#[tokio::test]
async fn grant_limits_bound_payment_creation() {
    let shared_secret = [7u8; 32];
    let node = test_node_with_resolver_and_senders(
        1.0,
        0.0,
        Some(Arc::new(streampay_payments::quote::FixedReceiver(
            fixed_receiver(shared_secret),
        ))),
        Some(Arc::new(ClosingSenderFactory { shared_secret })),
    )
    .await;
    let usd = node.create_asset("USD", 2).await;
    let wallet = node.create_wallet("alice", &usd).await;

    let interval = RepeatingInterval::from_str(&format!(
        "R0/{}/P1M",
        (Utc::now() - ChronoDuration::days(5))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ))
    .unwrap();
    let grant = Grant {
        id: Uuid::new_v4(),
        limits: Some(GrantLimits {
            receiver: None,
            debit_amount: Some(Amount::new(200, "USD", 2)),
            receive_amount: None,
            interval: Some(interval),
        }),
    };

    let mut first_quote =
        manual_quote(wallet.id, usd.id, "https://faraway.example/carol/incoming-payments/1");
    first_quote.debit_amount = Amount::new(190, "USD", 2);
    node.store.insert_quote(first_quote.clone()).await.unwrap();
    node.payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: wallet.id,
            quote_id: first_quote.id,
            metadata: None,
            client: None,
            grant: Some(grant.clone()),
        })
        .await
        .expect("first payment fits the grant");

    // 190 of 200 is spent; another 190 does not fit
    let mut second_quote =
        manual_quote(wallet.id, usd.id, "https://faraway.example/carol/incoming-payments/1");
    second_quote.debit_amount = Amount::new(190, "USD", 2);
    node.store.insert_quote(second_quote.clone()).await.unwrap();
    let result = node
        .payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: wallet.id,
            quote_id: second_quote.id,
            metadata: None,
            client: None,
            grant: Some(grant.clone()),
        })
        .await;
    assert_eq!(result.unwrap_err(), OutgoingPaymentError::InsufficientGrant);

    // an exact fit of the remaining 10 still works
    let mut exact_quote =
        manual_quote(wallet.id, usd.id, "https://faraway.example/carol/incoming-payments/1");
    exact_quote.debit_amount = Amount::new(10, "USD", 2);
    node.store.insert_quote(exact_quote.clone()).await.unwrap();
    node.payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: wallet.id,
            quote_id: exact_quote.id,
            metadata: None,
            client: None,
            grant: Some(grant),
        })
        .await
        .expect("exact remaining budget fits");
}

/// Quotes are single-use and validated against the wallet address.
#[tokio::test]
async fn quote_reuse_and_mismatch_are_invalid() {
    let shared_secret = [7u8; 32];
    let node = test_node_with_resolver_and_senders(
        1.0,
        0.0,
        Some(Arc::new(streampay_payments::quote::FixedReceiver(
            fixed_receiver(shared_secret),
        ))),
        Some(Arc::new(ClosingSenderFactory { shared_secret })),
    )
    .await;
    let usd = node.create_asset("USD", 2).await;
    let wallet = node.create_wallet("alice", &usd).await;
    let other_wallet = node.create_wallet("other", &usd).await;

    let quote = manual_quote(wallet.id, usd.id, "https://faraway.example/carol/incoming-payments/1");
    node.store.insert_quote(quote.clone()).await.unwrap();

    // wrong wallet
    let mismatch = node
        .payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: other_wallet.id,
            quote_id: quote.id,
            metadata: None,
            client: None,
            grant: None,
        })
        .await;
    assert_eq!(mismatch.unwrap_err(), OutgoingPaymentError::InvalidQuote);

    node.payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: wallet.id,
            quote_id: quote.id,
            metadata: None,
            client: None,
            grant: None,
        })
        .await
        .unwrap();

    // consumed
    let reuse = node
        .payments
        .create(CreateOutgoingPaymentParams {
            wallet_address_id: wallet.id,
            quote_id: quote.id,
            metadata: None,
            client: None,
            grant: None,
        })
        .await;
    assert_eq!(reuse.unwrap_err(), OutgoingPaymentError::InvalidQuote);
}

/// Funding is guarded by state and amount.
#[tokio::test]
async fn funding_requires_the_quoted_amount() {
    let shared_secret = [7u8; 32];
    let node = test_node_with_resolver_and_senders(
        1.0,
        0.0,
        Some(Arc::new(streampay_payments::quote::FixedReceiver(
            fixed_receiver(shared_secret),
        ))),
        Some(Arc::new(ClosingSenderFactory { shared_secret })),
    )
    .await;
    let usd = node.create_asset("USD", 2).await;
    let wallet = node.create_wallet("alice", &usd).await;
    let quote = manual_quote(wallet.id, usd.id, "https://faraway.example/carol/incoming-payments/1");
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

    let wrong_amount = node
        .payments
        .fund(FundParams {
            id: payment.id,
            amount: 99,
            transfer_id: Uuid::new_v4(),
        })
        .await;
    assert_eq!(wrong_amount.unwrap_err(), OutgoingPaymentError::InvalidAmount);

    let missing = node
        .payments
        .fund(FundParams {
            id: Uuid::new_v4(),
            amount: 100,
            transfer_id: Uuid::new_v4(),
        })
        .await;
    assert_eq!(missing.unwrap_err(), OutgoingPaymentError::UnknownPayment);

    node.payments
        .fund(FundParams {
            id: payment.id,
            amount: 100,
            transfer_id: Uuid::new_v4(),
        })
        .await
        .unwrap();

    // Funding twice is a state error
    let again = node
        .payments
        .fund(FundParams {
            id: payment.id,
            amount: 100,
            transfer_id: Uuid::new_v4(),
        })
        .await;
    assert_eq!(again.unwrap_err(), OutgoingPaymentError::WrongState);
}
