//! Shared fixture: a fully wired single-node engine over the in-memory
//! store and ledger, with the packet pipeline as the sender.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use streampay_engine::{
    register_credit_hooks, LifecycleConfig, OutgoingPaymentService, SenderFactory,
};
use streampay_ledger::{AccountKind, InMemoryLedger, Ledger, LiquidityAccount};
use streampay_packet::Address;
use streampay_payments::store::InMemoryStore;
use streampay_payments::{
    Asset, OutgoingPayment, QuoteConfig, QuoteService, RateError, RateProvider, ReceiverResolver,
    ReceiverService, WalletAddress,
};
use streampay_pipeline::{
    HttpLink, Pipeline, PipelineConfig, PipelineSender, SourceAccount,
};
use streampay_stream::{ConnectionGenerator, IlpSender};
use uuid::Uuid;

pub const SERVER_SECRET: [u8; 32] = [42u8; 32];
pub const OPEN_PAYMENTS_URL: &str = "https://wallet.example";

pub struct FixedRate(pub f64);

#[async_trait]
impl RateProvider for FixedRate {
    async fn rate(&self, source: &str, destination: &str) -> Result<f64, RateError> {
        if source == destination {
            Ok(1.0)
        } else {
            Ok(self.0)
        }
    }
}

/// Sends every pay-step packet back through the node's own pipeline.
pub struct PipelineSenderFactory {
    pub pipeline: Arc<Pipeline<InMemoryStore>>,
}

impl SenderFactory for PipelineSenderFactory {
    fn sender_for(&self, payment: &OutgoingPayment, asset: &Asset) -> Arc<dyn IlpSender> {
        Arc::new(PipelineSender::new(
            self.pipeline.clone(),
            SourceAccount::internal(payment.id, asset.code.clone(), asset.scale),
        ))
    }
}

pub struct TestNode {
    pub store: InMemoryStore,
    pub ledger: Arc<InMemoryLedger>,
    pub pipeline: Arc<Pipeline<InMemoryStore>>,
    pub generator: ConnectionGenerator,
    pub resolver: Arc<ReceiverService<InMemoryStore>>,
    pub payments: Arc<OutgoingPaymentService<InMemoryStore>>,
    pub quotes: QuoteService<InMemoryStore, ReceiverService<InMemoryStore>, FixedRate>,
    pub node_address: Address,
}

pub async fn test_node(rate: f64, slippage: f64) -> TestNode {
    test_node_with_resolver_and_senders(rate, slippage, None, None).await
}

pub async fn test_node_with_resolver_and_senders(
    rate: f64,
    slippage: f64,
    resolver_override: Option<Arc<dyn ReceiverResolver>>,
    sender_override: Option<Arc<dyn SenderFactory>>,
) -> TestNode {
    let store = InMemoryStore::new();
    let ledger = Arc::new(InMemoryLedger::new());
    register_credit_hooks(
        &ledger.hooks(),
        store.clone(),
        ChronoDuration::seconds(0),
    );
    let node_address = Address::from_str("test.node").unwrap();
    let generator = ConnectionGenerator::new(&SERVER_SECRET);

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        ledger.clone(),
        Arc::new(FixedRate(rate)),
        ConnectionGenerator::new(&SERVER_SECRET),
        Arc::new(HttpLink::new()),
        PipelineConfig {
            ilp_address: node_address.clone(),
            transfer_timeout: Duration::from_secs(5),
        },
    ));

    let resolver = Arc::new(ReceiverService::new(
        store.clone(),
        ConnectionGenerator::new(&SERVER_SECRET),
        node_address.clone(),
        OPEN_PAYMENTS_URL,
    ));
    let resolver_dyn: Arc<dyn ReceiverResolver> = match resolver_override {
        Some(resolver) => resolver,
        None => resolver.clone(),
    };
    let senders: Arc<dyn SenderFactory> = match sender_override {
        Some(senders) => senders,
        None => Arc::new(PipelineSenderFactory {
            pipeline: pipeline.clone(),
        }),
    };

    let payments = Arc::new(OutgoingPaymentService::new(
        store.clone(),
        ledger.clone(),
        resolver_dyn,
        senders,
        LifecycleConfig {
            retry_backoff: ChronoDuration::seconds(10),
            max_attempts: 5,
            source_address: node_address.clone(),
        },
    ));

    let quotes = QuoteService::new(
        store.clone(),
        resolver.clone(),
        Arc::new(FixedRate(rate)),
        QuoteConfig {
            slippage,
            lifespan: ChronoDuration::minutes(5),
        },
    );

    TestNode {
        store,
        ledger,
        pipeline,
        generator,
        resolver,
        payments,
        quotes,
        node_address,
    }
}

impl TestNode {
    pub async fn create_asset(&self, code: &str, scale: u8) -> Asset {
        use streampay_payments::store::AssetStore;
        let asset = Asset::new(code, scale);
        self.store.insert_asset(asset.clone()).await.unwrap();
        self.ledger
            .create_liquidity_account(LiquidityAccount::new(
                asset.id,
                asset.id,
                AccountKind::Asset,
            ))
            .await
            .unwrap();
        asset
    }

    pub async fn create_wallet(&self, name: &str, asset: &Asset) -> WalletAddress {
        use streampay_payments::store::WalletAddressStore;
        let wallet = WalletAddress::new(format!("{}/{}", OPEN_PAYMENTS_URL, name), asset.id);
        self.store.insert_wallet_address(wallet.clone()).await.unwrap();
        wallet
    }

    /// Reschedules a payment so the worker picks it up immediately.
    pub async fn make_due(&self, payment_id: Uuid) {
        use streampay_payments::store::OutgoingPaymentStore;
        let mut payment = self.store.get_outgoing_payment(payment_id).await.unwrap();
        if payment.process_at.is_some() {
            payment.process_at = Some(chrono::Utc::now() - ChronoDuration::seconds(1));
            self.store.update_outgoing_payment(payment).await.unwrap();
        }
    }
}
