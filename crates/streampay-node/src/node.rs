//! Construction and wiring of a full node: ledger, stores, hooks, pipeline,
//! lifecycle services, workers and the HTTP surfaces.

use crate::admin::AdminServer;
use crate::config::Config;
use crate::ilp_http::IlpHttpServer;
use chrono::Duration as ChronoDuration;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use streampay_engine::{
    register_credit_hooks, IncomingPaymentExpiryWorker, LifecycleConfig, LiquidityService,
    OutgoingPaymentService, OutgoingPaymentWorker, SenderFactory, WalletAddressWorker,
    WebhookConfig, WebhookDispatcher,
};
use streampay_ledger::{InMemoryLedger, Ledger};
use streampay_packet::Address;
use streampay_payments::store::InMemoryStore;
use streampay_payments::{
    Asset, OutgoingPayment, QuoteConfig, QuoteService, RateService, ReceiverService,
};
use streampay_pipeline::{
    HttpLink, Pipeline, PipelineConfig, PipelineSender, SourceAccount,
};
use streampay_stream::{ConnectionGenerator, IlpSender};
use tracing::info;
use warp::Filter;

/// Pay-step packets re-enter this node's own pipeline as their first hop.
struct PipelineSenderFactory {
    pipeline: Arc<Pipeline<InMemoryStore>>,
}

impl SenderFactory for PipelineSenderFactory {
    fn sender_for(&self, payment: &OutgoingPayment, asset: &Asset) -> Arc<dyn IlpSender> {
        Arc::new(PipelineSender::new(
            self.pipeline.clone(),
            SourceAccount::internal(payment.id, asset.code.clone(), asset.scale),
        ))
    }
}

pub struct StreampayNode {
    config: Config,
}

impl StreampayNode {
    pub fn new(config: Config) -> Self {
        StreampayNode { config }
    }

    /// Builds every component and runs until ctrl-c.
    pub async fn serve(self) -> Result<(), String> {
        let config = self.config;
        let ilp_address = Address::from_str(&config.ilp_address)
            .map_err(|err| format!("invalid ilp_address: {}", err))?;
        let stream_secret = config
            .stream_secret_bytes()
            .map_err(|err| err.to_string())?;
        let webhook_secret = config
            .webhook_secret_bytes()
            .map_err(|err| err.to_string())?;

        let store = InMemoryStore::new();
        let ledger = Arc::new(InMemoryLedger::new());
        register_credit_hooks(
            &ledger.hooks(),
            store.clone(),
            ChronoDuration::milliseconds(config.withdrawal_throttle_delay_ms as i64),
        );
        let ledger_dyn: Arc<dyn Ledger> = ledger.clone();

        let rates = Arc::new(RateService::new(
            config.exchange_rates_url.clone(),
            Duration::from_millis(config.exchange_rates_lifetime_ms),
        ));
        let pipeline = Arc::new(Pipeline::new(
            store.clone(),
            ledger_dyn.clone(),
            rates.clone(),
            ConnectionGenerator::new(&stream_secret),
            Arc::new(HttpLink::new()),
            PipelineConfig {
                ilp_address: ilp_address.clone(),
                transfer_timeout: Duration::from_secs(5),
            },
        ));

        let resolver = Arc::new(ReceiverService::new(
            store.clone(),
            ConnectionGenerator::new(&stream_secret),
            ilp_address.clone(),
            config.open_payments_url.clone(),
        ));
        let quotes = Arc::new(QuoteService::new(
            store.clone(),
            resolver.clone(),
            rates,
            QuoteConfig {
                slippage: config.slippage,
                lifespan: ChronoDuration::milliseconds(config.quote_lifespan_ms as i64),
            },
        ));
        let payments = Arc::new(OutgoingPaymentService::new(
            store.clone(),
            ledger_dyn.clone(),
            resolver.clone(),
            Arc::new(PipelineSenderFactory {
                pipeline: pipeline.clone(),
            }),
            LifecycleConfig {
                retry_backoff: ChronoDuration::seconds(streampay_engine::RETRY_BACKOFF_SECONDS),
                max_attempts: streampay_engine::MAX_STATE_ATTEMPTS,
                source_address: ilp_address.clone(),
            },
        ));
        let liquidity = Arc::new(LiquidityService::new(
            store.clone(),
            ledger_dyn.clone(),
            payments.clone(),
        ));

        // background workers
        let worker_interval = Duration::from_millis(config.worker_interval_ms);
        let payment_worker = OutgoingPaymentWorker::new(payments.clone()).spawn(worker_interval);
        let expiry_worker =
            IncomingPaymentExpiryWorker::new(store.clone()).spawn(worker_interval);
        let wallet_worker =
            WalletAddressWorker::new(store.clone(), ledger_dyn.clone()).spawn(worker_interval);

        let dispatcher = Arc::new(WebhookDispatcher::new(
            store.clone(),
            WebhookConfig {
                url: config.webhook_url.clone(),
                secret: webhook_secret,
                ..WebhookConfig::default()
            },
        ));
        {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(worker_interval);
                loop {
                    timer.tick().await;
                    dispatcher.process_due(20).await;
                }
            });
        }

        // HTTP surfaces
        let ilp_server = IlpHttpServer::new(store.clone(), pipeline.clone());
        let ilp = warp::serve(ilp_server.routes()).run(config.ilp_bind);

        let spsp = streampay_spsp::SpspServer::new(
            store.clone(),
            ConnectionGenerator::new(&stream_secret),
            ilp_address.clone(),
            config.open_payments_url.clone(),
        );
        let admin = AdminServer::new(
            store,
            ledger_dyn,
            quotes,
            payments,
            liquidity,
            resolver,
        );
        let api = warp::serve(spsp.routes().or(admin.routes())).run(config.api_bind);

        info!(
            "streampay node listening: ILP on {}, API on {} (address {})",
            config.ilp_bind, config.api_bind, ilp_address
        );

        tokio::select! {
            _ = ilp => {}
            _ = api => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
            }
        }

        payment_worker.stop();
        expiry_worker.stop();
        wallet_worker.stop();
        Ok(())
    }
}
