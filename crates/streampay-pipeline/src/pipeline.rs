use crate::bucket::RateLimiter;
use crate::context::{OutgoingAccount, PacketContext, SourceAccount};
use crate::ildcp::{is_ildcp_request, IldcpResponse};
use crate::link::OutgoingLink;
use crate::IlpResult;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use streampay_ledger::{AccountKind, Ledger, LedgerError, LiquidityAccount, TransferRequest};
use streampay_packet::{
    Address, ErrorCode, Fulfill, MaxPacketAmountDetails, Prepare, Reject, RejectBuilder,
};
use streampay_payments::store::{
    AssetStore, IncomingPaymentStore, PeerStore, WalletAddressStore,
};
use streampay_payments::RateProvider;
use streampay_stream::crypto::hash_sha256;
use streampay_stream::{receive_money, ConnectionGenerator, IlpSender, ReceiveParams};
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Everything the pipeline needs to look up while a packet is in flight.
pub trait PipelineStore:
    PeerStore + IncomingPaymentStore + WalletAddressStore + AssetStore + Clone + Send + Sync + 'static
{
}

impl<T> PipelineStore for T where
    T: PeerStore
        + IncomingPaymentStore
        + WalletAddressStore
        + AssetStore
        + Clone
        + Send
        + Sync
        + 'static
{
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// This node's ILP address; used as `triggered_by` on locally generated
    /// rejects
    pub ilp_address: Address,
    /// Timeout on the per-packet two-phase transfer
    pub transfer_timeout: Duration,
}

/// The stages of the chain, in execution order.
///
/// The ledger transfer is reserved in `Balance`, and the chain driver posts
/// or voids it exactly once when the packet's fate is known: a fulfill from
/// `StreamController` or `Client` posts; any reject or timeout voids.
#[derive(Debug, Clone, Copy)]
enum Stage {
    StreamAddress,
    Account,
    MaxPacketAmount,
    RateLimit,
    IncomingThroughput,
    Ildcp,
    Balance,
    StreamController,
    OutgoingThroughput,
    ExpiryReduce,
    ExpiryGuard,
    Client,
}

static CHAIN: [Stage; 12] = [
    Stage::StreamAddress,
    Stage::Account,
    Stage::MaxPacketAmount,
    Stage::RateLimit,
    Stage::IncomingThroughput,
    Stage::Ildcp,
    Stage::Balance,
    Stage::StreamController,
    Stage::OutgoingThroughput,
    Stage::ExpiryReduce,
    Stage::ExpiryGuard,
    Stage::Client,
];

enum StageOutcome {
    Continue,
    Respond(Fulfill),
}

pub struct Pipeline<S> {
    store: S,
    ledger: Arc<dyn Ledger>,
    rates: Arc<dyn RateProvider>,
    generator: ConnectionGenerator,
    limiter: RateLimiter,
    link: Arc<dyn OutgoingLink>,
    config: PipelineConfig,
}

impl<S: PipelineStore> Pipeline<S> {
    pub fn new(
        store: S,
        ledger: Arc<dyn Ledger>,
        rates: Arc<dyn RateProvider>,
        generator: ConnectionGenerator,
        link: Arc<dyn OutgoingLink>,
        config: PipelineConfig,
    ) -> Self {
        Pipeline {
            store,
            ledger,
            rates,
            generator,
            limiter: RateLimiter::new(),
            link,
            config,
        }
    }

    /// Runs one packet through the chain. This is the single entry point for
    /// both transports and for the node's own pay loop.
    pub async fn handle_request(&self, source: SourceAccount, prepare: Prepare) -> IlpResult {
        let mut ctx = PacketContext::new(source, prepare);
        match self.run(&mut ctx).await {
            Ok(fulfill) => {
                self.commit(&ctx).await;
                Ok(fulfill)
            }
            Err(reject) => {
                self.rollback(&ctx).await;
                Err(reject)
            }
        }
    }

    async fn run(&self, ctx: &mut PacketContext) -> IlpResult {
        for stage in &CHAIN {
            trace!("Running stage {:?}", stage);
            match self.run_stage(ctx, *stage).await? {
                StageOutcome::Continue => {}
                StageOutcome::Respond(fulfill) => return Ok(fulfill),
            }
        }
        Err(self.reject(ErrorCode::F02_UNREACHABLE, "no stage handled the packet"))
    }

    async fn run_stage(
        &self,
        ctx: &mut PacketContext,
        stage: Stage,
    ) -> Result<StageOutcome, Reject> {
        match stage {
            Stage::StreamAddress => self.stream_address(ctx),
            Stage::Account => self.account(ctx).await,
            Stage::MaxPacketAmount => self.max_packet_amount(ctx),
            Stage::RateLimit => self.rate_limit(ctx),
            Stage::IncomingThroughput => self.incoming_throughput(ctx),
            Stage::Ildcp => self.ildcp(ctx).await,
            Stage::Balance => self.balance(ctx).await,
            Stage::StreamController => self.stream_controller(ctx).await,
            Stage::OutgoingThroughput => self.outgoing_throughput(ctx),
            Stage::ExpiryReduce => self.expiry_reduce(ctx),
            Stage::ExpiryGuard => self.expiry_guard(ctx),
            Stage::Client => self.client(ctx).await,
        }
    }

    async fn commit(&self, ctx: &PacketContext) {
        if let Some(transfer_id) = ctx.transfer_id {
            if let Err(err) = self.ledger.post_transfer(transfer_id).await {
                warn!("Error posting transfer {}: {}", transfer_id, err);
            }
        }
    }

    async fn rollback(&self, ctx: &PacketContext) {
        if let Some(transfer_id) = ctx.transfer_id {
            match self.ledger.void_transfer(transfer_id).await {
                Ok(()) | Err(LedgerError::AlreadyVoided) => {}
                Err(err) => warn!("Error voiding transfer {}: {}", transfer_id, err),
            }
        }
        if ctx.throughput_charged > 0 {
            if let Some(peer) = &ctx.source.peer {
                self.limiter.refund_incoming_amount(
                    peer.id,
                    peer.amount_per_second,
                    ctx.throughput_charged,
                );
            }
        }
    }

    fn reject(&self, code: ErrorCode, message: &str) -> Reject {
        RejectBuilder {
            code,
            message: message.as_bytes(),
            triggered_by: Some(&self.config.ilp_address),
            data: &[],
        }
        .build()
    }

    // -- stages ------------------------------------------------------------

    fn stream_address(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        ctx.stream_destination = self.generator.decode_tag(&ctx.prepare.destination());
        Ok(StageOutcome::Continue)
    }

    async fn account(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        if is_ildcp_request(&ctx.prepare) {
            // answered by the ILDCP stage, no outgoing account involved
            return Ok(StageOutcome::Continue);
        }
        let destination = ctx.prepare.destination();
        let amount = ctx.prepare.amount();

        if let Some(tag) = ctx.stream_destination {
            if let Some(mut payment) = self.store.get_incoming_payment(tag).await {
                if payment.is_terminal() && amount != 0 {
                    return Err(
                        self.reject(ErrorCode::F02_UNREACHABLE, "incoming payment is closed")
                    );
                }
                if !payment.ledger_account_created && amount != 0 {
                    self.ensure_account(payment.id, payment.asset_id, AccountKind::Incoming)
                        .await?;
                    payment.ledger_account_created = true;
                    self.store
                        .update_incoming_payment(payment.clone())
                        .await
                        .ok();
                }
                ctx.outgoing = Some(OutgoingAccount::IncomingPayment(payment));
                return Ok(StageOutcome::Continue);
            }
            if let Some(mut wallet) = self.store.get_wallet_address(tag).await {
                if !wallet.is_active(Utc::now()) {
                    return Err(
                        self.reject(ErrorCode::F02_UNREACHABLE, "wallet address is inactive")
                    );
                }
                if !wallet.ledger_account_created && amount != 0 {
                    self.ensure_account(wallet.id, wallet.asset_id, AccountKind::WebMonetization)
                        .await?;
                    wallet.ledger_account_created = true;
                    self.store.update_wallet_address(wallet.clone()).await.ok();
                }
                ctx.outgoing = Some(OutgoingAccount::WalletAddress(wallet));
                return Ok(StageOutcome::Continue);
            }
        }

        if let Some(peer) = self.store.route_to_peer(&destination).await {
            ctx.outgoing = Some(OutgoingAccount::Peer(peer));
            return Ok(StageOutcome::Continue);
        }

        let own: &[u8] = self.config.ilp_address.as_ref();
        if AsRef::<[u8]>::as_ref(&destination).starts_with(own) {
            // A bare local account id under our own prefix is reserved for
            // direct ILP-access accounts, which do not exist yet; the
            // reservation stands but the destination is unhandled.
            debug!("Local ILP-access destination is not handled: {}", destination);
        }
        Err(self.reject(ErrorCode::F02_UNREACHABLE, "no route to destination"))
    }

    async fn ensure_account(
        &self,
        id: Uuid,
        asset_id: Uuid,
        kind: AccountKind,
    ) -> Result<(), Reject> {
        match self
            .ledger
            .create_liquidity_account(LiquidityAccount::new(id, asset_id, kind))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => Ok(()),
            Err(err) => {
                warn!("Unable to create liquidity account {}: {}", id, err);
                Err(self.reject(ErrorCode::T00_INTERNAL_ERROR, "ledger unavailable"))
            }
        }
    }

    fn max_packet_amount(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        if let Some(peer) = &ctx.source.peer {
            if let Some(max_packet_amount) = peer.max_packet_amount {
                let amount = ctx.prepare.amount();
                if amount > max_packet_amount {
                    debug!(
                        "Prepare amount {} exceeds peer max packet amount {}",
                        amount, max_packet_amount
                    );
                    let details = MaxPacketAmountDetails::new(amount, max_packet_amount).to_bytes();
                    return Err(RejectBuilder {
                        code: ErrorCode::F08_AMOUNT_TOO_LARGE,
                        message: &[],
                        triggered_by: Some(&self.config.ilp_address),
                        data: &details,
                    }
                    .build());
                }
            }
        }
        Ok(StageOutcome::Continue)
    }

    fn rate_limit(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        if let Some(peer) = &ctx.source.peer {
            if !self.limiter.take_packet(peer.id, peer.packets_per_second) {
                warn!("Peer {} exceeded its packet rate limit", peer.id);
                return Err(self.reject(ErrorCode::T05_RATE_LIMITED, ""));
            }
        }
        Ok(StageOutcome::Continue)
    }

    fn incoming_throughput(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        if let Some(peer) = &ctx.source.peer {
            let amount = ctx.prepare.amount();
            if !self
                .limiter
                .take_incoming_amount(peer.id, peer.amount_per_second, amount)
            {
                warn!("Peer {} exceeded its incoming throughput limit", peer.id);
                return Err(self.reject(ErrorCode::T04_INSUFFICIENT_LIQUIDITY, ""));
            }
            ctx.throughput_charged = amount;
        }
        Ok(StageOutcome::Continue)
    }

    async fn ildcp(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        if !is_ildcp_request(&ctx.prepare) {
            return Ok(StageOutcome::Continue);
        }
        let peer = ctx.source.peer.as_ref().ok_or_else(|| {
            self.reject(ErrorCode::F02_UNREACHABLE, "ILDCP is only served to peers")
        })?;
        let asset = self
            .store
            .get_asset(peer.asset_id)
            .await
            .ok_or_else(|| self.reject(ErrorCode::T00_INTERNAL_ERROR, "unknown peer asset"))?;
        debug!("Answering ILDCP request from peer {}", peer.id);
        let response = IldcpResponse {
            client_address: peer.static_ilp_address.clone(),
            asset_scale: asset.scale,
            asset_code: asset.code,
        };
        Ok(StageOutcome::Respond(response.to_fulfill()))
    }

    async fn balance(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        let outgoing = match &ctx.outgoing {
            Some(outgoing) => outgoing.clone(),
            None => return Err(self.reject(ErrorCode::F02_UNREACHABLE, "unroutable packet")),
        };
        let amount = ctx.prepare.amount();
        if amount == 0 {
            ctx.destination_amount = 0;
            return Ok(StageOutcome::Continue);
        }

        let destination_asset_id = match &outgoing {
            OutgoingAccount::IncomingPayment(payment) => payment.asset_id,
            OutgoingAccount::WalletAddress(wallet) => wallet.asset_id,
            OutgoingAccount::Peer(peer) => peer.asset_id,
        };
        let destination_asset = self
            .store
            .get_asset(destination_asset_id)
            .await
            .ok_or_else(|| self.reject(ErrorCode::T00_INTERNAL_ERROR, "unknown asset"))?;

        let destination_amount = if destination_asset.code == ctx.source.asset_code
            && destination_asset.scale == ctx.source.asset_scale
        {
            amount
        } else {
            let rate = self
                .rates
                .rate(&ctx.source.asset_code, &destination_asset.code)
                .await
                .map_err(|_| {
                    self.reject(ErrorCode::T00_INTERNAL_ERROR, "exchange rate unavailable")
                })?;
            let shift =
                i32::from(destination_asset.scale) - i32::from(ctx.source.asset_scale);
            (amount as f64 * rate * 10f64.powi(shift)).floor() as u64
        };
        if destination_amount == 0 {
            return Err(self.reject(
                ErrorCode::R01_INSUFFICIENT_SOURCE_AMOUNT,
                "amount rounds to zero after conversion",
            ));
        }

        let transfer_id = Uuid::new_v4();
        self.ledger
            .create_transfer(TransferRequest {
                id: transfer_id,
                source_account_id: ctx.source.account_id,
                destination_account_id: outgoing.ledger_account_id(),
                source_amount: amount,
                destination_amount: Some(destination_amount),
                timeout: self.config.transfer_timeout,
            })
            .await
            .map_err(|err| {
                debug!("Unable to reserve balance for packet: {}", err);
                self.reject(ErrorCode::T04_INSUFFICIENT_LIQUIDITY, "")
            })?;
        ctx.transfer_id = Some(transfer_id);
        ctx.destination_amount = destination_amount;
        Ok(StageOutcome::Continue)
    }

    async fn stream_controller(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        let destination = ctx.prepare.destination();
        let (total_received, receive_max, asset_id) = match ctx.outgoing() {
            OutgoingAccount::Peer(_) => return Ok(StageOutcome::Continue),
            OutgoingAccount::IncomingPayment(payment) => {
                (payment.received_amount, payment.receive_max(), payment.asset_id)
            }
            OutgoingAccount::WalletAddress(wallet) => {
                let received = self
                    .ledger
                    .get_total_received(wallet.id)
                    .await
                    .unwrap_or(0);
                (received, u64::max_value(), wallet.asset_id)
            }
        };
        let asset = self
            .store
            .get_asset(asset_id)
            .await
            .ok_or_else(|| self.reject(ErrorCode::T00_INTERNAL_ERROR, "unknown asset"))?;
        let shared_secret = self
            .generator
            .rederive_secret(&destination)
            .ok_or_else(|| self.reject(ErrorCode::F02_UNREACHABLE, "not a stream address"))?;

        // The receiver judges amounts in its own units
        let mut local_prepare = ctx.prepare.clone();
        local_prepare.set_amount(ctx.destination_amount);

        let params = ReceiveParams {
            ilp_address: &self.config.ilp_address,
            asset_code: &asset.code,
            asset_scale: asset.scale,
            total_received,
            receive_max,
        };
        receive_money(&shared_secret, &params, &local_prepare).map(StageOutcome::Respond)
    }

    fn outgoing_throughput(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        if let OutgoingAccount::Peer(peer) = ctx.outgoing() {
            if !self.limiter.take_outgoing_amount(
                peer.id,
                peer.amount_per_second,
                ctx.destination_amount,
            ) {
                warn!("Peer {} exceeded its outgoing throughput limit", peer.id);
                return Err(self.reject(ErrorCode::T04_INSUFFICIENT_LIQUIDITY, ""));
            }
        }
        Ok(StageOutcome::Continue)
    }

    fn expiry_reduce(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        let max_hold_time = match ctx.outgoing() {
            OutgoingAccount::Peer(peer) => peer.max_hold_time,
            _ => return Ok(StageOutcome::Continue),
        };
        let latest = SystemTime::now() + max_hold_time;
        if ctx.prepare.expires_at() > latest {
            trace!("Shortening packet expiry to the peer's max hold time");
            ctx.prepare.set_expires_at(latest);
        }
        Ok(StageOutcome::Continue)
    }

    fn expiry_guard(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        if ctx.prepare.expires_at() <= SystemTime::now() {
            return Err(self.reject(ErrorCode::R00_TRANSFER_TIMED_OUT, "packet expired"));
        }
        Ok(StageOutcome::Continue)
    }

    async fn client(&self, ctx: &mut PacketContext) -> Result<StageOutcome, Reject> {
        let peer = match ctx.outgoing() {
            OutgoingAccount::Peer(peer) => peer.clone(),
            // local destinations were handled by the stream controller
            _ => return Err(self.reject(ErrorCode::F02_UNREACHABLE, "")),
        };
        let mut onward = ctx.prepare.clone();
        onward.set_amount(ctx.destination_amount);
        let fulfill = self.link.send(&peer, onward).await?;

        if hash_sha256(fulfill.fulfillment()) != ctx.prepare.execution_condition() {
            warn!(
                "Peer {} returned a fulfillment that does not hash to the condition",
                peer.id
            );
            return Err(self.reject(
                ErrorCode::F05_WRONG_CONDITION,
                "fulfillment does not match condition",
            ));
        }
        Ok(StageOutcome::Respond(fulfill))
    }
}

/// Adapter that lets the STREAM pay runtime send through the pipeline as a
/// fixed source account.
pub struct PipelineSender<S> {
    pipeline: Arc<Pipeline<S>>,
    source: SourceAccount,
}

impl<S> PipelineSender<S> {
    pub fn new(pipeline: Arc<Pipeline<S>>, source: SourceAccount) -> Self {
        PipelineSender { pipeline, source }
    }
}

#[async_trait]
impl<S: PipelineStore> IlpSender for PipelineSender<S> {
    async fn send_prepare(&self, prepare: Prepare) -> Result<Fulfill, Reject> {
        self.pipeline
            .handle_request(self.source.clone(), prepare)
            .await
    }
}
