//! The admin surface: provisioning of assets, peers and wallet addresses,
//! payment and quote creation, and the idempotent liquidity operations.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use streampay_engine::{
    CreateOutgoingPaymentParams, FundParams, LiquidityOp, LiquidityService, OutgoingPaymentError,
    OutgoingPaymentService,
};
use streampay_ledger::{AccountKind, Ledger, LedgerError, LiquidityAccount};
use streampay_packet::Address;
use streampay_payments::store::{
    AssetStore, InMemoryStore, PeerStore, WalletAddressStore,
};
use streampay_payments::{
    Amount, Asset, CreateQuoteParams, Grant, GrantLimits, Peer, PeerHttp, QuoteError,
    QuoteService, RateService, ReceiverError, ReceiverResolver, ReceiverService, WalletAddress,
};
use tracing::warn;
use uuid::Uuid;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

type Quotes = QuoteService<InMemoryStore, ReceiverService<InMemoryStore>, RateService>;

#[derive(Clone)]
pub struct AdminServer {
    store: InMemoryStore,
    ledger: Arc<dyn Ledger>,
    quotes: Arc<Quotes>,
    payments: Arc<OutgoingPaymentService<InMemoryStore>>,
    liquidity: Arc<LiquidityService<InMemoryStore>>,
    resolver: Arc<ReceiverService<InMemoryStore>>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    code: String,
    success: bool,
    error: String,
}

fn error_reply(status: StatusCode, error: impl ToString) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&ErrorEnvelope {
            code: status.as_u16().to_string(),
            success: false,
            error: error.to_string(),
        }),
        status,
    )
}

fn created_reply(body: &impl Serialize) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(warp::reply::json(body), StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAssetRequest {
    code: String,
    scale: u8,
    withdrawal_threshold: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePeerRequest {
    asset_id: Uuid,
    static_ilp_address: Address,
    incoming_token: String,
    outgoing_token: String,
    outgoing_endpoint: String,
    max_packet_amount: Option<u64>,
    packets_per_second: Option<u32>,
    amount_per_second: Option<u64>,
    liquidity_threshold: Option<u64>,
    max_hold_time_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateWalletAddressRequest {
    url: String,
    asset_id: Uuid,
    public_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateIncomingPaymentRequest {
    wallet_address_url: String,
    incoming_amount: Option<Amount>,
    expires_at: Option<DateTime<Utc>>,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateQuoteRequest {
    wallet_address_id: Uuid,
    receiver: String,
    debit_amount: Option<Amount>,
    receive_amount: Option<Amount>,
    client: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantRequest {
    id: Uuid,
    limits: Option<GrantLimits>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOutgoingPaymentRequest {
    wallet_address_id: Uuid,
    quote_id: Uuid,
    metadata: Option<serde_json::Value>,
    client: Option<String>,
    grant: Option<GrantRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundRequest {
    amount: u64,
    transfer_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetFeeRequest {
    #[serde(rename = "type")]
    fee_type: streampay_payments::FeeType,
    fixed: u64,
    basis_points: u32,
}

impl AdminServer {
    pub fn new(
        store: InMemoryStore,
        ledger: Arc<dyn Ledger>,
        quotes: Arc<Quotes>,
        payments: Arc<OutgoingPaymentService<InMemoryStore>>,
        liquidity: Arc<LiquidityService<InMemoryStore>>,
        resolver: Arc<ReceiverService<InMemoryStore>>,
    ) -> Self {
        AdminServer {
            store,
            ledger,
            quotes,
            payments,
            liquidity,
            resolver,
        }
    }

    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let assets = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("assets"))
                .and(warp::body::json())
                .and_then(move |body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.create_asset(body).await) }
                })
        };
        let peers = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("peers"))
                .and(warp::body::json())
                .and_then(move |body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.create_peer(body).await) }
                })
        };
        let wallet_addresses = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("wallet-addresses"))
                .and(warp::body::json())
                .and_then(move |body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.create_wallet_address(body).await) }
                })
        };
        let incoming_payments = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("incoming-payments"))
                .and(warp::body::json())
                .and_then(move |body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.create_incoming_payment(body).await) }
                })
        };
        let quotes = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("quotes"))
                .and(warp::body::json())
                .and_then(move |body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.create_quote(body).await) }
                })
        };
        let outgoing_payments = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("outgoing-payments"))
                .and(warp::body::json())
                .and_then(move |body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.create_outgoing_payment(body).await) }
                })
        };
        let fund = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("outgoing-payments" / Uuid / "fund"))
                .and(warp::body::json())
                .and_then(move |id, body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.fund(id, body).await) }
                })
        };
        let liquidity = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("liquidity"))
                .and(warp::header::optional::<String>("idempotency-key"))
                .and(warp::body::json())
                .and_then(move |key: Option<String>, op: LiquidityOp| {
                    let server = server.clone();
                    async move {
                        let response = server.liquidity.execute(op, key).await;
                        let status = StatusCode::from_bytes(response.code.as_bytes())
                            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        Ok::<_, Rejection>(warp::reply::with_status(
                            warp::reply::json(&response),
                            status,
                        ))
                    }
                })
        };

        let fees = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("assets" / Uuid / "fees"))
                .and(warp::body::json())
                .and_then(move |asset_id, body| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.set_fee(asset_id, body).await) }
                })
        };
        let complete_incoming = {
            let server = self.clone();
            warp::post()
                .and(warp::path!("incoming-payments" / Uuid / "complete"))
                .and_then(move |id| {
                    let server = server.clone();
                    async move { Ok::<_, Rejection>(server.complete_incoming_payment(id).await) }
                })
        };

        assets
            .or(fees)
            .or(peers)
            .or(wallet_addresses)
            .or(complete_incoming)
            .or(incoming_payments)
            .or(quotes)
            .or(outgoing_payments)
            .or(fund)
            .or(liquidity)
    }

    async fn set_fee(
        &self,
        asset_id: Uuid,
        request: SetFeeRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        let fee = streampay_payments::Fee {
            fixed: request.fixed,
            basis_points: request.basis_points,
        };
        match self.store.set_fee(asset_id, request.fee_type, fee).await {
            Ok(()) => warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "assetId": asset_id,
                    "fixed": fee.fixed,
                    "basisPoints": fee.basis_points,
                })),
                StatusCode::OK,
            ),
            Err(_) => error_reply(StatusCode::NOT_FOUND, "UnknownAsset"),
        }
    }

    /// Explicit completion: the payee declares the payment done regardless of
    /// how much has arrived.
    async fn complete_incoming_payment(
        &self,
        id: Uuid,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        use streampay_payments::store::{EventStore, IncomingPaymentStore};
        let mut payment = match self.store.get_incoming_payment(id).await {
            Some(payment) => payment,
            None => return error_reply(StatusCode::NOT_FOUND, "UnknownPayment"),
        };
        if payment.is_terminal() {
            return error_reply(StatusCode::CONFLICT, "WrongState");
        }
        payment.complete(Utc::now());
        if self
            .store
            .update_incoming_payment(payment.clone())
            .await
            .is_err()
        {
            return error_reply(StatusCode::INTERNAL_SERVER_ERROR, "update failed");
        }
        let mut event = streampay_payments::WebhookEvent::new(
            streampay_payments::WebhookEventType::IncomingPaymentCompleted,
            serde_json::json!({
                "id": payment.id,
                "walletAddressId": payment.wallet_address_id,
            }),
        );
        if payment.received_amount > 0 {
            event = event.with_withdrawal(streampay_payments::EventWithdrawal {
                account_id: payment.id,
                asset_id: payment.asset_id,
                amount: payment.received_amount,
            });
        }
        self.store.enqueue_event(event).await.ok();
        warp::reply::with_status(
            warp::reply::json(&serde_json::json!({
                "id": payment.id,
                "state": payment.state,
            })),
            StatusCode::OK,
        )
    }

    async fn create_asset(
        &self,
        request: CreateAssetRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        let mut asset = Asset::new(request.code, request.scale);
        asset.withdrawal_threshold = request.withdrawal_threshold;
        if let Err(err) = self.store.insert_asset(asset.clone()).await {
            return error_reply(StatusCode::CONFLICT, err);
        }
        match self
            .ledger
            .create_liquidity_account(LiquidityAccount::new(
                asset.id,
                asset.id,
                AccountKind::Asset,
            ))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
            Err(err) => {
                warn!("Ledger account creation for asset {} failed: {}", asset.id, err);
                return error_reply(StatusCode::INTERNAL_SERVER_ERROR, err);
            }
        }
        created_reply(&serde_json::json!({
            "id": asset.id,
            "code": asset.code,
            "scale": asset.scale,
            "withdrawalThreshold": asset.withdrawal_threshold,
        }))
    }

    async fn create_peer(
        &self,
        request: CreatePeerRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        if self.store.get_asset(request.asset_id).await.is_none() {
            return error_reply(StatusCode::NOT_FOUND, "UnknownAsset");
        }
        let peer = Peer {
            id: Uuid::new_v4(),
            asset_id: request.asset_id,
            static_ilp_address: request.static_ilp_address,
            http: PeerHttp {
                incoming_token: SecretString::new(request.incoming_token),
                outgoing_token: SecretString::new(request.outgoing_token),
                outgoing_endpoint: request.outgoing_endpoint,
            },
            max_packet_amount: request.max_packet_amount,
            packets_per_second: request.packets_per_second,
            amount_per_second: request.amount_per_second,
            max_hold_time: request
                .max_hold_time_ms
                .map(Duration::from_millis)
                .unwrap_or(streampay_payments::peer::DEFAULT_MAX_HOLD_TIME),
            liquidity_threshold: request.liquidity_threshold,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.insert_peer(peer.clone()).await {
            return error_reply(StatusCode::CONFLICT, err);
        }
        match self
            .ledger
            .create_liquidity_account(LiquidityAccount::new(
                peer.id,
                peer.asset_id,
                AccountKind::Peer,
            ))
            .await
        {
            Ok(()) | Err(LedgerError::AccountAlreadyExists) => {}
            Err(err) => return error_reply(StatusCode::INTERNAL_SERVER_ERROR, err),
        }
        created_reply(&serde_json::json!({
            "id": peer.id,
            "assetId": peer.asset_id,
            "staticIlpAddress": peer.static_ilp_address,
        }))
    }

    async fn create_wallet_address(
        &self,
        request: CreateWalletAddressRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        if self.store.get_asset(request.asset_id).await.is_none() {
            return error_reply(StatusCode::NOT_FOUND, "UnknownAsset");
        }
        let mut wallet = WalletAddress::new(request.url, request.asset_id);
        wallet.public_name = request.public_name;
        if let Err(err) = self.store.insert_wallet_address(wallet.clone()).await {
            return error_reply(StatusCode::CONFLICT, err);
        }
        created_reply(&serde_json::json!({
            "id": wallet.id,
            "url": wallet.url,
            "assetId": wallet.asset_id,
            "publicName": wallet.public_name,
        }))
    }

    async fn create_incoming_payment(
        &self,
        request: CreateIncomingPaymentRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        match self
            .resolver
            .create_receiver(
                &request.wallet_address_url,
                request.incoming_amount,
                request.expires_at,
                request.metadata,
            )
            .await
        {
            Ok(receiver) => created_reply(&serde_json::json!({
                "id": receiver.url,
                "ilpAddress": receiver.ilp_address,
                "sharedSecret": base64::encode_config(
                    &receiver.shared_secret,
                    base64::URL_SAFE_NO_PAD
                ),
                "incomingAmount": receiver.incoming_amount,
                "expiresAt": receiver.expires_at,
            })),
            Err(ReceiverError::UnknownWalletAddress) => {
                error_reply(StatusCode::NOT_FOUND, "UnknownWalletAddress")
            }
            Err(err) => error_reply(StatusCode::BAD_REQUEST, err),
        }
    }

    async fn create_quote(
        &self,
        request: CreateQuoteRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        match self
            .quotes
            .create(CreateQuoteParams {
                wallet_address_id: request.wallet_address_id,
                receiver: request.receiver,
                debit_amount: request.debit_amount,
                receive_amount: request.receive_amount,
                client: request.client,
            })
            .await
        {
            Ok(quote) => created_reply(&serde_json::json!({
                "id": quote.id,
                "walletAddressId": quote.wallet_address_id,
                "receiver": quote.receiver,
                "debitAmount": quote.debit_amount,
                "receiveAmount": quote.receive_amount,
                "expiresAt": quote.expires_at,
            })),
            Err(err @ QuoteError::UnknownWalletAddress) => error_reply(StatusCode::NOT_FOUND, err),
            Err(err @ QuoteError::RateProbeFailed) => {
                error_reply(StatusCode::INTERNAL_SERVER_ERROR, err)
            }
            Err(err) => error_reply(StatusCode::BAD_REQUEST, err),
        }
    }

    async fn create_outgoing_payment(
        &self,
        request: CreateOutgoingPaymentRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        let grant = request.grant.map(|grant| Grant {
            id: grant.id,
            limits: grant.limits,
        });
        match self
            .payments
            .create(CreateOutgoingPaymentParams {
                wallet_address_id: request.wallet_address_id,
                quote_id: request.quote_id,
                metadata: request.metadata,
                client: request.client,
                grant,
            })
            .await
        {
            Ok(payment) => created_reply(&serde_json::json!({
                "id": payment.id,
                "walletAddressId": payment.wallet_address_id,
                "quoteId": payment.quote_id,
                "state": payment.state,
            })),
            Err(err @ OutgoingPaymentError::UnknownWalletAddress)
            | Err(err @ OutgoingPaymentError::UnknownQuote) => {
                error_reply(StatusCode::NOT_FOUND, err)
            }
            Err(err @ OutgoingPaymentError::InsufficientGrant) => {
                error_reply(StatusCode::FORBIDDEN, err)
            }
            Err(err) => error_reply(StatusCode::BAD_REQUEST, err),
        }
    }

    async fn fund(
        &self,
        id: Uuid,
        request: FundRequest,
    ) -> warp::reply::WithStatus<warp::reply::Json> {
        match self
            .payments
            .fund(FundParams {
                id,
                amount: request.amount,
                transfer_id: request.transfer_id.unwrap_or_else(Uuid::new_v4),
            })
            .await
        {
            Ok(payment) => warp::reply::with_status(
                warp::reply::json(&serde_json::json!({
                    "id": payment.id,
                    "state": payment.state,
                })),
                StatusCode::OK,
            ),
            Err(err @ OutgoingPaymentError::UnknownPayment) => {
                error_reply(StatusCode::NOT_FOUND, err)
            }
            Err(err @ OutgoingPaymentError::WrongState) => error_reply(StatusCode::CONFLICT, err),
            Err(err) => error_reply(StatusCode::BAD_REQUEST, err),
        }
    }
}
