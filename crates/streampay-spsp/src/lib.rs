//! # streampay-spsp
//!
//! The streaming-payment setup surfaces: SPSP queries on wallet-address
//! URLs and the connection resources that expose an incoming payment's
//! STREAM credentials.

use serde::Serialize;
use streampay_packet::Address;
use streampay_payments::store::{AssetStore, IncomingPaymentStore, WalletAddressStore};
use streampay_stream::ConnectionGenerator;
use tracing::debug;
use uuid::Uuid;
use warp::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use warp::http::{Response, StatusCode};
use warp::{Filter, Rejection, Reply};

pub const SPSP_CONTENT_TYPE: &str = "application/spsp4+json";

#[derive(Debug, Serialize)]
struct SpspAsset {
    code: String,
    scale: u8,
}

/// The SPSP query response body.
#[derive(Debug, Serialize)]
struct SpspResponse {
    destination_account: String,
    shared_secret: String,
    asset: SpspAsset,
}

/// The connection resource body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionResponse {
    id: Uuid,
    ilp_address: String,
    shared_secret: String,
    asset_code: String,
    asset_scale: u8,
}

#[derive(Clone)]
pub struct SpspServer<S> {
    store: S,
    generator: ConnectionGenerator,
    node_address: Address,
    base_url: String,
}

impl<S> SpspServer<S>
where
    S: WalletAddressStore + AssetStore + IncomingPaymentStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        store: S,
        generator: ConnectionGenerator,
        node_address: Address,
        base_url: impl Into<String>,
    ) -> Self {
        SpspServer {
            store,
            generator,
            node_address,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `GET /connections/{id}` and `GET /{account}` (the latter only with
    /// the SPSP accept header).
    pub fn routes(&self) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
        let connections = {
            let server = self.clone();
            warp::get()
                .and(warp::path!("connections" / Uuid))
                .and_then(move |connection_id| {
                    let server = server.clone();
                    async move { server.connection(connection_id).await }
                })
        };
        let query = {
            let server = self.clone();
            warp::get()
                .and(warp::path::param::<String>())
                .and(warp::path::end())
                .and(warp::header::<String>("accept"))
                .and_then(move |account: String, accept: String| {
                    let server = server.clone();
                    async move {
                        if !accept.contains(SPSP_CONTENT_TYPE) {
                            return Err(warp::reject::not_found());
                        }
                        server.query(account).await
                    }
                })
        };
        connections.or(query)
    }

    async fn query(&self, account: String) -> Result<Response<String>, Rejection> {
        let url = format!("{}/{}", self.base_url, account);
        let wallet = self
            .store
            .get_wallet_address_by_url(&url)
            .await
            .filter(|wallet| wallet.is_active(chrono::Utc::now()))
            .ok_or_else(warp::reject::not_found)?;
        let asset = self
            .store
            .get_asset(wallet.asset_id)
            .await
            .ok_or_else(warp::reject::not_found)?;

        // The tag is the wallet address id, so packets sent against these
        // credentials land on the wallet's web-monetization account
        let credentials = self
            .generator
            .generate_credentials(&self.node_address, wallet.id);
        debug!("Answering SPSP query for wallet address {}", wallet.id);
        let body = SpspResponse {
            destination_account: credentials.ilp_address.to_string(),
            shared_secret: base64::encode_config(
                &credentials.shared_secret,
                base64::URL_SAFE_NO_PAD,
            ),
            asset: SpspAsset {
                code: asset.code,
                scale: asset.scale,
            },
        };
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, SPSP_CONTENT_TYPE)
            .header(CACHE_CONTROL, "max-age=60")
            .body(serde_json::to_string(&body).unwrap_or_default())
            .unwrap_or_else(|_| Response::new(String::new())))
    }

    async fn connection(&self, connection_id: Uuid) -> Result<Response<String>, Rejection> {
        // Terminal incoming payments have their connection id severed, so
        // the lookup itself enforces the 404-after-completion rule
        let payment = self
            .store
            .get_incoming_payment_by_connection(connection_id)
            .await
            .ok_or_else(warp::reject::not_found)?;
        let asset = self
            .store
            .get_asset(payment.asset_id)
            .await
            .ok_or_else(warp::reject::not_found)?;
        let credentials = self
            .generator
            .generate_credentials(&self.node_address, payment.id);
        let body = ConnectionResponse {
            id: connection_id,
            ilp_address: credentials.ilp_address.to_string(),
            shared_secret: base64::encode_config(
                &credentials.shared_secret,
                base64::URL_SAFE_NO_PAD,
            ),
            asset_code: asset.code,
            asset_scale: asset.scale,
        };
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .body(serde_json::to_string(&body).unwrap_or_default())
            .unwrap_or_else(|_| Response::new(String::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::str::FromStr;
    use streampay_payments::store::InMemoryStore;
    use streampay_payments::{Asset, IncomingPayment, WalletAddress};

    const BASE_URL: &str = "https://wallet.example";

    async fn server() -> (SpspServer<InMemoryStore>, InMemoryStore, Asset) {
        let store = InMemoryStore::new();
        let asset = Asset::new("XRP", 9);
        store.insert_asset(asset.clone()).await.unwrap();
        let server = SpspServer::new(
            store.clone(),
            ConnectionGenerator::new(&[4u8; 32]),
            Address::from_str("test.node").unwrap(),
            BASE_URL,
        );
        (server, store, asset)
    }

    #[tokio::test]
    async fn spsp_query_returns_stream_credentials() {
        let (server, store, asset) = server().await;
        let wallet = WalletAddress::new(format!("{}/alice", BASE_URL), asset.id);
        store.insert_wallet_address(wallet.clone()).await.unwrap();

        let response = warp::test::request()
            .method("GET")
            .path("/alice")
            .header("Accept", SPSP_CONTENT_TYPE)
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            SPSP_CONTENT_TYPE
        );
        assert_eq!(response.headers().get("cache-control").unwrap(), "max-age=60");

        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        let secret = base64::decode_config(
            body["shared_secret"].as_str().unwrap(),
            base64::URL_SAFE_NO_PAD,
        )
        .unwrap();
        assert_eq!(secret.len(), 32);
        let destination =
            Address::from_str(body["destination_account"].as_str().unwrap()).unwrap();
        // the destination encodes the wallet address id
        assert_eq!(
            ConnectionGenerator::new(&[4u8; 32]).decode_tag(&destination),
            Some(wallet.id)
        );
        assert_eq!(body["asset"]["code"], "XRP");
        assert_eq!(body["asset"]["scale"], 9);
    }

    #[tokio::test]
    async fn spsp_query_requires_the_accept_header() {
        let (server, store, asset) = server().await;
        let wallet = WalletAddress::new(format!("{}/alice", BASE_URL), asset.id);
        store.insert_wallet_address(wallet).await.unwrap();

        let response = warp::test::request()
            .method("GET")
            .path("/alice")
            .header("Accept", "text/html")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn unknown_wallets_are_not_found() {
        let (server, _, _) = server().await;
        let response = warp::test::request()
            .method("GET")
            .path("/nobody")
            .header("Accept", SPSP_CONTENT_TYPE)
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), 404);
    }

    #[tokio::test]
    async fn connection_resource_serves_active_payments_only() {
        let (server, store, asset) = server().await;
        let wallet = WalletAddress::new(format!("{}/alice", BASE_URL), asset.id);
        store.insert_wallet_address(wallet.clone()).await.unwrap();
        let payment = IncomingPayment::new(
            wallet.id,
            asset.id,
            Some(100),
            Utc::now() + Duration::minutes(10),
            None,
        );
        let connection_id = payment.connection_id.unwrap();
        store.insert_incoming_payment(payment.clone()).await.unwrap();

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/connections/{}", connection_id))
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["assetCode"], "XRP");
        assert_eq!(
            body["id"].as_str().unwrap(),
            connection_id.to_string()
        );

        // completing the payment severs the connection
        let mut completed = payment;
        completed.complete(Utc::now());
        store.update_incoming_payment(completed).await.unwrap();
        let response = warp::test::request()
            .method("GET")
            .path(&format!("/connections/{}", connection_id))
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), 404);
    }
}
