//! Turns a receiver URL (local or remote, connection or incoming payment)
//! into live STREAM credentials plus whatever the resource exposes about
//! amounts and expiry.

use crate::store::{AssetStore, EventStore, IncomingPaymentStore, WalletAddressStore};
use crate::{Amount, IncomingPayment, WebhookEvent, WebhookEventType};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;
use streampay_packet::Address;
use streampay_stream::ConnectionGenerator;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Incoming payments created on behalf of a sender default to expiring a day
/// out unless the caller says otherwise.
const DEFAULT_INCOMING_EXPIRY_HOURS: i64 = 24;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReceiverError {
    #[error("unknown wallet address")]
    UnknownWalletAddress,
    #[error("invalid receiver")]
    InvalidReceiver,
    #[error("remote call failed: {0}")]
    Remote(String),
}

/// A resolved receiver: everything the quote engine and the pay step need.
#[derive(Debug, Clone)]
pub struct Receiver {
    pub url: String,
    pub asset_code: String,
    pub asset_scale: u8,
    pub ilp_address: Address,
    pub shared_secret: [u8; 32],
    pub incoming_amount: Option<Amount>,
    pub received_amount: Option<Amount>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Receiver {
    /// How much the receiver can still accept, when it advertises a target.
    pub fn remaining_receivable(&self) -> Option<u64> {
        let incoming = self.incoming_amount.as_ref()?;
        let received = self
            .received_amount
            .as_ref()
            .map(|amount| amount.value)
            .unwrap_or(0);
        Some(incoming.value.saturating_sub(received))
    }
}

#[async_trait]
pub trait ReceiverResolver: Send + Sync {
    /// Returns None when the URL does not lead to a payable receiver
    /// (unknown, terminal, or any remote step failed).
    async fn resolve(&self, url: &str) -> Option<Receiver>;

    /// Creates an incoming payment under the given wallet address and
    /// returns it as a receiver.
    async fn create_receiver(
        &self,
        wallet_address_url: &str,
        incoming_amount: Option<Amount>,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Receiver, ReceiverError>;
}

// ---- Open Payments resources ----------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletAddressResource {
    pub id: String,
    pub auth_server: String,
    pub asset_code: String,
    pub asset_scale: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionResource {
    pub id: String,
    pub ilp_address: Address,
    pub shared_secret: String,
    pub asset_code: String,
    pub asset_scale: u8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingPaymentResource {
    pub id: String,
    #[serde(default)]
    pub incoming_amount: Option<Amount>,
    #[serde(default)]
    pub received_amount: Option<Amount>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub ilp_stream_connection: ConnectionResource,
}

fn receiver_from_connection(
    url: String,
    connection: &ConnectionResource,
    incoming_amount: Option<Amount>,
    received_amount: Option<Amount>,
    expires_at: Option<DateTime<Utc>>,
) -> Option<Receiver> {
    let secret = base64::decode_config(&connection.shared_secret, base64::URL_SAFE_NO_PAD)
        .or_else(|_| base64::decode(&connection.shared_secret))
        .ok()?;
    if secret.len() != 32 {
        return None;
    }
    let mut shared_secret = [0u8; 32];
    shared_secret.copy_from_slice(&secret);
    Some(Receiver {
        url,
        asset_code: connection.asset_code.clone(),
        asset_scale: connection.asset_scale,
        ilp_address: connection.ilp_address.clone(),
        shared_secret,
        incoming_amount,
        received_amount,
        expires_at,
    })
}

// ---- Grant cache -----------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: GrantAccessToken,
}

#[derive(Debug, Deserialize)]
struct GrantAccessToken {
    value: String,
    manage: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedGrant {
    access_token: String,
    manage_url: String,
    expires_at: Option<Instant>,
}

impl CachedGrant {
    fn from_response(response: GrantResponse) -> Self {
        CachedGrant {
            access_token: response.access_token.value,
            manage_url: response.access_token.manage,
            expires_at: response
                .access_token
                .expires_in
                .map(|seconds| Instant::now() + std::time::Duration::from_secs(seconds)),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |at| at <= Instant::now())
    }
}

/// Requests, caches and rotates authorization-server grants for remote
/// resource access. Keyed by `(auth server, access type, actions)`.
///
/// An expired grant is rotated through its manage URL; if rotation fails the
/// entry is evicted and the caller sees no grant rather than a fresh
/// request, so repeated resolution stays deterministic.
pub struct GrantCache {
    http: reqwest::Client,
    grants: Mutex<HashMap<(String, String, String), CachedGrant>>,
}

impl GrantCache {
    pub fn new(http: reqwest::Client) -> Self {
        GrantCache {
            http,
            grants: Mutex::new(HashMap::new()),
        }
    }

    async fn get(
        &self,
        auth_server: &str,
        access_type: &str,
        actions: &[&str],
    ) -> Option<String> {
        let key = (
            auth_server.to_string(),
            access_type.to_string(),
            actions.join(","),
        );
        let cached = self.grants.lock().get(&key).cloned();
        match cached {
            Some(grant) if !grant.is_expired() => Some(grant.access_token),
            Some(grant) => match self.rotate(&grant).await {
                Some(rotated) => {
                    let token = rotated.access_token.clone();
                    self.grants.lock().insert(key, rotated);
                    Some(token)
                }
                None => {
                    warn!("Grant rotation failed, evicting cached grant");
                    self.grants.lock().remove(&key);
                    None
                }
            },
            None => {
                let grant = self.request(auth_server, access_type, actions).await?;
                let token = grant.access_token.clone();
                self.grants.lock().insert(key, grant);
                Some(token)
            }
        }
    }

    async fn request(
        &self,
        auth_server: &str,
        access_type: &str,
        actions: &[&str],
    ) -> Option<CachedGrant> {
        let body = serde_json::json!({
            "access_token": {
                "access": [{ "type": access_type, "actions": actions }]
            }
        });
        let response = self
            .http
            .post(auth_server)
            .json(&body)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            warn!(
                "Auth server {} refused grant request: {}",
                auth_server,
                response.status()
            );
            return None;
        }
        let grant: GrantResponse = response.json().await.ok()?;
        Some(CachedGrant::from_response(grant))
    }

    async fn rotate(&self, grant: &CachedGrant) -> Option<CachedGrant> {
        let response = self
            .http
            .post(&grant.manage_url)
            .bearer_auth(&grant.access_token)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let rotated: GrantResponse = response.json().await.ok()?;
        Some(CachedGrant::from_response(rotated))
    }
}

// ---- The resolver ----------------------------------------------------------

/// Resolves receiver URLs, serving local ones straight from the store and
/// remote ones over Open Payments.
pub struct ReceiverService<S> {
    store: S,
    generator: ConnectionGenerator,
    node_address: Address,
    open_payments_url: String,
    http: reqwest::Client,
    grants: GrantCache,
}

impl<S> ReceiverService<S>
where
    S: WalletAddressStore + IncomingPaymentStore + AssetStore + EventStore + Clone,
{
    pub fn new(
        store: S,
        generator: ConnectionGenerator,
        node_address: Address,
        open_payments_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::new();
        ReceiverService {
            store,
            generator,
            node_address,
            open_payments_url: open_payments_url.into().trim_end_matches('/').to_string(),
            grants: GrantCache::new(http.clone()),
            http,
        }
    }

    async fn local_receiver(&self, url: &str, payment: &IncomingPayment) -> Option<Receiver> {
        if payment.is_terminal() {
            return None;
        }
        let asset = self.store.get_asset(payment.asset_id).await?;
        let credentials = self
            .generator
            .generate_credentials(&self.node_address, payment.id);
        Some(Receiver {
            url: url.to_string(),
            asset_code: asset.code.clone(),
            asset_scale: asset.scale,
            ilp_address: credentials.ilp_address,
            shared_secret: credentials.shared_secret,
            incoming_amount: payment
                .incoming_amount
                .map(|value| Amount::new(value, asset.code.clone(), asset.scale)),
            received_amount: Some(Amount::new(
                payment.received_amount,
                asset.code,
                asset.scale,
            )),
            expires_at: Some(payment.expires_at),
        })
    }

    async fn resolve_local(&self, url: &str) -> Option<Option<Receiver>> {
        // connection URLs live under our Open Payments origin
        let connections_prefix = format!("{}/connections/", self.open_payments_url);
        if let Some(connection_id) = url.strip_prefix(&connections_prefix) {
            let connection_id = Uuid::from_str(connection_id).ok()?;
            let payment = self
                .store
                .get_incoming_payment_by_connection(connection_id)
                .await?;
            return Some(self.local_receiver(url, &payment).await);
        }

        // incoming-payment URLs live under a local wallet address
        let wallet = self.store.find_wallet_address_for_url(url).await?;
        let payments_prefix = format!("{}/incoming-payments/", wallet.url);
        let payment_id = Uuid::from_str(url.strip_prefix(&payments_prefix)?).ok()?;
        let payment = self.store.get_incoming_payment(payment_id).await?;
        if payment.wallet_address_id != wallet.id {
            return Some(None);
        }
        Some(self.local_receiver(url, &payment).await)
    }

    async fn resolve_remote(&self, url: &str) -> Option<Receiver> {
        if url.contains("/connections/") {
            let connection: ConnectionResource = self
                .http
                .get(url)
                .send()
                .await
                .ok()?
                .error_for_status()
                .ok()?
                .json()
                .await
                .ok()?;
            return receiver_from_connection(url.to_string(), &connection, None, None, None);
        }

        // {wallet}/incoming-payments/{id}: authenticate against the wallet's
        // auth server, then read the resource
        let wallet_url = url.split("/incoming-payments/").next()?;
        let wallet = self.fetch_wallet_address(wallet_url).await?;
        let token = self
            .grants
            .get(&wallet.auth_server, "incoming-payment", &["read-all"])
            .await?;
        let resource: IncomingPaymentResource = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()?;
        if resource.completed {
            return None;
        }
        if let Some(expires_at) = resource.expires_at {
            if expires_at <= Utc::now() {
                return None;
            }
        }
        receiver_from_connection(
            url.to_string(),
            &resource.ilp_stream_connection,
            resource.incoming_amount,
            resource.received_amount,
            resource.expires_at,
        )
    }

    async fn fetch_wallet_address(&self, url: &str) -> Option<WalletAddressResource> {
        self.http
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?
            .json()
            .await
            .ok()
    }

    async fn create_local(
        &self,
        wallet_address_url: &str,
        incoming_amount: Option<Amount>,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Receiver, ReceiverError> {
        let wallet = self
            .store
            .get_wallet_address_by_url(wallet_address_url)
            .await
            .ok_or(ReceiverError::UnknownWalletAddress)?;
        if !wallet.is_active(Utc::now()) {
            return Err(ReceiverError::UnknownWalletAddress);
        }
        let asset = self
            .store
            .get_asset(wallet.asset_id)
            .await
            .ok_or(ReceiverError::InvalidReceiver)?;
        if let Some(ref amount) = incoming_amount {
            if amount.asset_code != asset.code || amount.asset_scale != asset.scale {
                return Err(ReceiverError::InvalidReceiver);
            }
        }

        let payment = IncomingPayment::new(
            wallet.id,
            wallet.asset_id,
            incoming_amount.as_ref().map(|amount| amount.value),
            expires_at.unwrap_or_else(|| Utc::now() + Duration::hours(DEFAULT_INCOMING_EXPIRY_HOURS)),
            metadata,
        );
        let url = format!("{}/incoming-payments/{}", wallet.url, payment.id);
        self.store
            .insert_incoming_payment(payment.clone())
            .await
            .map_err(|err| ReceiverError::Remote(err.to_string()))?;
        self.store
            .enqueue_event(WebhookEvent::new(
                WebhookEventType::IncomingPaymentCreated,
                serde_json::json!({
                    "id": payment.id,
                    "walletAddressId": wallet.id,
                    "incomingAmount": incoming_amount,
                }),
            ))
            .await
            .ok();
        debug!("Created local incoming payment {}", payment.id);

        self.local_receiver(&url, &payment)
            .await
            .ok_or(ReceiverError::InvalidReceiver)
    }

    async fn create_remote(
        &self,
        wallet_address_url: &str,
        incoming_amount: Option<Amount>,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Receiver, ReceiverError> {
        let wallet = self
            .fetch_wallet_address(wallet_address_url)
            .await
            .ok_or(ReceiverError::UnknownWalletAddress)?;
        let token = self
            .grants
            .get(&wallet.auth_server, "incoming-payment", &["create", "read-all"])
            .await
            .ok_or_else(|| ReceiverError::Remote("no grant".to_string()))?;

        let body = serde_json::json!({
            "walletAddress": wallet.id,
            "incomingAmount": incoming_amount,
            "expiresAt": expires_at,
            "metadata": metadata,
        });
        let response = self
            .http
            .post(&format!("{}/incoming-payments", wallet_address_url))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|err| ReceiverError::Remote(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ReceiverError::Remote(format!(
                "incoming payment creation returned {}",
                response.status()
            )));
        }
        let resource: IncomingPaymentResource = response
            .json()
            .await
            .map_err(|err| ReceiverError::Remote(err.to_string()))?;
        receiver_from_connection(
            resource.id.clone(),
            &resource.ilp_stream_connection,
            resource.incoming_amount,
            resource.received_amount,
            resource.expires_at,
        )
        .ok_or(ReceiverError::InvalidReceiver)
    }

    fn is_local(&self, url: &str) -> bool {
        url.starts_with(&self.open_payments_url)
    }
}

#[async_trait]
impl<S> ReceiverResolver for ReceiverService<S>
where
    S: WalletAddressStore + IncomingPaymentStore + AssetStore + EventStore + Clone + Send + Sync,
{
    async fn resolve(&self, url: &str) -> Option<Receiver> {
        if self.is_local(url) {
            self.resolve_local(url).await.flatten()
        } else {
            self.resolve_remote(url).await
        }
    }

    async fn create_receiver(
        &self,
        wallet_address_url: &str,
        incoming_amount: Option<Amount>,
        expires_at: Option<DateTime<Utc>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<Receiver, ReceiverError> {
        if self.is_local(wallet_address_url) {
            self.create_local(wallet_address_url, incoming_amount, expires_at, metadata)
                .await
        } else {
            self.create_remote(wallet_address_url, incoming_amount, expires_at, metadata)
                .await
        }
    }
}
