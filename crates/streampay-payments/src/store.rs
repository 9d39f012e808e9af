//! Store traits for the payment domain and the in-memory reference backend.
//!
//! Every trait is async so a relational backend can slot in behind the same
//! seams. The in-memory backend keeps each table behind one `RwLock`, which
//! is also what stands in for transactional atomicity: helpers that must be
//! atomic (claiming a payment, reserving an idempotency key) take the lock
//! once for the whole step.

use crate::{
    Asset, Fee, FeeType, IncomingPayment, IncomingPaymentState, OutgoingPayment,
    OutgoingPaymentState, Peer, Quote, WalletAddress, WebhookEvent,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use secrecy::ExposeSecret;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use streampay_packet::Address;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("quote is already consumed")]
    DuplicateQuote,
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn insert_asset(&self, asset: Asset) -> Result<(), StoreError>;
    async fn get_asset(&self, id: Uuid) -> Option<Asset>;
    async fn update_asset(&self, asset: Asset) -> Result<(), StoreError>;
    async fn get_fee(&self, asset_id: Uuid, kind: FeeType) -> Option<Fee>;
    async fn set_fee(&self, asset_id: Uuid, kind: FeeType, fee: Fee) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn insert_peer(&self, peer: Peer) -> Result<(), StoreError>;
    async fn get_peer(&self, id: Uuid) -> Option<Peer>;
    async fn delete_peer(&self, id: Uuid) -> Result<(), StoreError>;
    /// Authenticates an inbound ILP-over-HTTP request.
    async fn get_peer_by_incoming_token(&self, token: &str) -> Option<Peer>;
    /// Longest static-address prefix match for an outbound destination.
    async fn route_to_peer(&self, destination: &Address) -> Option<Peer>;
}

#[async_trait]
pub trait WalletAddressStore: Send + Sync {
    async fn insert_wallet_address(&self, wallet: WalletAddress) -> Result<(), StoreError>;
    async fn get_wallet_address(&self, id: Uuid) -> Option<WalletAddress>;
    async fn get_wallet_address_by_url(&self, url: &str) -> Option<WalletAddress>;
    /// Finds the wallet address whose URL prefixes `url` (for resource URLs
    /// like `{wallet}/incoming-payments/{id}`).
    async fn find_wallet_address_for_url(&self, url: &str) -> Option<WalletAddress>;
    async fn update_wallet_address(&self, wallet: WalletAddress) -> Result<(), StoreError>;
    async fn wallet_addresses_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<WalletAddress>;
}

#[async_trait]
pub trait IncomingPaymentStore: Send + Sync {
    async fn insert_incoming_payment(&self, payment: IncomingPayment) -> Result<(), StoreError>;
    async fn get_incoming_payment(&self, id: Uuid) -> Option<IncomingPayment>;
    async fn get_incoming_payment_by_connection(
        &self,
        connection_id: Uuid,
    ) -> Option<IncomingPayment>;
    async fn update_incoming_payment(&self, payment: IncomingPayment) -> Result<(), StoreError>;
    async fn incoming_payments_due_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<IncomingPayment>;
}

#[async_trait]
pub trait QuoteStore: Send + Sync {
    async fn insert_quote(&self, quote: Quote) -> Result<(), StoreError>;
    async fn get_quote(&self, id: Uuid) -> Option<Quote>;
}

#[async_trait]
pub trait OutgoingPaymentStore: Send + Sync {
    /// Fails with `DuplicateQuote` when the quote was consumed by an earlier
    /// payment (quotes are single-use).
    async fn insert_outgoing_payment(&self, payment: OutgoingPayment) -> Result<(), StoreError>;
    async fn get_outgoing_payment(&self, id: Uuid) -> Option<OutgoingPayment>;
    async fn update_outgoing_payment(&self, payment: OutgoingPayment) -> Result<(), StoreError>;
    /// Claims one due Sending payment for exclusive processing; the claim is
    /// held until `release_outgoing_payment`. Other workers skip claimed
    /// rows.
    async fn claim_due_outgoing_payment(&self, now: DateTime<Utc>) -> Option<OutgoingPayment>;
    async fn release_outgoing_payment(&self, id: Uuid);
    async fn outgoing_payments_for_grant(&self, grant_id: Uuid) -> Vec<OutgoingPayment>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn enqueue_event(&self, event: WebhookEvent) -> Result<(), StoreError>;
    async fn get_event(&self, id: Uuid) -> Option<WebhookEvent>;
    async fn update_event(&self, event: WebhookEvent) -> Result<(), StoreError>;
    async fn events_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<WebhookEvent>;
    async fn delete_event(&self, id: Uuid) -> Result<(), StoreError>;
}

/// A stored response for an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotentRecord {
    pub input_hash: [u8; 32],
    pub status: u16,
    pub body: String,
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn load_idempotent_record(&self, key: &str) -> Option<IdempotentRecord>;
    async fn save_idempotent_record(&self, key: String, record: IdempotentRecord);
}

/// Serializes mutations across payments sharing an authorization grant.
#[async_trait]
pub trait GrantLockStore: Send + Sync {
    /// Insert-or-select-for-update on the grant row.
    async fn lock_grant(&self, grant_id: Uuid) -> tokio::sync::OwnedMutexGuard<()>;
}

#[derive(Default)]
struct Tables {
    assets: RwLock<HashMap<Uuid, Asset>>,
    fees: RwLock<HashMap<(Uuid, FeeType), Fee>>,
    peers: RwLock<HashMap<Uuid, Peer>>,
    wallet_addresses: RwLock<HashMap<Uuid, WalletAddress>>,
    incoming_payments: RwLock<HashMap<Uuid, IncomingPayment>>,
    quotes: RwLock<HashMap<Uuid, Quote>>,
    outgoing_payments: RwLock<HashMap<Uuid, OutgoingPayment>>,
    consumed_quotes: RwLock<HashSet<Uuid>>,
    claimed_payments: Mutex<HashSet<Uuid>>,
    events: RwLock<HashMap<Uuid, WebhookEvent>>,
    idempotency: RwLock<HashMap<String, IdempotentRecord>>,
    grant_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// The in-memory reference store.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for InMemoryStore {
    async fn insert_asset(&self, asset: Asset) -> Result<(), StoreError> {
        let mut assets = self.tables.assets.write();
        if assets.contains_key(&asset.id) {
            return Err(StoreError::Conflict(format!("asset {}", asset.id)));
        }
        assets.insert(asset.id, asset);
        Ok(())
    }

    async fn get_asset(&self, id: Uuid) -> Option<Asset> {
        self.tables.assets.read().get(&id).cloned()
    }

    async fn update_asset(&self, asset: Asset) -> Result<(), StoreError> {
        let mut assets = self.tables.assets.write();
        if !assets.contains_key(&asset.id) {
            return Err(StoreError::NotFound);
        }
        assets.insert(asset.id, asset);
        Ok(())
    }

    async fn get_fee(&self, asset_id: Uuid, kind: FeeType) -> Option<Fee> {
        self.tables.fees.read().get(&(asset_id, kind)).copied()
    }

    async fn set_fee(&self, asset_id: Uuid, kind: FeeType, fee: Fee) -> Result<(), StoreError> {
        if !self.tables.assets.read().contains_key(&asset_id) {
            return Err(StoreError::NotFound);
        }
        self.tables.fees.write().insert((asset_id, kind), fee);
        Ok(())
    }
}

#[async_trait]
impl PeerStore for InMemoryStore {
    async fn insert_peer(&self, peer: Peer) -> Result<(), StoreError> {
        let mut peers = self.tables.peers.write();
        if peers.contains_key(&peer.id) {
            return Err(StoreError::Conflict(format!("peer {}", peer.id)));
        }
        peers.insert(peer.id, peer);
        Ok(())
    }

    async fn get_peer(&self, id: Uuid) -> Option<Peer> {
        self.tables.peers.read().get(&id).cloned()
    }

    async fn delete_peer(&self, id: Uuid) -> Result<(), StoreError> {
        self.tables
            .peers
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }

    async fn get_peer_by_incoming_token(&self, token: &str) -> Option<Peer> {
        self.tables
            .peers
            .read()
            .values()
            .find(|peer| peer.http.incoming_token.expose_secret() == token)
            .cloned()
    }

    async fn route_to_peer(&self, destination: &Address) -> Option<Peer> {
        let peers = self.tables.peers.read();
        let destination: &[u8] = destination.as_ref();
        let mut best: Option<&Peer> = None;
        for peer in peers.values() {
            let prefix: &[u8] = peer.static_ilp_address.as_ref();
            if destination.starts_with(prefix)
                && best.map_or(true, |current| {
                    prefix.len() > current.static_ilp_address.len()
                })
            {
                best = Some(peer);
            }
        }
        best.cloned()
    }
}

#[async_trait]
impl WalletAddressStore for InMemoryStore {
    async fn insert_wallet_address(&self, wallet: WalletAddress) -> Result<(), StoreError> {
        let mut wallets = self.tables.wallet_addresses.write();
        if wallets.values().any(|existing| existing.url == wallet.url) {
            return Err(StoreError::Conflict(wallet.url));
        }
        wallets.insert(wallet.id, wallet);
        Ok(())
    }

    async fn get_wallet_address(&self, id: Uuid) -> Option<WalletAddress> {
        self.tables.wallet_addresses.read().get(&id).cloned()
    }

    async fn get_wallet_address_by_url(&self, url: &str) -> Option<WalletAddress> {
        self.tables
            .wallet_addresses
            .read()
            .values()
            .find(|wallet| wallet.url == url)
            .cloned()
    }

    async fn find_wallet_address_for_url(&self, url: &str) -> Option<WalletAddress> {
        self.tables
            .wallet_addresses
            .read()
            .values()
            .find(|wallet| url == wallet.url || url.starts_with(&format!("{}/", wallet.url)))
            .cloned()
    }

    async fn update_wallet_address(&self, wallet: WalletAddress) -> Result<(), StoreError> {
        let mut wallets = self.tables.wallet_addresses.write();
        if !wallets.contains_key(&wallet.id) {
            return Err(StoreError::NotFound);
        }
        wallets.insert(wallet.id, wallet);
        Ok(())
    }

    async fn wallet_addresses_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<WalletAddress> {
        self.tables
            .wallet_addresses
            .read()
            .values()
            .filter(|wallet| wallet.process_at.map_or(false, |at| at <= now))
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl IncomingPaymentStore for InMemoryStore {
    async fn insert_incoming_payment(&self, payment: IncomingPayment) -> Result<(), StoreError> {
        let mut payments = self.tables.incoming_payments.write();
        if payments.contains_key(&payment.id) {
            return Err(StoreError::Conflict(format!("incoming {}", payment.id)));
        }
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn get_incoming_payment(&self, id: Uuid) -> Option<IncomingPayment> {
        self.tables.incoming_payments.read().get(&id).cloned()
    }

    async fn get_incoming_payment_by_connection(
        &self,
        connection_id: Uuid,
    ) -> Option<IncomingPayment> {
        self.tables
            .incoming_payments
            .read()
            .values()
            .find(|payment| payment.connection_id == Some(connection_id))
            .cloned()
    }

    async fn update_incoming_payment(&self, payment: IncomingPayment) -> Result<(), StoreError> {
        let mut payments = self.tables.incoming_payments.write();
        if !payments.contains_key(&payment.id) {
            return Err(StoreError::NotFound);
        }
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn incoming_payments_due_expiry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<IncomingPayment> {
        self.tables
            .incoming_payments
            .read()
            .values()
            .filter(|payment| {
                matches!(
                    payment.state,
                    IncomingPaymentState::Pending | IncomingPaymentState::Processing
                ) && payment.expires_at <= now
            })
            .take(limit)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl QuoteStore for InMemoryStore {
    async fn insert_quote(&self, quote: Quote) -> Result<(), StoreError> {
        let mut quotes = self.tables.quotes.write();
        if quotes.contains_key(&quote.id) {
            return Err(StoreError::Conflict(format!("quote {}", quote.id)));
        }
        quotes.insert(quote.id, quote);
        Ok(())
    }

    async fn get_quote(&self, id: Uuid) -> Option<Quote> {
        self.tables.quotes.read().get(&id).cloned()
    }
}

#[async_trait]
impl OutgoingPaymentStore for InMemoryStore {
    async fn insert_outgoing_payment(&self, payment: OutgoingPayment) -> Result<(), StoreError> {
        // Take the quote consumption and the row insert together so two
        // racing creations cannot both pass the uniqueness check
        let mut consumed = self.tables.consumed_quotes.write();
        if consumed.contains(&payment.quote_id) {
            return Err(StoreError::DuplicateQuote);
        }
        let mut payments = self.tables.outgoing_payments.write();
        consumed.insert(payment.quote_id);
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn get_outgoing_payment(&self, id: Uuid) -> Option<OutgoingPayment> {
        self.tables.outgoing_payments.read().get(&id).cloned()
    }

    async fn update_outgoing_payment(&self, payment: OutgoingPayment) -> Result<(), StoreError> {
        let mut payments = self.tables.outgoing_payments.write();
        if !payments.contains_key(&payment.id) {
            return Err(StoreError::NotFound);
        }
        payments.insert(payment.id, payment);
        Ok(())
    }

    async fn claim_due_outgoing_payment(&self, now: DateTime<Utc>) -> Option<OutgoingPayment> {
        let payments = self.tables.outgoing_payments.read();
        let mut claimed = self.tables.claimed_payments.lock();
        let due = payments.values().find(|payment| {
            payment.state == OutgoingPaymentState::Sending
                && payment.process_at.map_or(false, |at| at <= now)
                && !claimed.contains(&payment.id)
        })?;
        claimed.insert(due.id);
        Some(due.clone())
    }

    async fn release_outgoing_payment(&self, id: Uuid) {
        self.tables.claimed_payments.lock().remove(&id);
    }

    async fn outgoing_payments_for_grant(&self, grant_id: Uuid) -> Vec<OutgoingPayment> {
        self.tables
            .outgoing_payments
            .read()
            .values()
            .filter(|payment| payment.grant_id == Some(grant_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn enqueue_event(&self, event: WebhookEvent) -> Result<(), StoreError> {
        self.tables.events.write().insert(event.id, event);
        Ok(())
    }

    async fn get_event(&self, id: Uuid) -> Option<WebhookEvent> {
        self.tables.events.read().get(&id).cloned()
    }

    async fn update_event(&self, event: WebhookEvent) -> Result<(), StoreError> {
        let mut events = self.tables.events.write();
        if !events.contains_key(&event.id) {
            return Err(StoreError::NotFound);
        }
        events.insert(event.id, event);
        Ok(())
    }

    async fn events_due(&self, now: DateTime<Utc>, limit: usize) -> Vec<WebhookEvent> {
        let mut due: Vec<WebhookEvent> = self
            .tables
            .events
            .read()
            .values()
            .filter(|event| event.process_at.map_or(false, |at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|event| event.created_at);
        due.truncate(limit);
        due
    }

    async fn delete_event(&self, id: Uuid) -> Result<(), StoreError> {
        self.tables
            .events
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn load_idempotent_record(&self, key: &str) -> Option<IdempotentRecord> {
        self.tables.idempotency.read().get(key).cloned()
    }

    async fn save_idempotent_record(&self, key: String, record: IdempotentRecord) {
        self.tables.idempotency.write().insert(key, record);
    }
}

#[async_trait]
impl GrantLockStore for InMemoryStore {
    async fn lock_grant(&self, grant_id: Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.tables.grant_locks.lock();
            locks
                .entry(grant_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}
