use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::time::Duration;
use streampay_packet::Address;
use uuid::Uuid;

/// How long we will hold a packet for this peer before the expiry guard
/// refuses to forward it.
pub const DEFAULT_MAX_HOLD_TIME: Duration = Duration::from_secs(30);

/// ILP-over-HTTP details for a peer: the token it must present to us and the
/// token plus endpoint we use toward it.
#[derive(Clone)]
pub struct PeerHttp {
    pub incoming_token: SecretString,
    pub outgoing_token: SecretString,
    pub outgoing_endpoint: String,
}

/// A counterparty on the Interledger network. Owns a ledger liquidity
/// account; `static_ilp_address` is the routing prefix for traffic in both
/// directions.
#[derive(Clone)]
pub struct Peer {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub static_ilp_address: Address,
    pub http: PeerHttp,
    pub max_packet_amount: Option<u64>,
    /// Incoming rate limit, packets per second
    pub packets_per_second: Option<u32>,
    /// Throughput limit in asset units per second, applied in both directions
    pub amount_per_second: Option<u64>,
    pub max_hold_time: Duration,
    /// When set, a liquidity webhook fires once the peer's balance falls to
    /// or below this value
    pub liquidity_threshold: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("asset_id", &self.asset_id)
            .field("static_ilp_address", &self.static_ilp_address)
            .field("max_packet_amount", &self.max_packet_amount)
            .finish()
    }
}
