use streampay_packet::Prepare;
use streampay_payments::{IncomingPayment, Peer, WalletAddress};
use uuid::Uuid;

/// Where a packet entered this node: an authenticated peer link, or one of
/// our own outgoing payments acting as the money source.
#[derive(Debug, Clone)]
pub struct SourceAccount {
    /// The ledger account debited for this packet
    pub account_id: Uuid,
    pub asset_code: String,
    pub asset_scale: u8,
    /// Present when the source is a peer; limits and ILDCP only apply then
    pub peer: Option<Peer>,
}

impl SourceAccount {
    pub fn from_peer(peer: Peer, asset_code: impl Into<String>, asset_scale: u8) -> Self {
        SourceAccount {
            account_id: peer.id,
            asset_code: asset_code.into(),
            asset_scale,
            peer: Some(peer),
        }
    }

    pub fn internal(account_id: Uuid, asset_code: impl Into<String>, asset_scale: u8) -> Self {
        SourceAccount {
            account_id,
            asset_code: asset_code.into(),
            asset_scale,
            peer: None,
        }
    }
}

/// The account a packet is leaving through (or terminating at).
#[derive(Debug, Clone)]
pub enum OutgoingAccount {
    /// Terminates locally at an incoming payment
    IncomingPayment(IncomingPayment),
    /// Terminates locally at a wallet address's web-monetization account
    WalletAddress(WalletAddress),
    /// Forwarded onward to a peer
    Peer(Peer),
}

impl OutgoingAccount {
    pub fn ledger_account_id(&self) -> Uuid {
        match self {
            OutgoingAccount::IncomingPayment(payment) => payment.id,
            OutgoingAccount::WalletAddress(wallet) => wallet.id,
            OutgoingAccount::Peer(peer) => peer.id,
        }
    }

    pub fn is_local(&self) -> bool {
        !matches!(self, OutgoingAccount::Peer(_))
    }
}

/// Mutable state shared by every stage while one packet is in flight.
pub struct PacketContext {
    pub prepare: Prepare,
    pub source: SourceAccount,
    /// Tag recovered from a STREAM-encoded destination, if any
    pub stream_destination: Option<Uuid>,
    pub outgoing: Option<OutgoingAccount>,
    /// Destination-side amount after any currency conversion
    pub destination_amount: u64,
    /// The packet's pending two-phase transfer, once reserved
    pub transfer_id: Option<Uuid>,
    /// Tokens charged against the source peer's throughput bucket
    pub throughput_charged: u64,
}

impl PacketContext {
    pub fn new(source: SourceAccount, prepare: Prepare) -> Self {
        let destination_amount = prepare.amount();
        PacketContext {
            prepare,
            source,
            stream_destination: None,
            outgoing: None,
            destination_amount,
            transfer_id: None,
            throughput_charged: 0,
        }
    }

    pub fn outgoing(&self) -> &OutgoingAccount {
        self.outgoing
            .as_ref()
            .expect("outgoing account is resolved before any stage that reads it")
    }
}
