//! # streampay-payments
//!
//! The payment domain of the engine: assets, peers, wallet addresses,
//! incoming payments, quotes, outgoing payments and their grants, plus the
//! quote engine and the resolver that turns receiver URLs into live STREAM
//! credentials.
//!
//! Persistence is behind async store traits; [`store::InMemoryStore`] is the
//! reference backend.

pub mod amount;
pub mod asset;
pub mod events;
pub mod grant;
pub mod incoming;
pub mod peer;
pub mod quote;
pub mod rates;
pub mod receiver;
pub mod store;
pub mod wallet_address;

pub use self::amount::Amount;
pub use self::asset::{Asset, Fee, FeeType};
pub use self::events::{EventWithdrawal, WebhookEvent, WebhookEventType};
pub use self::grant::{Grant, GrantLimits, RepeatingInterval};
pub use self::incoming::{IncomingPayment, IncomingPaymentState};
pub use self::peer::{Peer, PeerHttp};
pub use self::quote::{CreateQuoteParams, Quote, QuoteConfig, QuoteError, QuoteService};
pub use self::rates::{RateError, RateProvider, RateService};
pub use self::receiver::{Receiver, ReceiverError, ReceiverResolver, ReceiverService};
pub use self::wallet_address::WalletAddress;

/// Outgoing-payment rows live beside the rest of the domain model.
pub mod outgoing;
pub use self::outgoing::{OutgoingPayment, OutgoingPaymentState};
