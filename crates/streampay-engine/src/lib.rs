//! # streampay-engine
//!
//! The moving parts above the domain model: the outgoing-payment lifecycle
//! state machine and its polling worker, the credit hooks that advance
//! incoming payments and wallet addresses when money lands, the webhook
//! dispatcher, and the idempotent liquidity operations the account-servicing
//! entity drives the ledger with.

mod hooks;
mod lifecycle;
mod liquidity;
mod webhooks;
mod workers;

pub use self::hooks::{register_credit_hooks, IncomingPaymentHook, WebMonetizationHook};
pub use self::lifecycle::{
    CreateOutgoingPaymentParams, FundParams, LifecycleConfig, OutgoingPaymentError,
    OutgoingPaymentService, PaymentStore, SenderFactory, MAX_STATE_ATTEMPTS,
    RETRY_BACKOFF_SECONDS,
};
pub use self::liquidity::{LiquidityError, LiquidityOp, LiquidityResponse, LiquidityService};
pub use self::webhooks::{WebhookConfig, WebhookDispatcher};
pub use self::workers::{
    IncomingPaymentExpiryWorker, OutgoingPaymentWorker, WalletAddressWorker, WorkerHandle,
};
