//! # streampay-stream
//!
//! The STREAM transport layer of the engine.
//!
//! The receiving half derives per-connection credentials from a single server
//! secret ([`ConnectionGenerator`]) and fulfills incoming money packets
//! ([`receive_money`]). The sending half ([`pay`]) drives a quoted payment
//! through an [`IlpSender`], enforcing the quote's minimum exchange rate and
//! classifying failures into retryable and fatal kinds.

pub mod crypto;
mod error;
mod packet;
mod receiver;
mod sender;

pub use self::error::PaymentError;
pub use self::packet::{
    ConnectionAssetDetailsFrame, ConnectionCloseFrame, ConnectionNewAddressFrame, Frame,
    StreamCloseFrame, StreamErrorCode, StreamMaxMoneyFrame, StreamMoneyFrame, StreamPacket,
    StreamPacketBuilder,
};
pub use self::receiver::{receive_money, ConnectionGenerator, ReceiveParams, StreamCredentials};
pub use self::sender::{pay, IlpSender, PayResult, PaymentOutcome, PaymentPlan};
