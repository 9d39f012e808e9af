//! # streampay-packet
//!
//! Interledger packet serialization/deserialization.
//!
//! Implements the ILPv4 Prepare/Fulfill/Reject framing used on every link
//! between this engine and its peers, plus the address and error-code types
//! shared by the rest of the workspace.

mod address;
mod error;
pub mod oer;
mod packet;

pub use self::address::{Address, AddressError};
pub use self::error::{ErrorClass, ErrorCode};
pub use self::packet::{
    Fulfill, FulfillBuilder, MaxPacketAmountDetails, Packet, PacketType, ParseError, Prepare,
    PrepareBuilder, Reject, RejectBuilder,
};
