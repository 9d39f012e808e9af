//! # streampay-pipeline
//!
//! The per-packet state machine. Every inbound Prepare, whether it arrived
//! from a peer over ILP-over-HTTP or from this node's own pay loop, runs
//! through one fixed chain of stages sharing a mutable [`PacketContext`]:
//! stream-address decoding, account resolution, limits, the two-phase
//! balance reservation, local stream fulfillment or the outgoing peer link,
//! and fulfillment validation on the way back out.
//!
//! Stages return `Result<_, Reject>`; the chain driver is the single place
//! rejects are surfaced, and it guarantees the packet's ledger transfer is
//! posted or voided exactly once.

mod bucket;
mod context;
mod ildcp;
mod link;
mod pipeline;

pub use self::bucket::RateLimiter;
pub use self::context::{OutgoingAccount, PacketContext, SourceAccount};
pub use self::ildcp::{is_ildcp_request, IldcpResponse, ILDCP_DESTINATION};
pub use self::link::{HttpLink, OutgoingLink};
pub use self::pipeline::{Pipeline, PipelineConfig, PipelineSender, PipelineStore};

/// Result of handling one packet.
pub type IlpResult = Result<streampay_packet::Fulfill, streampay_packet::Reject>;
