//! # streampay-node
//!
//! The runnable node: configuration, wiring of the ledger, stores, pipeline
//! and workers, plus the served HTTP surfaces (ILP-over-HTTP, SPSP and
//! connections, admin).

mod admin;
mod config;
mod ilp_http;
mod node;

pub use self::admin::AdminServer;
pub use self::config::Config;
pub use self::ilp_http::IlpHttpServer;
pub use self::node::StreampayNode;
