//! ## Stratum Server Core
//!
//! A long-lived TCP (optionally TLS) service that accepts miner
//! connections, distributes freshly-minted mining jobs from the job bus,
//! and funnels submitted shares into the downstream Kafka streams.
//!
//! The concurrency model is a single-threaded dispatch loop that owns all
//! mutable server state ([`server::core::ServerCore`]), with background
//! tasks for the per-chain job consumers, the user directory, and session
//! I/O that only reach that state through [`server::core::Dispatcher`].

pub mod config;
pub mod error;
pub mod jobs;
pub mod kafka;
pub mod metrics;
pub mod server;
pub mod session_id;
pub mod status;
pub mod stratum;
pub mod task_manager;
pub mod users;
pub mod utils;
pub mod zk;

pub use config::SserverConfig;
pub use error::{SserverError, SserverResult};
pub use server::StratumServer;
