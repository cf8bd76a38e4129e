//! Multi-chain DAO governance monitor.
//!
//! Scans registered governor and token contracts on several EVM chains,
//! folds their events into per-proposal and per-voter analytics, flags
//! suspicious voting and publishes snapshots to a TTL cache.

pub mod analytics;
pub mod anomaly;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod onchain;
pub mod store;

pub use config::Config;
pub use coordinator::{ChainStatus, MonitorCoordinator, MonitorError, RealtimeStats};
