//! Chain-side ingestion: from JSON-RPC blocks to decoded governance events.
//!
//! Architecture:
//! - `ChainConnection`: per-chain descriptor plus the monotonic scan cursor
//! - `ContractRegistry`: watched contracts and their event schemas
//! - `EventDecoder`: topic/data decoding of receipt logs against those schemas
//! - `BlockScanner`: polling passes over `(cursor, head]`, pushing events
//!   into the bounded ingest queue
//! - `LiveBlockFeed`: `newHeads` WebSocket subscription that triggers an
//!   immediate pass on every new head
//! - `ChainClient`: the JSON-RPC seam (`AlloyChainClient` in production,
//!   `MockChainClient` in tests)

pub mod abi;
pub mod chain;
pub mod decoder;
pub mod feed;
pub mod registry;
pub mod rpc;
pub mod scanner;
pub mod types;

pub use chain::{ChainConnection, ChainDescriptor, ChainKind};
pub use decoder::{DecodedLog, EventDecoder};
pub use feed::{FeedSettings, LiveBlockFeed};
pub use registry::{ContractKind, ContractRegistry, EventSchema};
pub use rpc::{AlloyChainClient, ChainClient, MockChainClient};
pub use scanner::{BlockScanner, ScanReport, ScanSettings};
pub use types::{BlockchainEvent, EventKind, ProposalEvent, VoteEvent};
