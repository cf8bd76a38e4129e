//! Chain tags, per-chain connection descriptors and the scan cursor.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Networks the monitor knows how to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Ethereum,
    Polygon,
    Arbitrum,
    Optimism,
    Bsc,
}

impl ChainKind {
    pub const ALL: [ChainKind; 5] = [
        ChainKind::Ethereum,
        ChainKind::Polygon,
        ChainKind::Arbitrum,
        ChainKind::Optimism,
        ChainKind::Bsc,
    ];

    /// EIP-155 chain id on mainnet.
    pub fn default_chain_id(self) -> u64 {
        match self {
            ChainKind::Ethereum => 1,
            ChainKind::Polygon => 137,
            ChainKind::Arbitrum => 42161,
            ChainKind::Optimism => 10,
            ChainKind::Bsc => 56,
        }
    }

    /// Nominal time between blocks, used as the idle delay between scan passes.
    pub fn default_block_interval(self) -> Duration {
        let secs = match self {
            ChainKind::Ethereum => 12,
            ChainKind::Polygon => 2,
            ChainKind::Arbitrum => 1,
            ChainKind::Optimism => 2,
            ChainKind::Bsc => 3,
        };
        Duration::from_secs(secs)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChainKind::Ethereum => "ethereum",
            ChainKind::Polygon => "polygon",
            ChainKind::Arbitrum => "arbitrum",
            ChainKind::Optimism => "optimism",
            ChainKind::Bsc => "bsc",
        }
    }

    /// Upper-case tag used in environment variable names.
    pub fn env_tag(self) -> &'static str {
        match self {
            ChainKind::Ethereum => "ETHEREUM",
            ChainKind::Polygon => "POLYGON",
            ChainKind::Arbitrum => "ARBITRUM",
            ChainKind::Optimism => "OPTIMISM",
            ChainKind::Bsc => "BSC",
        }
    }
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" => Ok(ChainKind::Ethereum),
            "polygon" | "matic" => Ok(ChainKind::Polygon),
            "arbitrum" | "arb" => Ok(ChainKind::Arbitrum),
            "optimism" | "op" => Ok(ChainKind::Optimism),
            "bsc" | "bnb" => Ok(ChainKind::Bsc),
            other => Err(format!("unknown chain '{other}'")),
        }
    }
}

/// Immutable description of how to reach a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainDescriptor {
    pub chain: ChainKind,
    /// HTTP(S) JSON-RPC endpoint for block, transaction and receipt queries.
    pub rpc_url: String,
    /// WebSocket endpoint for `newHeads` notifications. Empty disables the live feed.
    pub ws_url: String,
    pub block_interval: Duration,
    pub chain_id: u64,
}

impl ChainDescriptor {
    /// Descriptor with the chain's mainnet id and nominal block interval.
    pub fn preset(chain: ChainKind, rpc_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            chain,
            rpc_url: rpc_url.into(),
            ws_url: ws_url.into(),
            block_interval: chain.default_block_interval(),
            chain_id: chain.default_chain_id(),
        }
    }

    pub fn has_live_feed(&self) -> bool {
        !self.ws_url.trim().is_empty()
    }
}

/// A registered chain: its descriptor plus the mutable scan cursor.
///
/// The cursor is the last block fully scanned. It only moves forward.
#[derive(Debug)]
pub struct ChainConnection {
    descriptor: ChainDescriptor,
    cursor: Mutex<Option<u64>>,
    /// Held for the duration of a scan pass so feed-triggered and polled
    /// passes over the same chain never overlap.
    pub(crate) scan_lock: tokio::sync::Mutex<()>,
    blocks_scanned: AtomicU64,
    events_emitted: AtomicU64,
}

impl ChainConnection {
    pub fn new(descriptor: ChainDescriptor) -> Self {
        Self {
            descriptor,
            cursor: Mutex::new(None),
            scan_lock: tokio::sync::Mutex::new(()),
            blocks_scanned: AtomicU64::new(0),
            events_emitted: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &ChainDescriptor {
        &self.descriptor
    }

    pub fn chain(&self) -> ChainKind {
        self.descriptor.chain
    }

    pub fn cursor(&self) -> Option<u64> {
        *self.cursor.lock()
    }

    /// Move the cursor to `block` unless it is already at or past it.
    /// Returns whether the cursor moved.
    pub fn advance_cursor(&self, block: u64) -> bool {
        let mut cursor = self.cursor.lock();
        match *cursor {
            Some(current) if current >= block => false,
            _ => {
                *cursor = Some(block);
                true
            }
        }
    }

    pub(crate) fn record_pass(&self, blocks: u64, events: u64) {
        self.blocks_scanned.fetch_add(blocks, Ordering::Relaxed);
        self.events_emitted.fetch_add(events, Ordering::Relaxed);
    }

    pub fn blocks_scanned(&self) -> u64 {
        self.blocks_scanned.load(Ordering::Relaxed)
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_is_monotonic() {
        let conn = ChainConnection::new(ChainDescriptor::preset(ChainKind::Polygon, "http://x", ""));
        assert_eq!(conn.cursor(), None);
        assert!(conn.advance_cursor(100));
        assert!(!conn.advance_cursor(90));
        assert!(!conn.advance_cursor(100));
        assert_eq!(conn.cursor(), Some(100));
        assert!(conn.advance_cursor(101));
        assert_eq!(conn.cursor(), Some(101));
    }

    #[test]
    fn test_presets() {
        let d = ChainDescriptor::preset(ChainKind::Arbitrum, "http://rpc", "");
        assert_eq!(d.chain_id, 42161);
        assert_eq!(d.block_interval, Duration::from_secs(1));
        assert!(!d.has_live_feed());
        assert_eq!("matic".parse::<ChainKind>(), Ok(ChainKind::Polygon));
        assert!("solana".parse::<ChainKind>().is_err());
    }
}
