//! JSON-RPC access to a chain: head number, full blocks and receipts.
//!
//! `ChainClient` is the seam the scanner talks through. `AlloyChainClient`
//! is the production implementation over an alloy HTTP provider;
//! `MockChainClient` serves canned blocks for tests and dry runs.

use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::network::TransactionResponse;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("invalid endpoint '{0}'")]
    Endpoint(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{method} timed out after {secs}s")]
    Timeout { method: &'static str, secs: u64 },
}

/// A transaction reduced to what the scanner filters on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub hash: B256,
    /// `None` for contract creations.
    pub to: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub number: u64,
    pub timestamp: u64,
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub log_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReceipt {
    pub tx_hash: B256,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub logs: Vec<RawLog>,
}

/// Read-only chain queries needed for a scan pass.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64, RpcError>;

    /// Full block with transactions. `Ok(None)` if the node does not have it yet.
    async fn block_with_transactions(&self, number: u64) -> Result<Option<RawBlock>, RpcError>;

    async fn receipt(&self, tx_hash: B256) -> Result<Option<RawReceipt>, RpcError>;
}

/// `ChainClient` over an alloy HTTP provider.
#[derive(Clone)]
pub struct AlloyChainClient {
    provider: DynProvider,
}

impl AlloyChainClient {
    pub fn connect_http(rpc_url: &str) -> Result<Self, RpcError> {
        let url = rpc_url
            .parse()
            .map_err(|_| RpcError::Endpoint(rpc_url.to_string()))?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        Ok(Self { provider })
    }
}

fn transport<E: std::fmt::Display>(e: E) -> RpcError {
    RpcError::Transport(e.to_string())
}

#[async_trait]
impl ChainClient for AlloyChainClient {
    async fn block_number(&self) -> Result<u64, RpcError> {
        self.provider.get_block_number().await.map_err(transport)
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<RawBlock>, RpcError> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await
            .map_err(transport)?;

        Ok(block.map(|block| RawBlock {
            number: block.header.inner.number,
            timestamp: block.header.inner.timestamp,
            transactions: block
                .transactions
                .txns()
                .map(|tx| RawTransaction {
                    hash: tx.tx_hash(),
                    to: tx.to(),
                })
                .collect(),
        }))
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<RawReceipt>, RpcError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(transport)?;

        Ok(receipt.map(|r| RawReceipt {
            tx_hash,
            gas_used: r.gas_used,
            effective_gas_price: r.effective_gas_price,
            logs: r
                .inner
                .logs()
                .iter()
                .map(|log| RawLog {
                    address: log.address(),
                    topics: log.topics().to_vec(),
                    data: log.data().data.clone(),
                    log_index: log.log_index,
                })
                .collect(),
        }))
    }
}

/// In-memory chain for tests and dry runs.
///
/// Blocks and receipts are served from maps. Blocks listed via
/// [`MockChainClient::fail_block`] return a transport error once.
#[derive(Default)]
pub struct MockChainClient {
    head: AtomicU64,
    blocks: Mutex<HashMap<u64, RawBlock>>,
    receipts: Mutex<HashMap<B256, RawReceipt>>,
    failing_blocks: Mutex<HashSet<u64>>,
    block_requests: AtomicU64,
    receipt_requests: AtomicU64,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Add a block (with the given transactions) and raise the head to it.
    pub fn push_block(&self, block: RawBlock, receipts: Vec<RawReceipt>) {
        self.head.fetch_max(block.number, Ordering::SeqCst);
        let mut stored = self.receipts.lock();
        for r in receipts {
            stored.insert(r.tx_hash, r);
        }
        self.blocks.lock().insert(block.number, block);
    }

    pub fn fail_block(&self, number: u64) {
        self.failing_blocks.lock().insert(number);
    }

    pub fn block_requests(&self) -> u64 {
        self.block_requests.load(Ordering::Relaxed)
    }

    pub fn receipt_requests(&self) -> u64 {
        self.receipt_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn block_with_transactions(&self, number: u64) -> Result<Option<RawBlock>, RpcError> {
        self.block_requests.fetch_add(1, Ordering::Relaxed);
        if self.failing_blocks.lock().remove(&number) {
            debug!(block = number, "mock chain failing block request");
            return Err(RpcError::Transport(format!("injected failure at block {number}")));
        }
        // Unknown blocks below the head are empty, like a quiet chain.
        Ok(Some(self.blocks.lock().get(&number).cloned().unwrap_or(
            RawBlock {
                number,
                timestamp: 0,
                transactions: Vec::new(),
            },
        )))
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<RawReceipt>, RpcError> {
        self.receipt_requests.fetch_add(1, Ordering::Relaxed);
        Ok(self.receipts.lock().get(&tx_hash).cloned())
    }
}
