//! Polling block scanner.
//!
//! Each pass reads the chain head, walks every block after the cursor,
//! fetches receipts for transactions sent to registered contracts, decodes
//! their logs and pushes the resulting events into the ingest queue. The
//! cursor moves to the head only once the whole range succeeded, so a failed
//! pass is retried from the same place (events already pushed may be pushed
//! again).

use crate::ingest::{IngestSender, QueueClosed};
use crate::onchain::chain::{ChainConnection, ChainKind};
use crate::onchain::decoder::EventDecoder;
use crate::onchain::rpc::{ChainClient, RawBlock, RawReceipt, RpcError};
use crate::onchain::types::BlockchainEvent;
use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("block {0} not available from the node")]
    MissingBlock(u64),
    #[error("receipt for {0} not available from the node")]
    MissingReceipt(B256),
    #[error(transparent)]
    QueueClosed(#[from] QueueClosed),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    /// Per-request deadline.
    pub rpc_timeout: Duration,
    /// Delay before retrying after a failed pass.
    pub retry_backoff: Duration,
    /// How far behind the head the first pass starts.
    pub initial_lookback: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_secs(30),
            initial_lookback: 100,
        }
    }
}

/// Outcome of one successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub chain: ChainKind,
    /// First block scanned; `from_block > to_block` means nothing was new.
    pub from_block: u64,
    pub to_block: u64,
    pub blocks: u64,
    pub events: u64,
}

pub struct BlockScanner {
    connection: Arc<ChainConnection>,
    client: Arc<dyn ChainClient>,
    decoder: EventDecoder,
    queue: IngestSender,
    settings: ScanSettings,
}

impl BlockScanner {
    pub fn new(
        connection: Arc<ChainConnection>,
        client: Arc<dyn ChainClient>,
        decoder: EventDecoder,
        queue: IngestSender,
        settings: ScanSettings,
    ) -> Self {
        Self {
            connection,
            client,
            decoder,
            queue,
            settings,
        }
    }

    pub fn connection(&self) -> &Arc<ChainConnection> {
        &self.connection
    }

    pub fn chain(&self) -> ChainKind {
        self.connection.chain()
    }

    /// Run a single scan pass over `(cursor, head]`.
    ///
    /// Passes over the same chain are serialized, so the feed and the
    /// polling loop can both call this.
    pub async fn poll_once(&self) -> Result<ScanReport, ScanError> {
        let _pass = self.connection.scan_lock.lock().await;
        let chain = self.chain();

        let head = self.call("eth_blockNumber", self.client.block_number()).await?;
        let cursor = match self.connection.cursor() {
            Some(cursor) => cursor,
            None => {
                let start = head.saturating_sub(self.settings.initial_lookback);
                self.connection.advance_cursor(start);
                info!(chain = %chain, head = head, start = start, "initialized scan cursor");
                start
            }
        };

        let from_block = cursor + 1;
        if head <= cursor {
            return Ok(ScanReport {
                chain,
                from_block,
                to_block: head,
                blocks: 0,
                events: 0,
            });
        }

        let mut events = 0u64;
        for number in from_block..=head {
            let block = self
                .call("eth_getBlockByNumber", self.client.block_with_transactions(number))
                .await?
                .ok_or(ScanError::MissingBlock(number))?;
            events += self.scan_block(&block).await?;
        }

        let blocks = head - cursor;
        self.connection.record_pass(blocks, events);
        self.connection.advance_cursor(head);

        debug!(
            chain = %chain,
            from = from_block,
            to = head,
            events = events,
            "scan pass complete"
        );

        Ok(ScanReport {
            chain,
            from_block,
            to_block: head,
            blocks,
            events,
        })
    }

    async fn scan_block(&self, block: &RawBlock) -> Result<u64, ScanError> {
        let chain = self.chain();
        let timestamp = DateTime::<Utc>::from_timestamp(block.timestamp as i64, 0).unwrap_or_default();
        let mut emitted = 0;

        for tx in &block.transactions {
            let Some(to) = tx.to else { continue };
            if !self.decoder.registry().is_registered(chain, &to) {
                continue;
            }

            let receipt = self
                .call("eth_getTransactionReceipt", self.client.receipt(tx.hash))
                .await?
                .ok_or(ScanError::MissingReceipt(tx.hash))?;

            for event in self.events_from_receipt(&receipt, block.number, timestamp) {
                self.queue.push(event).await?;
                emitted += 1;
            }
        }

        Ok(emitted)
    }

    fn events_from_receipt(
        &self,
        receipt: &RawReceipt,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Vec<BlockchainEvent> {
        let chain = self.chain();
        receipt
            .logs
            .iter()
            .filter_map(|log| {
                let decoded = self.decoder.decode(chain, log)?;
                Some(BlockchainEvent {
                    chain,
                    kind: decoded.kind,
                    tx_hash: receipt.tx_hash,
                    log_index: log.log_index,
                    block_number,
                    timestamp,
                    contract_address: log.address,
                    data: decoded.fields,
                    gas_used: receipt.gas_used,
                    gas_price: receipt.effective_gas_price,
                })
            })
            .collect()
    }

    async fn call<T>(
        &self,
        method: &'static str,
        request: impl Future<Output = Result<T, RpcError>>,
    ) -> Result<T, ScanError> {
        let timeout = self.settings.rpc_timeout;
        match tokio::time::timeout(timeout, request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RpcError::Timeout {
                method,
                secs: timeout.as_secs(),
            }
            .into()),
        }
    }

    /// Poll until `shutdown` fires: one pass per block interval, backing off
    /// after a failed pass.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let chain = self.chain();
        let interval = self.connection.descriptor().block_interval;
        info!(chain = %chain, interval_secs = interval.as_secs(), "block scanner started");

        // A pass in flight always completes; only the waits race shutdown.
        while !shutdown.is_cancelled() {
            let delay = match self.poll_once().await {
                Ok(report) => {
                    if report.events > 0 {
                        info!(
                            chain = %chain,
                            blocks = report.blocks,
                            events = report.events,
                            head = report.to_block,
                            "scanned new blocks"
                        );
                    }
                    interval
                }
                Err(ScanError::QueueClosed(_)) => {
                    info!(chain = %chain, "ingest queue closed, scanner exiting");
                    return;
                }
                Err(e) => {
                    error!(
                        chain = %chain,
                        error = %e,
                        retry_secs = self.settings.retry_backoff.as_secs(),
                        "scan pass failed"
                    );
                    self.settings.retry_backoff
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(chain = %chain, cursor = ?self.connection.cursor(), "block scanner stopped");
    }
}
