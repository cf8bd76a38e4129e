//! Monitor coordinator: owns the chains and the contract registry, launches
//! every task and serves the read API.
//!
//! Task layout once started:
//!   per chain   → BlockScanner::run + LiveBlockFeed::run   (producers)
//!   once        → ingest consumer                          (sole analytics writer)
//!   once        → snapshot cache loop, cleanup loop
//!
//! All tasks share one CancellationToken; `stop` cancels it and `join`
//! waits for every task to finish its current unit of work.

mod tasks;

use crate::analytics::insights::ProposalInsights;
use crate::analytics::{AnalyticsEngine, AnalyticsStore, ProposalSnapshot, VoterSummary};
use crate::anomaly::{Alert, AlertLog, AnomalyDetector};
use crate::config::{AnomalyConfig, Config, ConfigError, MonitorConfig};
use crate::ingest::ingest_queue;
use crate::onchain::chain::{ChainConnection, ChainDescriptor, ChainKind};
use crate::onchain::decoder::EventDecoder;
use crate::onchain::feed::LiveBlockFeed;
use crate::onchain::registry::{ContractKind, ContractRegistry, EventSchema, RegistryError};
use crate::onchain::rpc::{AlloyChainClient, ChainClient, RpcError};
use crate::onchain::scanner::BlockScanner;
use crate::store::{MemorySnapshotStore, SnapshotSink};
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use self::tasks::SnapshotSchedule;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("chain {0} is not registered")]
    UnknownChain(ChainKind),
    #[error("chain {0} is already registered")]
    DuplicateChain(ChainKind),
    #[error("monitor already started")]
    AlreadyStarted,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Per-chain progress for the stats view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStatus {
    pub chain: ChainKind,
    pub cursor: Option<u64>,
    pub blocks_scanned: u64,
    pub events_emitted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeStats {
    pub proposals_monitored: usize,
    pub unique_voters: usize,
    pub alerts_last_hour: usize,
    pub chains_monitored: usize,
    pub contracts_monitored: usize,
    pub chains: Vec<ChainStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub generated_at: DateTime<Utc>,
}

struct ChainEntry {
    connection: Arc<ChainConnection>,
    client: Arc<dyn ChainClient>,
}

pub struct MonitorCoordinator {
    monitor: MonitorConfig,
    anomaly: AnomalyConfig,
    key_prefix: String,
    chains: BTreeMap<ChainKind, ChainEntry>,
    registry: Arc<ContractRegistry>,
    analytics: AnalyticsStore,
    alerts: AlertLog,
    sink: Arc<dyn SnapshotSink>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    started_at: Option<DateTime<Utc>>,
}

impl MonitorCoordinator {
    pub fn new(monitor: MonitorConfig, anomaly: AnomalyConfig) -> Self {
        let analytics = AnalyticsStore::new(monitor.history_limit);
        Self {
            monitor,
            anomaly,
            key_prefix: String::new(),
            chains: BTreeMap::new(),
            registry: Arc::new(ContractRegistry::new()),
            analytics,
            alerts: AlertLog::new(),
            sink: Arc::new(MemorySnapshotStore::new()),
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            started_at: None,
        }
    }

    /// Build a coordinator with every configured chain and contract registered.
    pub fn from_config(config: &Config) -> Result<Self, MonitorError> {
        config.validate()?;

        let mut coordinator = Self::new(config.monitor.clone(), config.anomaly.clone());
        coordinator.key_prefix = config.valkey.prefix.clone();

        for chain in &config.chains {
            coordinator.register_chain(chain.descriptor())?;
        }
        for contract in &config.contracts {
            coordinator.register_contract(
                contract.chain,
                contract.parsed_address()?,
                contract.kind,
                contract.schemas()?,
            )?;
        }
        Ok(coordinator)
    }

    /// Replace the default in-memory snapshot cache.
    pub fn with_snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Register a chain reached over its HTTP JSON-RPC endpoint.
    pub fn register_chain(&mut self, descriptor: ChainDescriptor) -> Result<(), MonitorError> {
        let client = AlloyChainClient::connect_http(&descriptor.rpc_url)?;
        self.register_chain_with_client(descriptor, Arc::new(client))
    }

    /// Register a chain with an explicit client.
    pub fn register_chain_with_client(
        &mut self,
        descriptor: ChainDescriptor,
        client: Arc<dyn ChainClient>,
    ) -> Result<(), MonitorError> {
        if self.started_at.is_some() {
            return Err(MonitorError::AlreadyStarted);
        }
        let chain = descriptor.chain;
        if self.chains.contains_key(&chain) {
            return Err(MonitorError::DuplicateChain(chain));
        }

        info!(
            chain = %chain,
            chain_id = descriptor.chain_id,
            block_interval_secs = descriptor.block_interval.as_secs(),
            live_feed = descriptor.has_live_feed(),
            "registered chain"
        );
        self.chains.insert(
            chain,
            ChainEntry {
                connection: Arc::new(ChainConnection::new(descriptor)),
                client,
            },
        );
        Ok(())
    }

    pub fn register_contract(
        &mut self,
        chain: ChainKind,
        address: Address,
        kind: ContractKind,
        schemas: Vec<EventSchema>,
    ) -> Result<(), MonitorError> {
        if !self.chains.contains_key(&chain) {
            return Err(MonitorError::UnknownChain(chain));
        }
        let registry = match (self.started_at, Arc::get_mut(&mut self.registry)) {
            (None, Some(registry)) => registry,
            _ => return Err(MonitorError::AlreadyStarted),
        };
        registry.register(chain, address, kind, schemas)?;
        Ok(())
    }

    /// Launch every task. Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), MonitorError> {
        if self.started_at.is_some() {
            return Err(MonitorError::AlreadyStarted);
        }

        let decoder = EventDecoder::new(self.registry.clone());
        let (tx, rx) = ingest_queue(self.monitor.queue_capacity);
        let feed_settings = self.monitor.feed_settings();

        for entry in self.chains.values() {
            let scanner = Arc::new(BlockScanner::new(
                entry.connection.clone(),
                entry.client.clone(),
                decoder.clone(),
                tx.clone(),
                self.monitor.scan_settings(),
            ));
            let feed = LiveBlockFeed::new(scanner.clone(), feed_settings);

            self.tasks.push(tokio::spawn(scanner.run(self.shutdown.clone())));
            self.tasks.push(tokio::spawn(feed.run(self.shutdown.clone())));
        }
        // Scanners hold the only senders from here on.
        drop(tx);

        let engine = AnalyticsEngine::new(
            self.analytics.clone(),
            AnomalyDetector::new(self.anomaly.clone(), self.alerts.clone()),
        );
        self.tasks
            .push(tokio::spawn(tasks::run_consumer(engine, rx, self.shutdown.clone())));

        let schedule = SnapshotSchedule {
            interval: Duration::from_secs(self.monitor.snapshot_interval_secs),
            retry: Duration::from_secs(self.monitor.snapshot_retry_secs),
            ttl: Duration::from_secs(self.monitor.snapshot_ttl_secs),
            prefix: self.key_prefix.clone(),
        };
        self.tasks.push(tokio::spawn(tasks::run_snapshots(
            self.analytics.clone(),
            self.sink.clone(),
            schedule,
            self.shutdown.clone(),
        )));

        self.tasks.push(tokio::spawn(tasks::run_cleanup(
            self.alerts.clone(),
            self.analytics.clone(),
            self.monitor.retention(),
            Duration::from_secs(self.monitor.cleanup_interval_secs),
            self.shutdown.clone(),
        )));

        self.started_at = Some(Utc::now());
        info!(
            chains = self.chains.len(),
            contracts = self.registry.len(),
            tasks = self.tasks.len(),
            sink = self.sink.name(),
            "monitor started"
        );
        Ok(())
    }

    /// Ask every task to stop at its next iteration boundary.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("stopping monitor");
            self.shutdown.cancel();
        }
    }

    /// Wait for every launched task to exit.
    pub async fn join(&mut self) {
        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "monitor task panicked");
            }
        }
        info!("monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some() && !self.shutdown.is_cancelled()
    }

    pub fn get_proposal_analytics(&self, id: U256) -> Option<ProposalSnapshot> {
        self.analytics.proposal(id)
    }

    pub fn get_voter_profile(&self, address: &Address) -> Option<VoterSummary> {
        self.analytics.voter(address)
    }

    pub fn get_proposal_insights(&self, id: U256) -> Option<ProposalInsights> {
        self.analytics.insights(id, Utc::now())
    }

    /// Alerts in creation order, optionally only those created at or after `since`.
    pub fn list_alerts(&self, since: Option<DateTime<Utc>>) -> Vec<Alert> {
        match since {
            Some(since) => self.alerts.since(since),
            None => self.alerts.all(),
        }
    }

    pub fn get_realtime_stats(&self) -> RealtimeStats {
        let now = Utc::now();
        RealtimeStats {
            proposals_monitored: self.analytics.proposal_count(),
            unique_voters: self.analytics.voter_count(),
            alerts_last_hour: self.alerts.count_since(now - chrono::Duration::hours(1)),
            chains_monitored: self.chains.len(),
            contracts_monitored: self.registry.len(),
            chains: self
                .chains
                .values()
                .map(|e| ChainStatus {
                    chain: e.connection.chain(),
                    cursor: e.connection.cursor(),
                    blocks_scanned: e.connection.blocks_scanned(),
                    events_emitted: e.connection.events_emitted(),
                })
                .collect(),
            started_at: self.started_at,
            generated_at: now,
        }
    }

    pub fn analytics(&self) -> &AnalyticsStore {
        &self.analytics
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }
}

impl Drop for MonitorCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
