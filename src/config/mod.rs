use crate::onchain::chain::{ChainDescriptor, ChainKind};
use crate::onchain::feed::FeedSettings;
use crate::onchain::registry::{presets, ContractKind, EventSchema, RegistryError};
use crate::onchain::scanner::ScanSettings;
use alloy::primitives::Address;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("chain {0} has no rpc_url (set it in the file or via GOVWATCH_{1}_RPC_URL)")]
    MissingRpcUrl(ChainKind, &'static str),
    #[error("chain {0} is configured twice")]
    DuplicateChain(ChainKind),
    #[error("contract {address} references chain {chain}, which is not configured")]
    UnknownChain { chain: ChainKind, address: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub valkey: ValkeyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
}

/// Queue sizing, scan pacing and background task intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Ingest queue capacity; producers wait when it is full.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Blocks behind the head the first scan pass starts at.
    #[serde(default = "default_initial_lookback")]
    pub initial_lookback_blocks: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Delay after a failed scan pass.
    #[serde(default = "default_scan_retry_secs")]
    pub scan_retry_secs: u64,
    #[serde(default = "default_feed_reconnect_secs")]
    pub feed_reconnect_secs: u64,
    /// A newHeads socket silent for this long is reconnected.
    #[serde(default = "default_feed_idle_secs")]
    pub feed_idle_secs: u64,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_retry_secs")]
    pub snapshot_retry_secs: u64,
    /// Expiry of each cached proposal snapshot.
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Alerts and generic event history older than this are purged.
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// Per-kind cap on the generic event history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// How often the binary logs realtime stats.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

/// Vote anomaly thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct AnomalyConfig {
    /// Recent votes kept for the rules below.
    #[serde(default = "default_window_capacity")]
    pub window_capacity: usize,
    /// Voting power strictly above this is a large vote.
    #[serde(default = "default_large_vote_threshold")]
    pub large_vote_threshold: u64,
    /// Consecutive votes closer than this are rapid.
    #[serde(default = "default_rapid_voting_secs")]
    pub rapid_voting_secs: i64,
    #[serde(default = "default_coordinated_window_secs")]
    pub coordinated_window_secs: i64,
    /// Votes in the window must exceed this count.
    #[serde(default = "default_coordinated_min_votes")]
    pub coordinated_min_votes: usize,
    /// Share of same-direction votes that must be exceeded.
    #[serde(default = "default_coordinated_ratio")]
    pub coordinated_ratio: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValkeyConfig {
    /// Empty keeps snapshots in memory.
    #[serde(default)]
    pub url: String,
    /// Optional key namespace; keys become `<prefix>:analytics:proposal:<id>`.
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain: ChainKind,
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default)]
    pub ws_url: String,
    /// Overrides the chain preset.
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub block_interval_secs: Option<u64>,
}

impl ChainConfig {
    pub fn descriptor(&self) -> ChainDescriptor {
        let mut d = ChainDescriptor::preset(self.chain, self.rpc_url.clone(), self.ws_url.clone());
        if let Some(id) = self.chain_id {
            d.chain_id = id;
        }
        if let Some(secs) = self.block_interval_secs {
            d.block_interval = Duration::from_secs(secs.max(1));
        }
        d
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub chain: ChainKind,
    pub address: String,
    pub kind: ContractKind,
    /// Schema preset (`governor` or `token`). Defaults to the kind's preset
    /// when no `events` are listed either.
    #[serde(default)]
    pub preset: Option<String>,
    /// Extra event declarations, e.g. `TreasuryUpdate(address indexed token, uint256 amount)`.
    #[serde(default)]
    pub events: Vec<String>,
}

impl ContractConfig {
    pub fn parsed_address(&self) -> Result<Address, RegistryError> {
        self.address
            .trim()
            .parse::<Address>()
            .map_err(|_| RegistryError::InvalidAddress(self.address.clone()))
    }

    pub fn schemas(&self) -> Result<Vec<EventSchema>, RegistryError> {
        let mut schemas = match (&self.preset, self.events.is_empty()) {
            (Some(name), _) => presets::by_name(name)?,
            (None, true) => match self.kind {
                ContractKind::Governance => presets::governor()?,
                ContractKind::Token => presets::token()?,
            },
            (None, false) => Vec::new(),
        };
        for decl in &self.events {
            schemas.push(EventSchema::parse(decl)?);
        }
        Ok(schemas)
    }
}

fn default_queue_capacity() -> usize {
    crate::ingest::DEFAULT_CAPACITY
}
fn default_initial_lookback() -> u64 {
    100
}
fn default_rpc_timeout_secs() -> u64 {
    10
}
fn default_scan_retry_secs() -> u64 {
    30
}
fn default_feed_reconnect_secs() -> u64 {
    30
}
fn default_feed_idle_secs() -> u64 {
    120
}
fn default_snapshot_interval_secs() -> u64 {
    300
}
fn default_snapshot_retry_secs() -> u64 {
    60
}
fn default_snapshot_ttl_secs() -> u64 {
    3600
}
fn default_cleanup_interval_secs() -> u64 {
    3600
}
fn default_retention_days() -> i64 {
    7
}
fn default_history_limit() -> usize {
    crate::analytics::DEFAULT_HISTORY_LIMIT
}
fn default_stats_interval_secs() -> u64 {
    60
}
fn default_window_capacity() -> usize {
    100
}
fn default_large_vote_threshold() -> u64 {
    100_000
}
fn default_rapid_voting_secs() -> i64 {
    60
}
fn default_coordinated_window_secs() -> i64 {
    300
}
fn default_coordinated_min_votes() -> usize {
    5
}
fn default_coordinated_ratio() -> f64 {
    0.95
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            initial_lookback_blocks: default_initial_lookback(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            scan_retry_secs: default_scan_retry_secs(),
            feed_reconnect_secs: default_feed_reconnect_secs(),
            feed_idle_secs: default_feed_idle_secs(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_retry_secs: default_snapshot_retry_secs(),
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retention_days: default_retention_days(),
            history_limit: default_history_limit(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            retry_backoff: Duration::from_secs(self.scan_retry_secs),
            initial_lookback: self.initial_lookback_blocks,
        }
    }

    /// The WebSocket handshake shares the RPC deadline.
    pub fn feed_settings(&self) -> FeedSettings {
        FeedSettings {
            reconnect_backoff: Duration::from_secs(self.feed_reconnect_secs),
            connect_timeout: Duration::from_secs(self.rpc_timeout_secs),
            idle_timeout: Duration::from_secs(self.feed_idle_secs),
        }
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.retention_days)
    }
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            window_capacity: default_window_capacity(),
            large_vote_threshold: default_large_vote_threshold(),
            rapid_voting_secs: default_rapid_voting_secs(),
            coordinated_window_secs: default_coordinated_window_secs(),
            coordinated_min_votes: default_coordinated_min_votes(),
            coordinated_ratio: default_coordinated_ratio(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for endpoints.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Default config with every chain whose `GOVWATCH_<CHAIN>_RPC_URL` is set.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// RPC endpoints usually embed provider API keys, so they may live only
    /// in the environment (never in the config file).
    fn apply_env(&mut self) {
        self.overlay(|key| std::env::var(key).ok());
    }

    fn overlay(&mut self, var: impl Fn(&str) -> Option<String>) {
        for chain in ChainKind::ALL {
            let rpc = var(&format!("GOVWATCH_{}_RPC_URL", chain.env_tag()));
            let ws = var(&format!("GOVWATCH_{}_WS_URL", chain.env_tag()));

            let idx = match self.chains.iter().position(|c| c.chain == chain) {
                Some(idx) => idx,
                None if rpc.is_some() => {
                    self.chains.push(ChainConfig {
                        chain,
                        rpc_url: String::new(),
                        ws_url: String::new(),
                        chain_id: None,
                        block_interval_secs: None,
                    });
                    self.chains.len() - 1
                }
                None => continue,
            };
            let entry = &mut self.chains[idx];

            if let Some(url) = rpc {
                entry.rpc_url = url;
            }
            if let Some(url) = ws {
                entry.ws_url = url;
            }
        }

        if let Some(url) = var("GOVWATCH_VALKEY_URL") {
            self.valkey.url = url;
        }
    }

    /// Check chain and contract sections before anything connects.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::new();
        for c in &self.chains {
            if seen.contains(&c.chain) {
                return Err(ConfigError::DuplicateChain(c.chain));
            }
            seen.push(c.chain);
            if c.rpc_url.trim().is_empty() {
                return Err(ConfigError::MissingRpcUrl(c.chain, c.chain.env_tag()));
            }
        }
        for contract in &self.contracts {
            if !seen.contains(&contract.chain) {
                return Err(ConfigError::UnknownChain {
                    chain: contract.chain,
                    address: contract.address.clone(),
                });
            }
            contract.parsed_address()?;
            contract.schemas()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[monitor]
queue_capacity = 500
snapshot_interval_secs = 120

[anomaly]
large_vote_threshold = 250000

[logging]
level = "debug"

[[chains]]
chain = "ethereum"
rpc_url = "https://eth.example/rpc"
ws_url = "wss://eth.example/ws"

[[chains]]
chain = "polygon"
rpc_url = "https://polygon.example/rpc"
block_interval_secs = 3

[[contracts]]
chain = "ethereum"
address = "0xc0Da02939E1441F497fd74F78cE7Decb17B66529"
kind = "governance"

[[contracts]]
chain = "polygon"
address = "0x0000000000000000000000000000000000000abc"
kind = "token"
events = ["TreasuryUpdate(address indexed token, uint256 amount)"]
"#;

    #[test]
    fn test_parse_applies_defaults() {
        let config = Config::parse(SAMPLE).unwrap();
        assert_eq!(config.monitor.queue_capacity, 500);
        assert_eq!(config.monitor.snapshot_interval_secs, 120);
        assert_eq!(config.monitor.snapshot_ttl_secs, 3600);
        assert_eq!(config.monitor.retention_days, 7);
        assert_eq!(config.anomaly.large_vote_threshold, 250_000);
        assert_eq!(config.anomaly.window_capacity, 100);
        assert_eq!(config.logging.level, "debug");
        assert!(config.valkey.url.is_empty());
        config.validate().unwrap();

        let polygon = config.chains[1].descriptor();
        assert_eq!(polygon.chain_id, 137);
        assert_eq!(polygon.block_interval, Duration::from_secs(3));
        assert!(!polygon.has_live_feed());

        // No preset and no events: kind default.
        assert_eq!(config.contracts[0].schemas().unwrap().len(), 4);
        // Explicit events only.
        let token = config.contracts[1].schemas().unwrap();
        assert_eq!(token.len(), 1);
        assert_eq!(token[0].name(), "TreasuryUpdate");
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = Config::parse("").unwrap();
        assert!(config.chains.is_empty());
        assert_eq!(config.monitor.scan_settings(), ScanSettings::default());
        assert_eq!(config.monitor.feed_settings(), FeedSettings::default());
        assert_eq!(config.anomaly.coordinated_ratio, 0.95);
    }

    #[test]
    fn test_env_overlay() {
        let env: HashMap<&str, &str> = [
            ("GOVWATCH_ETHEREUM_RPC_URL", "https://override/rpc"),
            ("GOVWATCH_ARBITRUM_RPC_URL", "https://arb/rpc"),
            ("GOVWATCH_ARBITRUM_WS_URL", "wss://arb/ws"),
            ("GOVWATCH_VALKEY_URL", "redis://cache:6379"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::parse(SAMPLE).unwrap();
        config.overlay(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.chains[0].rpc_url, "https://override/rpc");
        assert_eq!(config.chains[0].ws_url, "wss://eth.example/ws");
        let arb = config.chains.iter().find(|c| c.chain == ChainKind::Arbitrum).unwrap();
        assert_eq!(arb.ws_url, "wss://arb/ws");
        assert_eq!(config.valkey.url, "redis://cache:6379");
        assert_eq!(config.chains.len(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let mut config = Config::parse(SAMPLE).unwrap();
        config.chains[1].rpc_url.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRpcUrl(ChainKind::Polygon, _))));

        let mut config = Config::parse(SAMPLE).unwrap();
        config.contracts[0].chain = ChainKind::Bsc;
        assert!(matches!(config.validate(), Err(ConfigError::UnknownChain { .. })));

        let mut config = Config::parse(SAMPLE).unwrap();
        config.contracts[0].address = "0x123".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Registry(RegistryError::InvalidAddress(_)))
        ));
    }
}
