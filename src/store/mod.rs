//! Snapshot cache: proposal analytics written to a TTL key-value store.
//!
//! Data model:
//!   analytics:proposal:{id}   → JSON ProposalSnapshot   (TTL: snapshot_ttl, 1h default)
//!
//! With a non-empty prefix keys become `{prefix}:analytics:proposal:{id}`,
//! so several deployments can share one Valkey.

use crate::analytics::AnalyticsStore;
use alloy::primitives::U256;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Where snapshots go.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Store `payload` under `key`, expiring after `ttl`.
    async fn put(&self, key: &str, payload: String, ttl: Duration) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// Cache key for one proposal's snapshot.
pub fn proposal_key(prefix: &str, id: U256) -> String {
    if prefix.is_empty() {
        format!("analytics:proposal:{}", id)
    } else {
        format!("{}:analytics:proposal:{}", prefix, id)
    }
}

/// Serialize every known proposal and write it to `sink`.
///
/// Stops at the first failed write; the caller retries the whole pass.
pub async fn write_snapshots(
    analytics: &AnalyticsStore,
    sink: &dyn SnapshotSink,
    prefix: &str,
    ttl: Duration,
) -> anyhow::Result<usize> {
    let mut written = 0;
    for id in analytics.proposal_ids() {
        let Some(snapshot) = analytics.proposal(id) else {
            continue;
        };
        let json = serde_json::to_string(&snapshot)?;
        sink.put(&proposal_key(prefix, id), json, ttl).await?;
        written += 1;
    }
    debug!(sink = sink.name(), written = written, "snapshot pass written");
    Ok(written)
}

/// Valkey-backed snapshot store.
#[derive(Clone)]
pub struct ValkeySnapshotStore {
    conn: MultiplexedConnection,
}

impl ValkeySnapshotStore {
    /// Connect to Valkey/Redis.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = url, "connected to Valkey");
        Ok(Self { conn })
    }

    /// Test connectivity.
    pub async fn ping(&self) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(response = %pong, "Valkey ping");
        Ok(())
    }
}

#[async_trait]
impl SnapshotSink for ValkeySnapshotStore {
    async fn put(&self, key: &str, payload: String, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, payload, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "valkey"
    }
}

/// In-process TTL map used when no Valkey is configured or reachable.
#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    entries: Arc<DashMap<String, (String, Instant)>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live value for `key`, if any. Expired entries are removed on access.
    pub fn get(&self, key: &str) -> Option<String> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Some(entry.0.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SnapshotSink for MemorySnapshotStore {
    async fn put(&self, key: &str, payload: String, ttl: Duration) -> anyhow::Result<()> {
        self.entries
            .insert(key.to_string(), (payload, Instant::now() + ttl));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
