//! Per-proposal and per-voter aggregates, built by a single consumer.
//!
//! `AnalyticsEngine` is the only writer. It is driven sequentially by the
//! ingest consumer and owns the anomaly detector, which runs right after
//! each vote is folded in. `AnalyticsStore` is the cloneable read handle the
//! coordinator, snapshot loop and outer layers use.

pub mod insights;

use crate::anomaly::{Alert, AnomalyDetector};
use crate::onchain::chain::ChainKind;
use crate::onchain::types::{BlockchainEvent, EventKind, ProjectionError, ProposalEvent, VoteEvent};
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

pub use insights::ProposalInsights;

pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Lossy U256 → f64 for ratios and averages.
pub(crate) fn to_f64(v: U256) -> f64 {
    v.to_string().parse::<f64>().unwrap_or(0.0)
}

/// Cumulative unique-voter count at the time of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VelocitySample {
    pub timestamp: DateTime<Utc>,
    pub unique_voters: usize,
}

/// Gas spent by the transactions that created and voted on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct GasTotals {
    pub gas_used: u128,
    /// Sum of gas used × effective gas price.
    pub wei_spent: U256,
    pub tx_count: u64,
}

impl GasTotals {
    fn add(&mut self, gas_used: u64, gas_price: u128) {
        self.gas_used += gas_used as u128;
        self.wei_spent = self
            .wei_spent
            .saturating_add(U256::from(gas_used).saturating_mul(U256::from(gas_price)));
        self.tx_count += 1;
    }

    pub fn avg_gas_price(&self) -> Option<U256> {
        if self.gas_used == 0 {
            return None;
        }
        Some(self.wei_spent / U256::from(self.gas_used))
    }
}

#[derive(Debug, Clone)]
pub struct ProposalAnalytics {
    pub proposal_id: U256,
    pub chain: ChainKind,
    pub proposer: Address,
    pub title: String,
    pub start_block: u64,
    pub end_block: u64,
    pub quorum: U256,
    pub created_at: DateTime<Utc>,
    pub votes_for: U256,
    pub votes_against: U256,
    /// Every vote applied, including repeats by the same voter.
    pub vote_count: u64,
    pub unique_voters: HashSet<Address>,
    pub velocity: Vec<VelocitySample>,
    pub gas: GasTotals,
}

impl ProposalAnalytics {
    fn from_event(p: &ProposalEvent) -> Self {
        let mut gas = GasTotals::default();
        gas.add(p.gas_used, p.gas_price);
        Self {
            proposal_id: p.proposal_id,
            chain: p.chain,
            proposer: p.proposer,
            title: p.title.clone(),
            start_block: p.start_block,
            end_block: p.end_block,
            quorum: p.quorum,
            created_at: p.event_time,
            votes_for: U256::ZERO,
            votes_against: U256::ZERO,
            vote_count: 0,
            unique_voters: HashSet::new(),
            velocity: Vec::new(),
            gas,
        }
    }

    fn apply_vote(&mut self, vote: &VoteEvent) {
        if vote.support {
            self.votes_for = self.votes_for.saturating_add(vote.voting_power);
        } else {
            self.votes_against = self.votes_against.saturating_add(vote.voting_power);
        }
        self.vote_count += 1;
        self.unique_voters.insert(vote.voter);
        self.velocity.push(VelocitySample {
            timestamp: vote.event_time,
            unique_voters: self.unique_voters.len(),
        });
        self.gas.add(vote.gas_used, vote.gas_price);
    }

    /// Mean gap between consecutive velocity samples, in seconds.
    pub fn avg_voting_interval_secs(&self) -> f64 {
        if self.velocity.len() < 2 {
            return 0.0;
        }
        let total: f64 = self
            .velocity
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds() as f64 / 1000.0)
            .sum();
        total / (self.velocity.len() - 1) as f64
    }

    pub fn snapshot(&self) -> ProposalSnapshot {
        ProposalSnapshot {
            proposal_id: self.proposal_id,
            chain: self.chain,
            proposer: self.proposer,
            title: self.title.clone(),
            start_block: self.start_block,
            end_block: self.end_block,
            quorum: self.quorum,
            created_at: self.created_at,
            votes_for: self.votes_for,
            votes_against: self.votes_against,
            vote_count: self.vote_count,
            unique_voters: self.unique_voters.len(),
            avg_voting_interval_secs: self.avg_voting_interval_secs(),
            velocity: self.velocity.clone(),
            gas: self.gas,
        }
    }
}

/// Serializable view of a proposal, as returned to readers and cached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalSnapshot {
    pub proposal_id: U256,
    pub chain: ChainKind,
    pub proposer: Address,
    pub title: String,
    pub start_block: u64,
    pub end_block: u64,
    pub quorum: U256,
    pub created_at: DateTime<Utc>,
    pub votes_for: U256,
    pub votes_against: U256,
    pub vote_count: u64,
    pub unique_voters: usize,
    pub avg_voting_interval_secs: f64,
    pub velocity: Vec<VelocitySample>,
    pub gas: GasTotals,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteRecord {
    pub chain: ChainKind,
    pub proposal_id: U256,
    pub support: bool,
    pub voting_power: U256,
    pub timestamp: DateTime<Utc>,
}

/// Every vote one address has cast, in arrival order.
#[derive(Debug, Clone)]
pub struct VoterProfile {
    pub address: Address,
    pub votes: Vec<VoteRecord>,
}

impl VoterProfile {
    pub fn summary(&self) -> VoterSummary {
        let total = self.votes.len();
        let supporting = self.votes.iter().filter(|v| v.support).count();
        let power = self
            .votes
            .iter()
            .fold(U256::ZERO, |acc, v| acc.saturating_add(v.voting_power));

        let (support_ratio, avg_voting_power) = if total == 0 {
            (0.0, 0.0)
        } else {
            (supporting as f64 / total as f64, to_f64(power) / total as f64)
        };

        VoterSummary {
            address: self.address,
            total_votes: total,
            support_ratio,
            avg_voting_power,
            first_vote: self.votes.iter().map(|v| v.timestamp).min(),
            last_vote: self.votes.iter().map(|v| v.timestamp).max(),
            most_active_month: self.most_active_month(),
        }
    }

    /// `YYYY-MM` with the most votes; ties go to the month seen first.
    /// Needs at least two votes to say anything.
    fn most_active_month(&self) -> Option<String> {
        if self.votes.len() < 2 {
            return None;
        }
        let mut order: Vec<String> = Vec::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for v in &self.votes {
            let month = v.timestamp.format("%Y-%m").to_string();
            let count = counts.entry(month.clone()).or_insert(0);
            if *count == 0 {
                order.push(month);
            }
            *count += 1;
        }

        let mut best: Option<(&String, usize)> = None;
        for month in &order {
            let count = counts.get(month).copied().unwrap_or(0);
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((month, count));
            }
        }
        best.map(|(m, _)| m.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoterSummary {
    pub address: Address,
    pub total_votes: usize,
    pub support_ratio: f64,
    pub avg_voting_power: f64,
    pub first_vote: Option<DateTime<Utc>>,
    pub last_vote: Option<DateTime<Utc>>,
    pub most_active_month: Option<String>,
}

/// Shared read handle over the aggregates.
#[derive(Clone)]
pub struct AnalyticsStore {
    proposals: Arc<DashMap<U256, ProposalAnalytics>>,
    voters: Arc<DashMap<Address, VoterProfile>>,
    /// Recent raw events per kind, oldest first.
    history: Arc<DashMap<EventKind, VecDeque<BlockchainEvent>>>,
    history_limit: usize,
}

impl AnalyticsStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            proposals: Arc::new(DashMap::new()),
            voters: Arc::new(DashMap::new()),
            history: Arc::new(DashMap::new()),
            history_limit: history_limit.max(1),
        }
    }

    pub fn proposal(&self, id: U256) -> Option<ProposalSnapshot> {
        self.proposals.get(&id).map(|p| p.snapshot())
    }

    pub fn voter(&self, address: &Address) -> Option<VoterSummary> {
        self.voters.get(address).map(|v| v.summary())
    }

    pub fn voter_votes(&self, address: &Address) -> Option<Vec<VoteRecord>> {
        self.voters.get(address).map(|v| v.votes.clone())
    }

    pub fn proposal_ids(&self) -> Vec<U256> {
        self.proposals.iter().map(|e| *e.key()).collect()
    }

    pub fn proposal_count(&self) -> usize {
        self.proposals.len()
    }

    pub fn voter_count(&self) -> usize {
        self.voters.len()
    }

    pub fn insights(&self, id: U256, now: DateTime<Utc>) -> Option<ProposalInsights> {
        self.proposal(id).map(|p| ProposalInsights::compute(&p, now))
    }

    pub fn history(&self, kind: EventKind) -> Vec<BlockchainEvent> {
        self.history
            .get(&kind)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn history_len(&self, kind: EventKind) -> usize {
        self.history.get(&kind).map(|h| h.len()).unwrap_or(0)
    }

    /// Drop history entries whose block time is before `cutoff`. Entries
    /// are in arrival order, which is not block-time order across chains.
    pub fn trim_history(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut entry in self.history.iter_mut() {
            let h = entry.value_mut();
            let before = h.len();
            h.retain(|e| e.timestamp >= cutoff);
            removed += before - h.len();
        }
        removed
    }

    fn record(&self, event: &BlockchainEvent) {
        let mut h = self.history.entry(event.kind).or_default();
        if h.len() >= self.history_limit {
            h.pop_front();
        }
        h.push_back(event.clone());
    }
}

/// What applying one event did.
#[derive(Debug)]
pub enum ApplyOutcome {
    ProposalCreated { proposal_id: U256, replaced: bool },
    Vote { proposal_id: U256, alerts: Vec<Alert> },
    /// Vote for a proposal we never saw created.
    DroppedVote { proposal_id: U256 },
    /// Kinds with no structured processing.
    Recorded(EventKind),
    Malformed(ProjectionError),
}

pub struct AnalyticsEngine {
    store: AnalyticsStore,
    detector: AnomalyDetector,
}

impl AnalyticsEngine {
    pub fn new(store: AnalyticsStore, detector: AnomalyDetector) -> Self {
        Self { store, detector }
    }

    pub fn store(&self) -> &AnalyticsStore {
        &self.store
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Fold one event into the aggregates. Alerts are stamped with wall-clock time.
    pub fn apply(&mut self, event: &BlockchainEvent) -> ApplyOutcome {
        self.apply_at(event, Utc::now())
    }

    pub fn apply_at(&mut self, event: &BlockchainEvent, now: DateTime<Utc>) -> ApplyOutcome {
        self.store.record(event);

        match event.kind {
            EventKind::ProposalCreated => match ProposalEvent::try_from(event) {
                Ok(p) => self.on_proposal(&p),
                Err(e) => self.malformed(event, e),
            },
            EventKind::VoteCast => match VoteEvent::try_from(event) {
                Ok(v) => self.on_vote(&v, now),
                Err(e) => self.malformed(event, e),
            },
            other => {
                debug!(kind = %other, chain = %event.chain, block = event.block_number, "recorded event");
                ApplyOutcome::Recorded(other)
            }
        }
    }

    fn on_proposal(&mut self, p: &ProposalEvent) -> ApplyOutcome {
        let replaced = self
            .store
            .proposals
            .insert(p.proposal_id, ProposalAnalytics::from_event(p))
            .is_some();
        if replaced {
            warn!(
                chain = %p.chain,
                proposal = %p.proposal_id,
                "duplicate ProposalCreated, replacing existing analytics"
            );
        } else {
            debug!(chain = %p.chain, proposal = %p.proposal_id, title = %p.title, "tracking proposal");
        }
        ApplyOutcome::ProposalCreated {
            proposal_id: p.proposal_id,
            replaced,
        }
    }

    fn on_vote(&mut self, vote: &VoteEvent, now: DateTime<Utc>) -> ApplyOutcome {
        match self.store.proposals.get_mut(&vote.proposal_id) {
            Some(mut analytics) => analytics.apply_vote(vote),
            None => {
                warn!(
                    chain = %vote.chain,
                    proposal = %vote.proposal_id,
                    voter = %vote.voter,
                    "vote for unknown proposal, dropping"
                );
                return ApplyOutcome::DroppedVote {
                    proposal_id: vote.proposal_id,
                };
            }
        }

        self.store
            .voters
            .entry(vote.voter)
            .or_insert_with(|| VoterProfile {
                address: vote.voter,
                votes: Vec::new(),
            })
            .votes
            .push(VoteRecord {
                chain: vote.chain,
                proposal_id: vote.proposal_id,
                support: vote.support,
                voting_power: vote.voting_power,
                timestamp: vote.event_time,
            });

        let alerts = self.detector.check_vote(vote, now);
        ApplyOutcome::Vote {
            proposal_id: vote.proposal_id,
            alerts,
        }
    }

    fn malformed(&self, event: &BlockchainEvent, e: ProjectionError) -> ApplyOutcome {
        warn!(event = %event, error = %e, "dropping malformed event");
        ApplyOutcome::Malformed(e)
    }
}
