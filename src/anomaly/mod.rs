//! Vote anomaly detector.
//!
//! Runs inline in the analytics consumer right after a vote is aggregated,
//! over a fixed-size window of the most recent votes:
//!
//! - **Large vote**: voting power above a fixed threshold
//! - **Rapid voting**: a vote arriving shortly after the previous one
//! - **Coordinated voting**: a burst of near-unanimous votes on one proposal

use crate::config::AnomalyConfig;
use crate::onchain::chain::ChainKind;
use crate::onchain::types::VoteEvent;
use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Types of anomaly we can detect.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    LargeVote,
    RapidVoting,
    CoordinatedVoting,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::LargeVote => write!(f, "large_vote"),
            AlertKind::RapidVoting => write!(f, "rapid_voting"),
            AlertKind::CoordinatedVoting => write!(f, "coordinated_voting"),
        }
    }
}

/// Severity level for an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "LOW"),
            Severity::Medium => write!(f, "MED"),
            Severity::High => write!(f, "HIGH"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub created_at: DateTime<Utc>,
    pub proposal_id: U256,
    pub voter: Address,
    pub chain: ChainKind,
    pub message: String,
    pub severity: Severity,
}

/// Append-only alert list, shared between the consumer (writer), cleanup and
/// readers. Entries stay in creation order; only age-based purging removes them.
#[derive(Debug, Clone, Default)]
pub struct AlertLog {
    alerts: Arc<RwLock<Vec<Alert>>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, alert: Alert) {
        self.alerts.write().push(alert);
    }

    pub fn all(&self) -> Vec<Alert> {
        self.alerts.read().clone()
    }

    /// Alerts created at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<Alert> {
        self.alerts
            .read()
            .iter()
            .filter(|a| a.created_at >= since)
            .cloned()
            .collect()
    }

    pub fn count_since(&self, since: DateTime<Utc>) -> usize {
        self.alerts.read().iter().filter(|a| a.created_at >= since).count()
    }

    /// Drop alerts created before `cutoff`. Returns how many were removed.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|a| a.created_at >= cutoff);
        before - alerts.len()
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }
}

/// Fixed-capacity FIFO of the most recent votes.
#[derive(Debug, Clone)]
pub struct RecentVoteWindow {
    votes: VecDeque<VoteEvent>,
    capacity: usize,
}

impl RecentVoteWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            votes: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, vote: VoteEvent) {
        if self.votes.len() >= self.capacity {
            self.votes.pop_front();
        }
        self.votes.push_back(vote);
    }

    pub fn len(&self) -> usize {
        self.votes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &VoteEvent> {
        self.votes.iter()
    }

    /// The entry before the newest one.
    fn previous(&self) -> Option<&VoteEvent> {
        self.votes.len().checked_sub(2).and_then(|i| self.votes.get(i))
    }
}

pub struct AnomalyDetector {
    window: RecentVoteWindow,
    config: AnomalyConfig,
    large_vote_threshold: U256,
    alerts: AlertLog,
}

impl AnomalyDetector {
    pub fn new(config: AnomalyConfig, alerts: AlertLog) -> Self {
        Self {
            window: RecentVoteWindow::new(config.window_capacity),
            large_vote_threshold: U256::from(config.large_vote_threshold),
            config,
            alerts,
        }
    }

    pub fn window(&self) -> &RecentVoteWindow {
        &self.window
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.alerts
    }

    /// Buffer `vote`, then evaluate every rule against it. Alerts are appended
    /// to the log (stamped `now`) and returned.
    pub fn check_vote(&mut self, vote: &VoteEvent, now: DateTime<Utc>) -> Vec<Alert> {
        self.window.push(vote.clone());
        let mut fired = Vec::new();

        // --- Rule 1: Large vote ---
        if vote.voting_power > self.large_vote_threshold {
            fired.push((
                AlertKind::LargeVote,
                Severity::Medium,
                format!("Large vote detected: {} tokens", vote.voting_power),
            ));
        }

        // --- Rule 2: Rapid voting (against the single prior entry) ---
        if let Some(prev) = self.window.previous() {
            let delta = (vote.event_time - prev.event_time).num_seconds();
            if delta < self.config.rapid_voting_secs {
                fired.push((
                    AlertKind::RapidVoting,
                    Severity::Low,
                    format!("Rapid voting detected: {} seconds apart", delta),
                ));
            }
        }

        // --- Rule 3: Coordinated voting ---
        let recent: Vec<&VoteEvent> = self
            .window
            .iter()
            .filter(|v| {
                v.proposal_id == vote.proposal_id
                    && (vote.event_time - v.event_time).num_seconds() < self.config.coordinated_window_secs
            })
            .collect();
        if recent.len() > self.config.coordinated_min_votes {
            let same = recent.iter().filter(|v| v.support == vote.support).count();
            let ratio = same as f64 / recent.len() as f64;
            if ratio > self.config.coordinated_ratio {
                fired.push((
                    AlertKind::CoordinatedVoting,
                    Severity::High,
                    format!("Potential coordinated voting: {}/{} same votes", same, recent.len()),
                ));
            }
        }

        fired
            .into_iter()
            .map(|(kind, severity, message)| self.emit_alert(kind, severity, vote, message, now))
            .collect()
    }

    fn emit_alert(
        &self,
        kind: AlertKind,
        severity: Severity,
        vote: &VoteEvent,
        message: String,
        now: DateTime<Utc>,
    ) -> Alert {
        let alert = Alert {
            kind,
            created_at: now,
            proposal_id: vote.proposal_id,
            voter: vote.voter,
            chain: vote.chain,
            message,
            severity,
        };

        warn!(
            kind = %kind,
            severity = %severity,
            chain = %vote.chain,
            proposal = %vote.proposal_id,
            voter = %vote.voter,
            detail = %alert.message,
            "ANOMALY DETECTED"
        );

        self.alerts.push(alert.clone());
        alert
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn vote(proposal: u64, voter: u8, support: bool, power: u64, at_secs: i64) -> VoteEvent {
        VoteEvent {
            chain: ChainKind::Ethereum,
            proposal_id: U256::from(proposal),
            voter: Address::repeat_byte(voter),
            support,
            voting_power: U256::from(power),
            reason: String::new(),
            event_time: t0() + Duration::seconds(at_secs),
            gas_used: 0,
            gas_price: 0,
        }
    }

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(AnomalyConfig::default(), AlertLog::new())
    }

    fn kinds(alerts: &[Alert]) -> Vec<AlertKind> {
        alerts.iter().map(|a| a.kind).collect()
    }

    #[test]
    fn test_large_vote_threshold_is_strict() {
        let mut d = detector();
        let alerts = d.check_vote(&vote(1, 1, true, 100_001, 0), t0());
        assert_eq!(kinds(&alerts), vec![AlertKind::LargeVote]);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[0].message, "Large vote detected: 100001 tokens");

        let mut d = detector();
        assert!(d.check_vote(&vote(1, 1, true, 100_000, 0), t0()).is_empty());
    }

    #[test]
    fn test_rapid_voting() {
        let mut d = detector();
        assert!(d.check_vote(&vote(1, 1, true, 10, 0), t0()).is_empty());
        let alerts = d.check_vote(&vote(2, 2, true, 10, 59), t0());
        assert_eq!(kinds(&alerts), vec![AlertKind::RapidVoting]);
        assert_eq!(alerts[0].severity, Severity::Low);

        let mut d = detector();
        d.check_vote(&vote(1, 1, true, 10, 0), t0());
        assert!(d.check_vote(&vote(2, 2, true, 10, 61), t0()).is_empty());
    }

    #[test]
    fn test_rapid_voting_compares_only_previous_entry() {
        let mut d = detector();
        d.check_vote(&vote(1, 1, true, 10, 0), t0());
        d.check_vote(&vote(2, 2, true, 10, 100), t0());
        // 30s after the first vote but 70s after the second.
        assert!(d.check_vote(&vote(3, 3, true, 10, 170), t0()).is_empty());
    }

    #[test]
    fn test_coordinated_voting() {
        // 50s apart, so rapid voting fires as well.
        let mut d = detector();
        let mut last = Vec::new();
        for i in 0..6 {
            last = d.check_vote(&vote(7, i as u8 + 1, true, 10, i * 50), t0());
        }
        assert!(kinds(&last).contains(&AlertKind::CoordinatedVoting));
        let coordinated = last.iter().find(|a| a.kind == AlertKind::CoordinatedVoting).unwrap();
        assert_eq!(coordinated.severity, Severity::High);
        assert_eq!(coordinated.message, "Potential coordinated voting: 6/6 same votes");

        let mut d = detector();
        let mut last = Vec::new();
        for i in 0..6 {
            let support = i != 2;
            last = d.check_vote(&vote(7, i as u8 + 1, support, 10, i * 50), t0());
        }
        assert!(!kinds(&last).contains(&AlertKind::CoordinatedVoting));
    }

    #[test]
    fn test_coordinated_needs_more_than_five_in_window() {
        let mut d = detector();
        let mut fired = false;
        for i in 0..5 {
            let alerts = d.check_vote(&vote(7, i as u8 + 1, true, 10, i * 10), t0());
            fired |= kinds(&alerts).contains(&AlertKind::CoordinatedVoting);
        }
        assert!(!fired);

        // A sixth vote outside the 300s window of the first ones.
        let alerts = d.check_vote(&vote(7, 9, true, 10, 400), t0());
        assert!(!kinds(&alerts).contains(&AlertKind::CoordinatedVoting));
    }

    #[test]
    fn test_window_keeps_last_capacity_votes() {
        let mut d = detector();
        for i in 0..105 {
            d.check_vote(&vote(i, 1, true, 1, i as i64 * 1000), t0());
        }
        let w = d.window();
        assert_eq!(w.len(), 100);
        let ids: Vec<U256> = w.iter().map(|v| v.proposal_id).collect();
        let expected: Vec<U256> = (5u64..105).map(U256::from).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_alert_log_retention() {
        let log = AlertLog::new();
        let now = t0();
        let mut d = AnomalyDetector::new(AnomalyConfig::default(), log.clone());
        d.check_vote(&vote(1, 1, true, 500_000, 0), now - Duration::days(8));
        d.check_vote(&vote(2, 2, true, 500_000, 10_000), now - Duration::days(6));
        assert_eq!(log.len(), 2);

        let removed = log.purge_older_than(now - Duration::days(7));
        assert_eq!(removed, 1);
        let left = log.all();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].proposal_id, U256::from(2));
        assert_eq!(log.count_since(now - Duration::hours(1)), 0);
        assert_eq!(log.since(now - Duration::days(30)).len(), 1);
    }
}
