//! Heuristic scores derived from a proposal snapshot.

use super::{to_f64, ProposalSnapshot};
use alloy::primitives::U256;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Samples newer than this count towards momentum.
const MOMENTUM_WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalInsights {
    pub proposal_id: U256,
    pub support_ratio: f64,
    pub voting_momentum: f64,
    pub participation_score: f64,
    pub controversy_score: f64,
    pub success_probability: f64,
    pub recommendations: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl ProposalInsights {
    pub fn compute(p: &ProposalSnapshot, now: DateTime<Utc>) -> Self {
        let momentum = voting_momentum(p, now);
        let participation = participation_score(p);
        let controversy = controversy_score(p);

        let total = to_f64(p.votes_for) + to_f64(p.votes_against);
        let support_ratio = if total > 0.0 {
            to_f64(p.votes_for) / total
        } else {
            0.0
        };
        let success_probability = if total > 0.0 {
            (support_ratio * 0.6 + momentum * 0.2 + participation * 0.2).clamp(0.1, 0.9)
        } else {
            0.5
        };

        let mut recommendations = Vec::new();
        if participation < 0.3 {
            recommendations.push("Consider increasing outreach to boost voter participation".to_string());
        }
        if controversy > 0.4 {
            recommendations.push("This proposal is controversial - consider community discussion".to_string());
        }
        if momentum < 0.2 {
            recommendations.push("Voting momentum is low - proposal may need more promotion".to_string());
        }
        if recommendations.is_empty() {
            recommendations.push("Proposal shows healthy voting patterns".to_string());
        }

        Self {
            proposal_id: p.proposal_id,
            support_ratio,
            voting_momentum: momentum,
            participation_score: participation,
            controversy_score: controversy,
            success_probability,
            recommendations,
            generated_at: now,
        }
    }
}

/// Share of velocity samples in the last hour, scaled to [0, 1].
fn voting_momentum(p: &ProposalSnapshot, now: DateTime<Utc>) -> f64 {
    let total = p.velocity.len();
    if total < 2 {
        return 0.5;
    }
    let horizon = now - Duration::seconds(MOMENTUM_WINDOW_SECS);
    let recent = p.velocity.iter().filter(|s| s.timestamp > horizon).count();
    (recent as f64 / (total as f64 * 0.1).max(1.0)).min(2.0) * 0.5
}

/// Mean of voter diversity (per 100 voters) and engagement (per 1000 tokens a voter).
fn participation_score(p: &ProposalSnapshot) -> f64 {
    if p.unique_voters == 0 {
        return 0.0;
    }
    let unique = p.unique_voters as f64;
    let total = to_f64(p.votes_for) + to_f64(p.votes_against);
    let diversity = (unique / 100.0).min(1.0);
    let engagement = (total / (unique * 1000.0)).min(1.0);
    (diversity + engagement) / 2.0
}

/// 1.0 for an even split, 0.0 for a unanimous one.
fn controversy_score(p: &ProposalSnapshot) -> f64 {
    let for_ = to_f64(p.votes_for);
    let against = to_f64(p.votes_against);
    let total = for_ + against;
    if total == 0.0 {
        return 0.0;
    }
    2.0 * for_.min(against) / total
}
