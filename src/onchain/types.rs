//! Decoded on-chain events and their typed governance projections.

use crate::onchain::abi::AbiValue;
use crate::onchain::chain::ChainKind;
use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Governance-relevant event kinds. Schema names map onto these; anything
/// else a contract emits is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum EventKind {
    ProposalCreated,
    VoteCast,
    ProposalExecuted,
    ProposalCanceled,
    TreasuryUpdate,
    Transfer,
    DelegationChanged,
}

impl EventKind {
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "ProposalCreated" => Some(EventKind::ProposalCreated),
            "VoteCast" | "VoteCastWithParams" => Some(EventKind::VoteCast),
            "ProposalExecuted" => Some(EventKind::ProposalExecuted),
            "ProposalCanceled" | "ProposalCancelled" => Some(EventKind::ProposalCanceled),
            "TreasuryUpdate" => Some(EventKind::TreasuryUpdate),
            "Transfer" => Some(EventKind::Transfer),
            "DelegationChanged" | "DelegateChanged" => Some(EventKind::DelegationChanged),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::ProposalCreated => "ProposalCreated",
            EventKind::VoteCast => "VoteCast",
            EventKind::ProposalExecuted => "ProposalExecuted",
            EventKind::ProposalCanceled => "ProposalCanceled",
            EventKind::TreasuryUpdate => "TreasuryUpdate",
            EventKind::Transfer => "Transfer",
            EventKind::DelegationChanged => "DelegationChanged",
        };
        f.write_str(s)
    }
}

/// One decoded log, as handed from the scanners to the analytics consumer.
#[derive(Debug, Clone, Serialize)]
pub struct BlockchainEvent {
    pub chain: ChainKind,
    pub kind: EventKind,
    pub tx_hash: B256,
    /// Position of the log within its block, when the provider reports it.
    pub log_index: Option<u64>,
    pub block_number: u64,
    /// Block timestamp.
    pub timestamp: DateTime<Utc>,
    pub contract_address: Address,
    pub data: BTreeMap<String, AbiValue>,
    pub gas_used: u64,
    pub gas_price: u128,
}

impl BlockchainEvent {
    fn field(&self, names: &[&'static str]) -> Option<&AbiValue> {
        names.iter().find_map(|n| self.data.get(*n))
    }

    fn require<T>(
        &self,
        names: &[&'static str],
        read: impl Fn(&AbiValue) -> Option<T>,
    ) -> Result<T, ProjectionError> {
        let value = self
            .field(names)
            .ok_or(ProjectionError::MissingField(names[0]))?;
        read(value).ok_or(ProjectionError::WrongType(names[0]))
    }
}

impl fmt::Display for BlockchainEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{} tx={}",
            self.kind,
            self.chain,
            self.block_number,
            &format!("{}", self.tx_hash)[..14]
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("expected a {expected} event, got {actual}")]
    WrongKind { expected: EventKind, actual: EventKind },
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("field '{0}' has an unexpected type")]
    WrongType(&'static str),
}

/// A proposal creation, with the fields analytics needs.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalEvent {
    pub chain: ChainKind,
    pub proposal_id: U256,
    pub proposer: Address,
    pub title: String,
    pub description: String,
    pub start_block: u64,
    pub end_block: u64,
    pub quorum: U256,
    pub event_time: DateTime<Utc>,
    pub gas_used: u64,
    pub gas_price: u128,
}

impl TryFrom<&BlockchainEvent> for ProposalEvent {
    type Error = ProjectionError;

    fn try_from(event: &BlockchainEvent) -> Result<Self, Self::Error> {
        if event.kind != EventKind::ProposalCreated {
            return Err(ProjectionError::WrongKind {
                expected: EventKind::ProposalCreated,
                actual: event.kind,
            });
        }

        let proposal_id = event.require(&["proposalId", "id"], AbiValue::as_u256)?;
        let proposer = event.require(&["proposer"], AbiValue::as_address)?;
        let description = event
            .field(&["description"])
            .and_then(AbiValue::as_str)
            .unwrap_or_default()
            .to_string();
        let title = event
            .field(&["title"])
            .and_then(AbiValue::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| title_from_description(&description));
        let start_block = event
            .field(&["startBlock", "voteStart"])
            .and_then(AbiValue::as_u64)
            .unwrap_or(0);
        let end_block = event
            .field(&["endBlock", "voteEnd"])
            .and_then(AbiValue::as_u64)
            .unwrap_or(0);
        let quorum = event
            .field(&["quorum"])
            .and_then(AbiValue::as_u256)
            .unwrap_or(U256::ZERO);

        Ok(Self {
            chain: event.chain,
            proposal_id,
            proposer,
            title,
            description,
            start_block,
            end_block,
            quorum,
            event_time: event.timestamp,
            gas_used: event.gas_used,
            gas_price: event.gas_price,
        })
    }
}

/// Governor descriptions conventionally open with a markdown heading.
fn title_from_description(description: &str) -> String {
    description
        .lines()
        .map(|l| l.trim().trim_start_matches('#').trim())
        .find(|l| !l.is_empty())
        .unwrap_or("Unknown")
        .to_string()
}

/// A single ballot.
#[derive(Debug, Clone, Serialize)]
pub struct VoteEvent {
    pub chain: ChainKind,
    pub proposal_id: U256,
    pub voter: Address,
    pub support: bool,
    pub voting_power: U256,
    pub reason: String,
    pub event_time: DateTime<Utc>,
    pub gas_used: u64,
    pub gas_price: u128,
}

impl TryFrom<&BlockchainEvent> for VoteEvent {
    type Error = ProjectionError;

    fn try_from(event: &BlockchainEvent) -> Result<Self, Self::Error> {
        if event.kind != EventKind::VoteCast {
            return Err(ProjectionError::WrongKind {
                expected: EventKind::VoteCast,
                actual: event.kind,
            });
        }

        Ok(Self {
            chain: event.chain,
            proposal_id: event.require(&["proposalId", "id"], AbiValue::as_u256)?,
            voter: event.require(&["voter"], AbiValue::as_address)?,
            support: event.require(&["support"], AbiValue::as_bool)?,
            voting_power: event.require(&["weight", "votes"], AbiValue::as_u256)?,
            reason: event
                .field(&["reason"])
                .and_then(AbiValue::as_str)
                .unwrap_or_default()
                .to_string(),
            event_time: event.timestamp,
            gas_used: event.gas_used,
            gas_price: event.gas_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    fn event(kind: EventKind, fields: Vec<(&str, AbiValue)>) -> BlockchainEvent {
        BlockchainEvent {
            chain: ChainKind::Ethereum,
            kind,
            tx_hash: B256::repeat_byte(0x11),
            log_index: Some(0),
            block_number: 19_000_000,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            contract_address: Address::ZERO,
            data: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            gas_used: 80_000,
            gas_price: 20_000_000_000,
        }
    }

    #[test]
    fn test_vote_projection() {
        let voter = address!("00000000000000000000000000000000000000b1");
        let e = event(
            EventKind::VoteCast,
            vec![
                ("voter", AbiValue::Address(voter)),
                ("proposalId", AbiValue::Uint(U256::from(7))),
                ("support", AbiValue::Uint(U256::from(0))),
                ("weight", AbiValue::Uint(U256::from(1234))),
            ],
        );
        let vote = VoteEvent::try_from(&e).unwrap();
        assert_eq!(vote.proposal_id, U256::from(7));
        assert_eq!(vote.voter, voter);
        assert!(!vote.support);
        assert_eq!(vote.voting_power, U256::from(1234));
        assert_eq!(vote.reason, "");
    }

    #[test]
    fn test_vote_projection_missing_weight() {
        let e = event(
            EventKind::VoteCast,
            vec![
                ("voter", AbiValue::Address(Address::ZERO)),
                ("proposalId", AbiValue::Uint(U256::from(7))),
                ("support", AbiValue::Bool(true)),
            ],
        );
        assert_eq!(
            VoteEvent::try_from(&e).unwrap_err(),
            ProjectionError::MissingField("weight")
        );
        assert!(matches!(
            ProposalEvent::try_from(&e),
            Err(ProjectionError::WrongKind { .. })
        ));
    }

    #[test]
    fn test_proposal_projection_title() {
        let e = event(
            EventKind::ProposalCreated,
            vec![
                ("proposalId", AbiValue::Uint(U256::from(1))),
                ("proposer", AbiValue::Address(Address::ZERO)),
                ("startBlock", AbiValue::Uint(U256::from(10))),
                ("endBlock", AbiValue::Uint(U256::from(20))),
                (
                    "description",
                    AbiValue::String("\n# Fund the grants program\nDetails follow".into()),
                ),
            ],
        );
        let p = ProposalEvent::try_from(&e).unwrap();
        assert_eq!(p.title, "Fund the grants program");
        assert_eq!((p.start_block, p.end_block), (10, 20));
        assert_eq!(p.quorum, U256::ZERO);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            EventKind::from_event_name("DelegateChanged"),
            Some(EventKind::DelegationChanged)
        );
        assert_eq!(EventKind::from_event_name("Approval"), None);
    }
}
