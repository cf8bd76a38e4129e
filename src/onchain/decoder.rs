//! Turns raw receipt logs from registered contracts into named fields.

use crate::onchain::abi::AbiValue;
use crate::onchain::chain::ChainKind;
use crate::onchain::registry::ContractRegistry;
use crate::onchain::rpc::RawLog;
use crate::onchain::types::EventKind;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// A log matched against its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub kind: EventKind,
    /// Schema name as declared, e.g. `DelegateChanged`.
    pub name: String,
    pub fields: BTreeMap<String, AbiValue>,
}

/// Stateless decoder over a registry snapshot.
///
/// Every failure is a silent skip: logs from unregistered contracts, unknown
/// selectors, topic counts that disagree with the schema, truncated data and
/// events with no governance meaning all return `None`.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    registry: Arc<ContractRegistry>,
}

impl EventDecoder {
    pub fn new(registry: Arc<ContractRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ContractRegistry {
        &self.registry
    }

    pub fn decode(&self, chain: ChainKind, log: &RawLog) -> Option<DecodedLog> {
        let registration = self.registry.lookup(chain, &log.address)?;
        let topic0 = log.topics.first()?;
        let schema = registration.schema(topic0)?;

        let kind = match EventKind::from_event_name(schema.name()) {
            Some(kind) => kind,
            None => {
                trace!(event = schema.name(), "registered event has no governance kind");
                return None;
            }
        };

        if log.topics.len() != 1 + schema.indexed_count() {
            trace!(
                event = schema.name(),
                topics = log.topics.len(),
                "topic count does not match schema"
            );
            return None;
        }

        let fields = match schema.decode(&log.topics, &log.data) {
            Ok(fields) => fields,
            Err(e) => {
                trace!(event = schema.name(), len = log.data.len(), error = %e, "log does not decode");
                return None;
            }
        };

        Some(DecodedLog {
            kind,
            name: schema.name().to_string(),
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onchain::registry::{presets, ContractKind};
    use alloy::primitives::{address, keccak256, Address, Bytes, B256, U256};
    use alloy::sol;
    use alloy::sol_types::SolEvent;

    sol! {
        event VoteCast(address indexed voter, uint256 proposalId, uint8 support, uint256 weight, string reason);
        event DelegateChanged(address indexed delegator, address indexed fromDelegate, address indexed toDelegate);
        event ProposalCreated(
            uint256 proposalId,
            address proposer,
            address[] targets,
            uint256[] values,
            string[] signatures,
            bytes[] calldatas,
            uint256 startBlock,
            uint256 endBlock,
            string description
        );
        event Tagged(string indexed label, uint256 proposalId);
    }

    const GOV: Address = address!("c0da02939e1441f497fd74f78ce7decb17b66529");
    const TOKEN: Address = address!("c00e94cb662c3520282e6f5717214004a7f26888");

    fn decoder() -> EventDecoder {
        let mut registry = ContractRegistry::new();
        registry
            .register(ChainKind::Ethereum, GOV, ContractKind::Governance, presets::governor().unwrap())
            .unwrap();
        registry
            .register(ChainKind::Ethereum, TOKEN, ContractKind::Token, presets::token().unwrap())
            .unwrap();
        EventDecoder::new(Arc::new(registry))
    }

    fn raw_log<E: SolEvent>(address: Address, event: &E) -> RawLog {
        let data = event.encode_log_data();
        RawLog {
            address,
            topics: data.topics().to_vec(),
            data: data.data.clone(),
            log_index: Some(3),
        }
    }

    fn vote_cast_log(voter: Address, proposal: u64, support: u8, weight: u64) -> RawLog {
        raw_log(
            GOV,
            &VoteCast {
                voter,
                proposalId: U256::from(proposal),
                support,
                weight: U256::from(weight),
                reason: "for the grants".to_string(),
            },
        )
    }

    #[test]
    fn test_decode_vote_cast() {
        let voter = address!("00000000000000000000000000000000000000b1");
        let decoded = decoder()
            .decode(ChainKind::Ethereum, &vote_cast_log(voter, 42, 1, 500))
            .unwrap();

        assert_eq!(decoded.kind, EventKind::VoteCast);
        assert_eq!(decoded.fields["voter"], AbiValue::Address(voter));
        assert_eq!(decoded.fields["proposalId"], AbiValue::Uint(U256::from(42)));
        assert_eq!(decoded.fields["support"].as_bool(), Some(true));
        assert_eq!(decoded.fields["weight"], AbiValue::Uint(U256::from(500)));
        assert_eq!(decoded.fields["reason"], AbiValue::String("for the grants".into()));
    }

    #[test]
    fn test_decode_proposal_created_arrays() {
        let target = address!("00000000000000000000000000000000000000c1");
        let log = raw_log(
            GOV,
            &ProposalCreated {
                proposalId: U256::from(9),
                proposer: target,
                targets: vec![target, Address::ZERO],
                values: vec![U256::from(1), U256::ZERO],
                signatures: vec!["a".into(), "bc".into()],
                calldatas: vec![Bytes::from(vec![0xde, 0xad]), Bytes::new()],
                startBlock: U256::from(100),
                endBlock: U256::from(200),
                description: "# Title\nbody".to_string(),
            },
        );
        let decoded = decoder().decode(ChainKind::Ethereum, &log).unwrap();
        assert_eq!(decoded.kind, EventKind::ProposalCreated);
        assert_eq!(
            decoded.fields["signatures"],
            AbiValue::Array(vec![AbiValue::String("a".into()), AbiValue::String("bc".into())])
        );
        assert_eq!(
            decoded.fields["targets"],
            AbiValue::Array(vec![AbiValue::Address(target), AbiValue::Address(Address::ZERO)])
        );
        assert_eq!(decoded.fields["endBlock"].as_u64(), Some(200));
        assert_eq!(decoded.fields["description"].as_str(), Some("# Title\nbody"));
    }

    #[test]
    fn test_decode_delegate_changed_all_indexed() {
        let (a, b, c) = (
            address!("00000000000000000000000000000000000000a1"),
            address!("00000000000000000000000000000000000000a2"),
            address!("00000000000000000000000000000000000000a3"),
        );
        let log = raw_log(
            TOKEN,
            &DelegateChanged {
                delegator: a,
                fromDelegate: b,
                toDelegate: c,
            },
        );
        assert!(log.data.is_empty());
        let decoded = decoder().decode(ChainKind::Ethereum, &log).unwrap();
        assert_eq!(decoded.kind, EventKind::DelegationChanged);
        assert_eq!(decoded.name, "DelegateChanged");
        assert_eq!(decoded.fields["toDelegate"], AbiValue::Address(c));
    }

    #[test]
    fn test_indexed_string_decodes_to_hash() {
        let schema = crate::onchain::registry::EventSchema::parse(
            "Tagged(string indexed label, uint256 proposalId)",
        )
        .unwrap();
        let log = raw_log(
            GOV,
            &Tagged {
                label: keccak256("treasury"),
                proposalId: U256::from(3),
            },
        );
        let fields = schema.decode(&log.topics, &log.data).unwrap();
        assert_eq!(fields["label"], AbiValue::Hashed(keccak256("treasury")));
        assert_eq!(fields["proposalId"].as_u64(), Some(3));
    }

    #[test]
    fn test_skips_are_silent() {
        let d = decoder();
        let voter = Address::ZERO;

        // Wrong chain.
        assert!(d.decode(ChainKind::Polygon, &vote_cast_log(voter, 1, 1, 1)).is_none());

        // Unregistered address.
        let mut log = vote_cast_log(voter, 1, 1, 1);
        log.address = address!("00000000000000000000000000000000000000ff");
        assert!(d.decode(ChainKind::Ethereum, &log).is_none());

        // Missing indexed topic.
        let mut log = vote_cast_log(voter, 1, 1, 1);
        log.topics.truncate(1);
        assert!(d.decode(ChainKind::Ethereum, &log).is_none());

        // Extra topic.
        let mut log = vote_cast_log(voter, 1, 1, 1);
        log.topics.push(B256::ZERO);
        assert!(d.decode(ChainKind::Ethereum, &log).is_none());

        // Truncated data.
        let mut log = vote_cast_log(voter, 1, 1, 1);
        log.data = Bytes::copy_from_slice(&log.data[..40]);
        assert!(d.decode(ChainKind::Ethereum, &log).is_none());

        // No topics at all.
        let mut log = vote_cast_log(voter, 1, 1, 1);
        log.topics.clear();
        assert!(d.decode(ChainKind::Ethereum, &log).is_none());
    }
}
