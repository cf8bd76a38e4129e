//! Contract registry: which contracts to watch on which chain, and the event
//! schemas used to decode their logs.
//!
//! Schemas are declared in human-readable form, e.g.
//! `VoteCast(address indexed voter, uint256 proposalId, uint8 support, uint256 weight, string reason)`,
//! parsed with alloy's `json_abi` and keyed by their topic0 selector.

use crate::onchain::abi::AbiValue;
use crate::onchain::chain::ChainKind;
use alloy::dyn_abi::{DynSolEvent, DynSolType, DynSolValue, Specifier};
use alloy::json_abi::{Event, EventParam};
use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::info;

/// Solidity caps indexed event params at three (topic0 is the selector).
const MAX_INDEXED: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("malformed event declaration '{decl}': {reason}")]
    Malformed { decl: String, reason: String },
    #[error("event {event} has {count} indexed params (max 3)")]
    TooManyIndexed { event: String, count: usize },
    #[error("event {event} declares param '{param}' twice")]
    DuplicateParam { event: String, param: String },
    #[error("contract {address} on {chain} has no event schemas")]
    EmptySchemaSet { chain: ChainKind, address: Address },
    #[error("events {first} and {second} share selector {selector}")]
    DuplicateSelector {
        first: String,
        second: String,
        selector: B256,
    },
    #[error("unknown schema preset '{0}'")]
    UnknownPreset(String),
    #[error("invalid contract address '{0}'")]
    InvalidAddress(String),
}

/// Whether a contract is a governor or the voting token behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    Governance,
    Token,
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContractKind::Governance => write!(f, "governance"),
            ContractKind::Token => write!(f, "token"),
        }
    }
}

/// One event's layout plus its topic0 selector.
#[derive(Debug, Clone)]
pub struct EventSchema {
    event: Event,
    resolved: DynSolEvent,
    /// Per input: indexed reference types arrive as a hash in their topic.
    hashed: Vec<bool>,
    signature: String,
    selector: B256,
}

impl EventSchema {
    pub fn new(event: Event) -> Result<Self, RegistryError> {
        let malformed = |reason: String| RegistryError::Malformed {
            decl: event.name.clone(),
            reason,
        };

        if event.anonymous {
            return Err(malformed("anonymous events have no selector".into()));
        }

        let indexed = event.inputs.iter().filter(|p| p.indexed).count();
        if indexed > MAX_INDEXED {
            return Err(RegistryError::TooManyIndexed {
                event: event.name.clone(),
                count: indexed,
            });
        }

        let mut seen = HashSet::new();
        for p in &event.inputs {
            if p.name.is_empty() {
                return Err(malformed("every param needs a name".into()));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(RegistryError::DuplicateParam {
                    event: event.name.clone(),
                    param: p.name.clone(),
                });
            }
        }

        let resolved: DynSolEvent = event.resolve().map_err(|e| malformed(e.to_string()))?;

        let hashed = event
            .inputs
            .iter()
            .map(|p| p.indexed && !is_value_type(&p.ty))
            .collect();
        let signature = event.signature();
        let selector = event.selector();

        Ok(Self {
            event,
            resolved,
            hashed,
            signature,
            selector,
        })
    }

    /// Parse a human-readable declaration, with or without the leading
    /// `event` keyword: `Name(type [indexed] name, ...)`.
    pub fn parse(decl: &str) -> Result<Self, RegistryError> {
        let source = decl.trim().trim_end_matches(';');
        let mut event = Event::parse(source).map_err(|e| RegistryError::Malformed {
            decl: decl.to_string(),
            reason: e.to_string(),
        })?;

        // `uint` is `uint256` in the selector preimage.
        for p in event.inputs.iter_mut().filter(|p| p.components.is_empty()) {
            if let Ok(ty) = DynSolType::parse(&p.ty) {
                p.ty = ty.sol_type_name().into_owned();
            }
        }

        Self::new(event)
    }

    pub fn name(&self) -> &str {
        &self.event.name
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn params(&self) -> &[EventParam] {
        &self.event.inputs
    }

    /// Canonical signature, e.g. `Transfer(address,address,uint256)`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn selector(&self) -> B256 {
        self.selector
    }

    pub fn indexed_count(&self) -> usize {
        self.event.inputs.iter().filter(|p| p.indexed).count()
    }

    /// Decode a log's topics (selector first) and data into named fields,
    /// in declaration order.
    pub fn decode(
        &self,
        topics: &[B256],
        data: &[u8],
    ) -> Result<BTreeMap<String, AbiValue>, alloy::dyn_abi::Error> {
        let decoded = self.resolved.decode_log_parts(topics.iter().copied(), data)?;
        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();

        let mut fields = BTreeMap::new();
        for (i, param) in self.event.inputs.iter().enumerate() {
            let value = if param.indexed { indexed.next() } else { body.next() };
            let value = match value {
                Some(DynSolValue::FixedBytes(word, 32)) if self.hashed[i] => AbiValue::Hashed(word),
                Some(v) => AbiValue::from(v),
                None => {
                    return Err(alloy::dyn_abi::Error::TopicLengthMismatch {
                        expected: 1 + self.indexed_count(),
                        actual: topics.len(),
                    })
                }
            };
            fields.insert(param.name.clone(), value);
        }
        Ok(fields)
    }
}

impl PartialEq for EventSchema {
    fn eq(&self, other: &Self) -> bool {
        self.event == other.event
    }
}

impl Eq for EventSchema {}

fn is_value_type(ty: &str) -> bool {
    matches!(
        DynSolType::parse(ty),
        Ok(DynSolType::Address
            | DynSolType::Bool
            | DynSolType::Int(_)
            | DynSolType::Uint(_)
            | DynSolType::FixedBytes(_)
            | DynSolType::Function)
    )
}

/// A watched contract.
#[derive(Debug, Clone)]
pub struct ContractRegistration {
    pub chain: ChainKind,
    pub address: Address,
    pub kind: ContractKind,
    schemas: HashMap<B256, EventSchema>,
}

impl ContractRegistration {
    pub fn schema(&self, selector: &B256) -> Option<&EventSchema> {
        self.schemas.get(selector)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &EventSchema> {
        self.schemas.values()
    }
}

/// Maps (chain, address) to the contract's registration.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: HashMap<(ChainKind, Address), ContractRegistration>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a contract. The schema set is validated up front.
    pub fn register(
        &mut self,
        chain: ChainKind,
        address: Address,
        kind: ContractKind,
        schemas: Vec<EventSchema>,
    ) -> Result<(), RegistryError> {
        if schemas.is_empty() {
            return Err(RegistryError::EmptySchemaSet { chain, address });
        }

        let mut by_selector: HashMap<B256, EventSchema> = HashMap::with_capacity(schemas.len());
        for schema in schemas {
            if let Some(existing) = by_selector.get(&schema.selector()) {
                if existing != &schema {
                    return Err(RegistryError::DuplicateSelector {
                        first: existing.signature().to_string(),
                        second: schema.signature().to_string(),
                        selector: schema.selector(),
                    });
                }
            }
            by_selector.insert(schema.selector(), schema);
        }

        info!(
            chain = %chain,
            address = %address,
            kind = %kind,
            events = by_selector.len(),
            "registered contract"
        );

        self.contracts.insert(
            (chain, address),
            ContractRegistration {
                chain,
                address,
                kind,
                schemas: by_selector,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, chain: ChainKind, address: &Address) -> Option<&ContractRegistration> {
        self.contracts.get(&(chain, *address))
    }

    pub fn is_registered(&self, chain: ChainKind, address: &Address) -> bool {
        self.contracts.contains_key(&(chain, *address))
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn count_for(&self, chain: ChainKind) -> usize {
        self.contracts.keys().filter(|(c, _)| *c == chain).count()
    }
}

/// Built-in schema sets.
pub mod presets {
    use super::{EventSchema, RegistryError};

    /// Governor Bravo / OpenZeppelin Governor lifecycle and voting events.
    pub const GOVERNOR_EVENTS: &[&str] = &[
        "ProposalCreated(uint256 proposalId, address proposer, address[] targets, uint256[] values, string[] signatures, bytes[] calldatas, uint256 startBlock, uint256 endBlock, string description)",
        "VoteCast(address indexed voter, uint256 proposalId, uint8 support, uint256 weight, string reason)",
        "ProposalExecuted(uint256 proposalId)",
        "ProposalCanceled(uint256 proposalId)",
    ];

    /// ERC20Votes-style governance token.
    pub const TOKEN_EVENTS: &[&str] = &[
        "Transfer(address indexed from, address indexed to, uint256 value)",
        "DelegateChanged(address indexed delegator, address indexed fromDelegate, address indexed toDelegate)",
    ];

    pub fn by_name(name: &str) -> Result<Vec<EventSchema>, RegistryError> {
        let decls = match name.trim().to_ascii_lowercase().as_str() {
            "governor" | "governance" => GOVERNOR_EVENTS,
            "token" | "erc20votes" => TOKEN_EVENTS,
            other => return Err(RegistryError::UnknownPreset(other.to_string())),
        };
        decls.iter().map(|d| EventSchema::parse(d)).collect()
    }

    pub fn governor() -> Result<Vec<EventSchema>, RegistryError> {
        by_name("governor")
    }

    pub fn token() -> Result<Vec<EventSchema>, RegistryError> {
        by_name("token")
    }
}
