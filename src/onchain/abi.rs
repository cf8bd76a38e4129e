//! Decoded event parameter values.
//!
//! Log decoding itself is alloy's (`dyn_abi`); this module narrows its
//! `DynSolValue` into the handful of shapes governance events carry and
//! gives them serde output and typed accessors.

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, B256, I256, U256};
use serde::Serialize;

/// A decoded event parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AbiValue {
    Address(Address),
    Bool(bool),
    Uint(U256),
    Int(I256),
    FixedBytes(Bytes),
    Bytes(Bytes),
    String(String),
    Array(Vec<AbiValue>),
    Tuple(Vec<AbiValue>),
    /// An indexed reference-type value: only its keccak-256 hash is on-chain.
    Hashed(B256),
}

impl AbiValue {
    pub fn as_u256(&self) -> Option<U256> {
        match self {
            AbiValue::Uint(v) => Some(*v),
            AbiValue::Int(v) if !v.is_negative() => Some(v.into_raw()),
            AbiValue::Bool(b) => Some(U256::from(*b as u8)),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_u256().and_then(|v| u64::try_from(v).ok())
    }

    pub fn as_address(&self) -> Option<Address> {
        match self {
            AbiValue::Address(a) => Some(*a),
            _ => None,
        }
    }

    /// Booleans, and integers read as "non-zero" (governor `support` is a uint8).
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AbiValue::Bool(b) => Some(*b),
            AbiValue::Uint(v) => Some(!v.is_zero()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AbiValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<DynSolValue> for AbiValue {
    fn from(value: DynSolValue) -> Self {
        match value {
            DynSolValue::Address(a) => AbiValue::Address(a),
            DynSolValue::Bool(b) => AbiValue::Bool(b),
            DynSolValue::Uint(v, _) => AbiValue::Uint(v),
            DynSolValue::Int(v, _) => AbiValue::Int(v),
            DynSolValue::FixedBytes(word, size) => {
                AbiValue::FixedBytes(Bytes::copy_from_slice(&word[..size.min(32)]))
            }
            DynSolValue::Function(f) => AbiValue::FixedBytes(Bytes::copy_from_slice(f.as_slice())),
            DynSolValue::Bytes(b) => AbiValue::Bytes(Bytes::from(b)),
            DynSolValue::String(s) => AbiValue::String(s),
            DynSolValue::Array(items) | DynSolValue::FixedArray(items) => {
                AbiValue::Array(items.into_iter().map(AbiValue::from).collect())
            }
            DynSolValue::Tuple(items) => AbiValue::Tuple(items.into_iter().map(AbiValue::from).collect()),
            #[allow(unreachable_patterns)]
            other => AbiValue::Bytes(Bytes::from(other.abi_encode())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;

    #[test]
    fn test_from_dyn_values() {
        let who = address!("00000000000000000000000000000000000000aa");
        assert_eq!(AbiValue::from(DynSolValue::Address(who)), AbiValue::Address(who));
        assert_eq!(
            AbiValue::from(DynSolValue::Uint(U256::from(7), 8)),
            AbiValue::Uint(U256::from(7))
        );

        let mut word = B256::ZERO;
        word[0] = 0xab;
        word[1] = 0xcd;
        assert_eq!(
            AbiValue::from(DynSolValue::FixedBytes(word, 2)),
            AbiValue::FixedBytes(Bytes::from(vec![0xab, 0xcd]))
        );

        let strings = DynSolValue::Array(vec![
            DynSolValue::String("a".into()),
            DynSolValue::String("bc".into()),
        ]);
        assert_eq!(
            AbiValue::from(strings),
            AbiValue::Array(vec![AbiValue::String("a".into()), AbiValue::String("bc".into())])
        );
    }

    #[test]
    fn test_accessors() {
        assert_eq!(AbiValue::Uint(U256::from(2)).as_bool(), Some(true));
        assert_eq!(AbiValue::Uint(U256::ZERO).as_bool(), Some(false));
        assert_eq!(AbiValue::Bool(true).as_u64(), Some(1));
        assert_eq!(AbiValue::Int(I256::MINUS_ONE).as_u256(), None);
        assert_eq!(AbiValue::Uint(U256::MAX).as_u64(), None);
        assert_eq!(AbiValue::String("x".into()).as_address(), None);
    }
}
