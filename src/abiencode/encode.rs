//! Solidity ABI encoding over a closed value type.
//!
//! App states are carried around as [`AbiValue`] trees and re-encoded against
//! the app's declared [`AbiType`] tuple whenever they change. Encoding is the
//! standard head/tail slot layout: static values occupy their slots in the
//! head, dynamic values leave a 32-byte offset in the head and append their
//! content to the tail.

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::types::{Address, Hash, U256};

const SLOT_SIZE: usize = 32;

/// One Solidity type as declared in an app's ABI encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbiType {
    Uint256,
    Address,
    Bool,
    Bytes32,
    Bytes,
    Array(Box<AbiType>),
    Tuple(Vec<AbiType>),
}

/// One Solidity value. The encoder checks it against its declared [`AbiType`]
/// and fails with [`Error::TypeMismatch`] if the shapes diverge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbiValue {
    Uint(U256),
    Address(Address),
    Bool(bool),
    Bytes32(Hash),
    Bytes(Vec<u8>),
    Array(Vec<AbiValue>),
    Tuple(Vec<AbiValue>),
}

impl AbiValue {
    fn type_name(&self) -> &'static str {
        match self {
            AbiValue::Uint(_) => "uint256",
            AbiValue::Address(_) => "address",
            AbiValue::Bool(_) => "bool",
            AbiValue::Bytes32(_) => "bytes32",
            AbiValue::Bytes(_) => "bytes",
            AbiValue::Array(_) => "array",
            AbiValue::Tuple(_) => "tuple",
        }
    }
}

impl AbiType {
    fn name(&self) -> &'static str {
        match self {
            AbiType::Uint256 => "uint256",
            AbiType::Address => "address",
            AbiType::Bool => "bool",
            AbiType::Bytes32 => "bytes32",
            AbiType::Bytes => "bytes",
            AbiType::Array(_) => "array",
            AbiType::Tuple(_) => "tuple",
        }
    }

    fn is_dynamic(&self) -> bool {
        match self {
            AbiType::Uint256 | AbiType::Address | AbiType::Bool | AbiType::Bytes32 => false,
            AbiType::Bytes | AbiType::Array(_) => true,
            AbiType::Tuple(members) => members.iter().any(AbiType::is_dynamic),
        }
    }

    /// Size of this type's head in bytes. Dynamic types occupy exactly one
    /// offset slot.
    fn head_size(&self) -> usize {
        if self.is_dynamic() {
            return SLOT_SIZE;
        }
        match self {
            AbiType::Tuple(members) => members.iter().map(AbiType::head_size).sum(),
            _ => SLOT_SIZE,
        }
    }
}

/// The declared ABI encodings of an app: the state tuple and, for apps that
/// accept actions, the action tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiEncodings {
    pub state: Vec<AbiType>,
    pub action: Option<Vec<AbiType>>,
}

/// ABI-encode `values` as the tuple declared by `types`.
///
/// This is the validity check the channel model relies on: a state that does
/// not re-encode against its declared encoding is rejected before any
/// signature is requested.
pub fn encode(types: &[AbiType], values: &[AbiValue]) -> Result<Vec<u8>> {
    if types.len() != values.len() {
        return Err(Error::ArityMismatch {
            expected: types.len(),
            got: values.len(),
        });
    }
    let mut out = Vec::new();
    encode_members(types, values, &mut out)?;
    Ok(out)
}

fn check(ty: &AbiType, value: &AbiValue) -> Result<()> {
    let ok = matches!(
        (ty, value),
        (AbiType::Uint256, AbiValue::Uint(_))
            | (AbiType::Address, AbiValue::Address(_))
            | (AbiType::Bool, AbiValue::Bool(_))
            | (AbiType::Bytes32, AbiValue::Bytes32(_))
            | (AbiType::Bytes, AbiValue::Bytes(_))
            | (AbiType::Array(_), AbiValue::Array(_))
            | (AbiType::Tuple(_), AbiValue::Tuple(_))
    );
    if !ok {
        return Err(Error::TypeMismatch {
            expected: ty.name(),
            got: value.type_name(),
        });
    }
    Ok(())
}

fn encode_members(types: &[AbiType], values: &[AbiValue], out: &mut Vec<u8>) -> Result<()> {
    let head_size: usize = types.iter().map(AbiType::head_size).sum();
    let mut tail: Vec<u8> = Vec::new();

    for (ty, value) in types.iter().zip(values) {
        check(ty, value)?;
        if ty.is_dynamic() {
            out.extend_from_slice(&U256::from(head_size + tail.len()).to_word());
            encode_tail(ty, value, &mut tail)?;
        } else {
            encode_static(ty, value, out)?;
        }
    }
    out.extend_from_slice(&tail);
    Ok(())
}

fn encode_static(ty: &AbiType, value: &AbiValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        AbiValue::Uint(v) => out.extend_from_slice(&v.to_word()),
        AbiValue::Bool(v) => out.extend_from_slice(&U256::from(*v as u8).to_word()),
        AbiValue::Address(a) => {
            let mut word = [0u8; SLOT_SIZE];
            word[SLOT_SIZE - 20..].copy_from_slice(&a.0);
            out.extend_from_slice(&word);
        }
        AbiValue::Bytes32(h) => out.extend_from_slice(&h.0),
        AbiValue::Tuple(members) => {
            let member_types = match ty {
                AbiType::Tuple(t) => t,
                // check() already matched the shapes.
                _ => unreachable!(),
            };
            if member_types.len() != members.len() {
                return Err(Error::ArityMismatch {
                    expected: member_types.len(),
                    got: members.len(),
                });
            }
            encode_members(member_types, members, out)?;
        }
        AbiValue::Bytes(_) | AbiValue::Array(_) => unreachable!(),
    }
    Ok(())
}

fn encode_tail(ty: &AbiType, value: &AbiValue, out: &mut Vec<u8>) -> Result<()> {
    match (ty, value) {
        (AbiType::Bytes, AbiValue::Bytes(data)) => {
            out.extend_from_slice(&U256::from(data.len()).to_word());
            out.extend_from_slice(data);
            let rem = data.len() % SLOT_SIZE;
            if rem != 0 {
                out.extend_from_slice(&[0u8; SLOT_SIZE][rem..]);
            }
        }
        (AbiType::Array(elem), AbiValue::Array(values)) => {
            out.extend_from_slice(&U256::from(values.len()).to_word());
            let types: Vec<AbiType> = core::iter::repeat((**elem).clone())
                .take(values.len())
                .collect();
            encode_members(&types, values, out)?;
        }
        (AbiType::Tuple(member_types), AbiValue::Tuple(members)) => {
            if member_types.len() != members.len() {
                return Err(Error::ArityMismatch {
                    expected: member_types.len(),
                    got: members.len(),
                });
            }
            encode_members(member_types, members, out)?;
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// Tightly packed encoding, the `abi.encodePacked` counterpart.
///
/// Used for commitment digests, where every field has a fixed width and the
/// leading tag byte guards against cross-protocol signature reuse.
#[derive(Default)]
pub struct PackedEncoder {
    out: Vec<u8>,
}

impl PackedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_u8(mut self, v: u8) -> Self {
        self.out.push(v);
        self
    }

    pub fn push_address(mut self, a: Address) -> Self {
        self.out.extend_from_slice(&a.0);
        self
    }

    pub fn push_hash(mut self, h: Hash) -> Self {
        self.out.extend_from_slice(&h.0);
        self
    }

    pub fn push_u256(mut self, v: U256) -> Self {
        self.out.extend_from_slice(&v.to_word());
        self
    }

    pub fn push_u64(self, v: u64) -> Self {
        // Versions and timeouts are uint256 on-chain.
        self.push_u256(U256::from(v))
    }

    pub fn push_bytes(mut self, data: &[u8]) -> Self {
        self.out.extend_from_slice(data);
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.out
    }

    pub fn keccak(self) -> Hash {
        super::hashing::keccak256(&self.out)
    }
}
