use sha3::{Digest, Keccak256};

use super::types::Hash;

/// keccak256 of an arbitrary byte string. Every digest in this crate goes
/// through here.
pub fn keccak256(data: &[u8]) -> Hash {
    Hash(Keccak256::digest(data).into())
}
