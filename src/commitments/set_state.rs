//! The commitment behind every accepted app state update.

use super::{selector, Commitment, Transaction, COMMITMENT_TAG};
use crate::abiencode::{
    encode,
    types::{Address, Hash, Signature, U256},
    AbiType, AbiValue, PackedEncoder,
};
use crate::sig;

/// Authorizes the challenge registry to accept `state_hash` at
/// `version_number` for the app identified by `app_identity_hash`.
///
/// digest = keccak(0x19 ‖ identityHash ‖ versionNumber ‖ timeout ‖
/// keccak(state)); the leading tag byte guards against cross-protocol
/// signature reuse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStateCommitment {
    pub challenge_registry: Address,
    pub app_identity_hash: Hash,
    pub state_hash: Hash,
    pub version_number: u64,
    pub timeout: u64,
}

impl Commitment for SetStateCommitment {
    fn hash_to_sign(&self) -> Hash {
        PackedEncoder::new()
            .push_u8(COMMITMENT_TAG)
            .push_hash(self.app_identity_hash)
            .push_u64(self.version_number)
            .push_u64(self.timeout)
            .push_hash(self.state_hash)
            .keccak()
    }

    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        let ordered = super::signatures_in_signer_order(self.hash_to_sign(), signatures)?;
        let mut packed_sigs = Vec::with_capacity(ordered.len() * 65);
        for s in &ordered {
            packed_sigs.extend_from_slice(&s.0);
        }

        let mut data = selector("setState(bytes32,bytes32,uint256,uint256,bytes)").to_vec();
        data.extend(
            encode(
                &[
                    AbiType::Bytes32,
                    AbiType::Bytes32,
                    AbiType::Uint256,
                    AbiType::Uint256,
                    AbiType::Bytes,
                ],
                &[
                    AbiValue::Bytes32(self.app_identity_hash),
                    AbiValue::Bytes32(self.state_hash),
                    AbiValue::Uint(U256::from(self.version_number)),
                    AbiValue::Uint(U256::from(self.timeout)),
                    AbiValue::Bytes(packed_sigs),
                ],
            )
            .unwrap(),
        );

        Ok(Transaction {
            to: self.challenge_registry,
            value: U256::zero(),
            data,
        })
    }
}
