//! Commitments of the virtual app protocols.

use super::{
    selector, Commitment, MultisigOperation, MultisigTransaction, Transaction, COMMITMENT_TAG,
};
use crate::abiencode::{
    encode,
    types::{Address, Hash, Signature, U256},
    AbiType, AbiValue, PackedEncoder,
};
use crate::network::NetworkContext;
use crate::sig;

/// Version-number upper bound the intermediary pre-signs.
///
/// Far beyond any version the endpoints can legitimately reach, so the
/// intermediary can safely co-sign before ever seeing the final locked
/// state: whatever the endpoints converge on wins against the bound.
pub const EXPIRY_VERSION_NUMBER: u64 = u64::MAX;

/// Set-state for a virtual app.
///
/// The endpoints sign the real `(state, version)` digest; the intermediary
/// signs a different digest carrying only the expiry bound and no state
/// hash, so its signature on a locked state can never be replayed as a
/// signature on a final one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualAppSetStateCommitment {
    pub challenge_registry: Address,
    pub app_identity_hash: Hash,
    pub state_hash: Hash,
    pub version_number: u64,
    pub timeout: u64,
}

impl VirtualAppSetStateCommitment {
    pub fn hash_to_sign(&self, as_intermediary: bool) -> Hash {
        if as_intermediary {
            PackedEncoder::new()
                .push_u8(COMMITMENT_TAG)
                .push_hash(self.app_identity_hash)
                .push_u64(EXPIRY_VERSION_NUMBER)
                .push_u64(self.timeout)
                .keccak()
        } else {
            PackedEncoder::new()
                .push_u8(COMMITMENT_TAG)
                .push_hash(self.app_identity_hash)
                .push_u64(self.version_number)
                .push_u64(self.timeout)
                .push_hash(self.state_hash)
                .keccak()
        }
    }

    /// The registry call carries both the real version and the bound.
    pub fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        let ordered =
            super::signatures_in_signer_order(self.hash_to_sign(false), signatures)?;
        let mut packed_sigs = Vec::with_capacity(ordered.len() * 65);
        for s in &ordered {
            packed_sigs.extend_from_slice(&s.0);
        }

        let mut data =
            selector("virtualAppSetState(bytes32,bytes32,uint256,uint256,uint256,bytes)").to_vec();
        data.extend(
            encode(
                &[
                    AbiType::Bytes32,
                    AbiType::Bytes32,
                    AbiType::Uint256,
                    AbiType::Uint256,
                    AbiType::Uint256,
                    AbiType::Bytes,
                ],
                &[
                    AbiValue::Bytes32(self.app_identity_hash),
                    AbiValue::Bytes32(self.state_hash),
                    AbiValue::Uint(U256::from(self.version_number)),
                    AbiValue::Uint(U256::from(EXPIRY_VERSION_NUMBER)),
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

/// The capital lock in one of the intermediary's direct channels.
///
/// Represents the funds one side of the route has locked against the
/// virtual app's outcome. Exists once per direct channel (initiator ↔
/// intermediary and intermediary ↔ responder), each constructed and signed
/// independently by the two owners of that channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualAppAgreementCommitment {
    inner: MultisigTransaction,
}

impl VirtualAppAgreementCommitment {
    pub fn new(
        network: &NetworkContext,
        multisig_address: Address,
        virtual_app_identity: Hash,
        token: Address,
        capital: U256,
        beneficiaries: [Address; 2],
    ) -> Self {
        let mut data = selector(
            "executeVirtualAppAgreement(address,bytes32,uint256,uint256,address,address[])",
        )
        .to_vec();
        data.extend(
            // Statically well-typed, encoding cannot fail.
            encode(
                &[
                    AbiType::Address,
                    AbiType::Bytes32,
                    AbiType::Uint256,
                    AbiType::Uint256,
                    AbiType::Address,
                    AbiType::Array(Box::new(AbiType::Address)),
                ],
                &[
                    AbiValue::Address(network.challenge_registry),
                    AbiValue::Bytes32(virtual_app_identity),
                    AbiValue::Uint(U256::from(EXPIRY_VERSION_NUMBER)),
                    AbiValue::Uint(capital),
                    AbiValue::Address(token),
                    AbiValue::Array(
                        beneficiaries
                            .iter()
                            .map(|a| AbiValue::Address(*a))
                            .collect(),
                    ),
                ],
            )
            .unwrap(),
        );

        VirtualAppAgreementCommitment {
            inner: MultisigTransaction {
                multisig_address,
                to: network.conditional_transaction_delegate,
                value: U256::zero(),
                data,
                operation: MultisigOperation::DelegateCall,
            },
        }
    }
}

impl Commitment for VirtualAppAgreementCommitment {
    fn hash_to_sign(&self) -> Hash {
        self.inner.hash_to_sign()
    }

    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        self.inner.transaction(signatures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VirtualAppSetStateCommitment {
        VirtualAppSetStateCommitment {
            challenge_registry: Address([0x01; 20]),
            app_identity_hash: Hash([0xaa; 32]),
            state_hash: Hash([0xbb; 32]),
            version_number: 5,
            timeout: 100,
        }
    }

    #[test]
    fn intermediary_digest_differs_from_final_digest() {
        let c = sample();
        assert_ne!(c.hash_to_sign(true), c.hash_to_sign(false));
    }

    #[test]
    fn intermediary_digest_ignores_state_and_version() {
        let a = sample();
        let mut b = sample();
        b.state_hash = Hash([0xcc; 32]);
        b.version_number = 9000;
        // The bound is what the intermediary signs; the endpoints can move
        // state and version without invalidating it.
        assert_eq!(a.hash_to_sign(true), b.hash_to_sign(true));
        assert_ne!(a.hash_to_sign(false), b.hash_to_sign(false));
    }

    #[test]
    fn agreement_digest_is_per_channel() {
        let network = NetworkContext::for_testing();
        let mk = |multisig: [u8; 20]| {
            VirtualAppAgreementCommitment::new(
                &network,
                Address(multisig),
                Hash([0xaa; 32]),
                Address::default(),
                U256::from(10),
                [Address([0x01; 20]), Address([0x02; 20])],
            )
        };
        assert_ne!(
            mk([0xcc; 20]).hash_to_sign(),
            mk([0xcd; 20]).hash_to_sign()
        );
        assert_eq!(
            mk([0xcc; 20]).hash_to_sign(),
            mk([0xcc; 20]).hash_to_sign()
        );
    }
}
