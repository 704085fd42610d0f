//! Transactions executed by the channel's n-of-n multisig wallet.

use serde::{Deserialize, Serialize};

use super::{Commitment, Transaction, COMMITMENT_TAG};
use crate::abiencode::{
    encode, keccak256,
    types::{Address, Hash, Signature, U256},
    AbiType, AbiValue, PackedEncoder,
};
use crate::sig;

/// First four bytes of keccak256 of the function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash.0[0], hash.0[1], hash.0[2], hash.0[3]]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MultisigOperation {
    Call = 0,
    DelegateCall = 1,
}

/// Order signatures by the numeric value of their recovered signer address.
///
/// Both parties assemble the signature array independently; sorting by
/// recovered signer is the tie-break rule that makes the arrays identical
/// without exchanging ordering metadata.
pub fn signatures_in_signer_order(
    digest: Hash,
    signatures: &[Signature],
) -> Result<Vec<Signature>, sig::Error> {
    let mut keyed = Vec::with_capacity(signatures.len());
    for s in signatures {
        keyed.push((sig::recover_signer(digest, *s)?, *s));
    }
    keyed.sort_by_key(|(addr, _)| *addr);
    Ok(keyed.into_iter().map(|(_, s)| s).collect())
}

/// One transaction from the multisig wallet, the base of every commitment
/// that touches the chain through the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigTransaction {
    pub multisig_address: Address,
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
    pub operation: MultisigOperation,
}

impl Commitment for MultisigTransaction {
    fn hash_to_sign(&self) -> Hash {
        PackedEncoder::new()
            .push_u8(COMMITMENT_TAG)
            .push_address(self.multisig_address)
            .push_address(self.to)
            .push_u256(self.value)
            .push_hash(keccak256(&self.data))
            .push_u8(self.operation as u8)
            .keccak()
    }

    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        let ordered = signatures_in_signer_order(self.hash_to_sign(), signatures)?;
        let mut packed_sigs = Vec::with_capacity(ordered.len() * 65);
        for s in &ordered {
            packed_sigs.extend_from_slice(&s.0);
        }

        let mut data = selector("execTransaction(address,uint256,bytes,uint8,bytes)").to_vec();
        data.extend(
            // Arguments are statically well-typed, encoding cannot fail.
            encode(
                &[
                    AbiType::Address,
                    AbiType::Uint256,
                    AbiType::Bytes,
                    AbiType::Uint256,
                    AbiType::Bytes,
                ],
                &[
                    AbiValue::Address(self.to),
                    AbiValue::Uint(self.value),
                    AbiValue::Bytes(self.data.clone()),
                    AbiValue::Uint(U256::from(self.operation as u8)),
                    AbiValue::Bytes(packed_sigs),
                ],
            )
            .unwrap(),
        );

        Ok(Transaction {
            to: self.multisig_address,
            value: U256::zero(),
            data,
        })
    }
}

/// A batch of sub-transactions executed atomically through the MultiSend
/// library contract, so several state transitions (e.g. a free balance
/// update and a new app's conditional transaction) land as one on-chain
/// call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiSend {
    pub multi_send_address: Address,
    pub transactions: Vec<(MultisigOperation, Address, U256, Vec<u8>)>,
}

impl MultiSend {
    /// Pack the batch (op ‖ to ‖ value ‖ len ‖ data per entry) and wrap it
    /// in a delegatecall from the multisig.
    pub fn into_multisig_transaction(self, multisig_address: Address) -> MultisigTransaction {
        let mut batch = PackedEncoder::new();
        for (op, to, value, data) in &self.transactions {
            batch = batch
                .push_u8(*op as u8)
                .push_address(*to)
                .push_u256(*value)
                .push_u256(U256::from(data.len()))
                .push_bytes(data);
        }

        let mut data = selector("multiSend(bytes)").to_vec();
        data.extend(
            encode(&[AbiType::Bytes], &[AbiValue::Bytes(batch.finish())]).unwrap(),
        );

        MultisigTransaction {
            multisig_address,
            to: self.multi_send_address,
            value: U256::zero(),
            data,
            operation: MultisigOperation::DelegateCall,
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::sig::Signer;

    fn sample_tx() -> MultisigTransaction {
        MultisigTransaction {
            multisig_address: Address([0xcc; 20]),
            to: Address([0xdd; 20]),
            value: U256::from(7),
            data: vec![1, 2, 3],
            operation: MultisigOperation::DelegateCall,
        }
    }

    #[test]
    fn digest_is_deterministic_and_input_sensitive() {
        let tx = sample_tx();
        assert_eq!(tx.hash_to_sign(), sample_tx().hash_to_sign());

        let mut other = sample_tx();
        other.operation = MultisigOperation::Call;
        assert_ne!(tx.hash_to_sign(), other.hash_to_sign());

        let mut other = sample_tx();
        other.data = vec![1, 2, 4];
        assert_ne!(tx.hash_to_sign(), other.hash_to_sign());
    }

    #[test]
    fn signatures_are_ordered_by_signer() {
        let mut rng = StdRng::seed_from_u64(30);
        let a = Signer::new(&mut rng);
        let b = Signer::new(&mut rng);
        let digest = Hash(rng.gen());

        let sig_a = a.sign_eth(digest);
        let sig_b = b.sign_eth(digest);

        let forward = signatures_in_signer_order(digest, &[sig_a, sig_b]).unwrap();
        let backward = signatures_in_signer_order(digest, &[sig_b, sig_a]).unwrap();
        assert_eq!(forward, backward);
    }

    #[test]
    fn transaction_targets_the_multisig() {
        let mut rng = StdRng::seed_from_u64(31);
        let a = Signer::new(&mut rng);
        let b = Signer::new(&mut rng);

        let tx = sample_tx();
        let digest = tx.hash_to_sign();
        let out = tx
            .transaction(&[a.sign_eth(digest), b.sign_eth(digest)])
            .unwrap();
        assert_eq!(out.to, tx.multisig_address);
        assert_eq!(out.value, U256::zero());
        assert_eq!(
            &out.data[..4],
            &selector("execTransaction(address,uint256,bytes,uint8,bytes)")
        );
    }

    #[test]
    fn multi_send_batches_into_one_delegatecall() {
        let batch = MultiSend {
            multi_send_address: Address([0x04; 20]),
            transactions: vec![
                (MultisigOperation::Call, Address([0x0a; 20]), U256::from(1), vec![]),
                (
                    MultisigOperation::DelegateCall,
                    Address([0x0b; 20]),
                    U256::zero(),
                    vec![0xff],
                ),
            ],
        };
        let tx = batch.into_multisig_transaction(Address([0xcc; 20]));
        assert_eq!(tx.to, Address([0x04; 20]));
        assert_eq!(tx.operation, MultisigOperation::DelegateCall);
        assert_eq!(&tx.data[..4], &selector("multiSend(bytes)"));
    }
}
