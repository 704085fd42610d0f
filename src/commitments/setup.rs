//! The commitment signed at channel setup.

use super::{
    selector, Commitment, MultisigOperation, MultisigTransaction, Transaction,
};
use crate::abiencode::{
    encode,
    types::{Hash, Signature, U256},
    AbiType, AbiValue,
};
use crate::network::NetworkContext;
use crate::sig;
use crate::state::StateChannel;

/// Authorizes the conditional-transaction delegate to pay out the free
/// balance according to whatever outcome the challenge registry eventually
/// reports for it. Signing this is what turns a bare multisig into a
/// channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupCommitment {
    inner: MultisigTransaction,
}

impl SetupCommitment {
    pub fn new(network: &NetworkContext, channel: &StateChannel) -> Self {
        let free_balance_identity = channel.free_balance().identity_hash(network);

        let mut data = selector("executeEffectOfFreeBalance(address,bytes32,address)").to_vec();
        data.extend(
            // Statically well-typed, encoding cannot fail.
            encode(
                &[AbiType::Address, AbiType::Bytes32, AbiType::Address],
                &[
                    AbiValue::Address(network.challenge_registry),
                    AbiValue::Bytes32(free_balance_identity),
                    AbiValue::Address(network.coin_transfer_interpreter),
                ],
            )
            .unwrap(),
        );

        SetupCommitment {
            inner: MultisigTransaction {
                multisig_address: channel.multisig_address(),
                to: network.conditional_transaction_delegate,
                value: U256::zero(),
                data,
                operation: MultisigOperation::DelegateCall,
            },
        }
    }
}

impl Commitment for SetupCommitment {
    fn hash_to_sign(&self) -> Hash {
        self.inner.hash_to_sign()
    }

    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        self.inner.transaction(signatures)
    }
}
