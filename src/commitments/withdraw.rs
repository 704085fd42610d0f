//! The commitment authorizing a withdrawal from the channel.

use super::{
    install::free_balance_registration, selector, Commitment, MultiSend, MultisigOperation,
    Transaction,
};
use crate::abiencode::{
    encode,
    types::{Address, Hash, Signature, U256},
    AbiType, AbiValue,
};
use crate::commitments::MultisigTransaction;
use crate::network::NetworkContext;
use crate::sig;
use crate::state::StateChannel;

/// A multi-send batching the value transfer to the recipient with the free
/// balance decrement, so funds can never leave the multisig without the
/// ledger moving in the same call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawCommitment {
    inner: MultisigTransaction,
}

impl WithdrawCommitment {
    /// `channel` is the candidate channel *after* the withdrawal. The zero
    /// address stands for ETH, anything else is an ERC20 transfer.
    pub fn new(
        network: &NetworkContext,
        channel: &StateChannel,
        token: Address,
        recipient: Address,
        amount: U256,
    ) -> Self {
        let transfer = if token == Address::default() {
            (MultisigOperation::Call, recipient, amount, Vec::new())
        } else {
            let mut data = selector("transfer(address,uint256)").to_vec();
            data.extend(
                encode(
                    &[AbiType::Address, AbiType::Uint256],
                    &[AbiValue::Address(recipient), AbiValue::Uint(amount)],
                )
                .unwrap(),
            );
            (MultisigOperation::Call, token, U256::zero(), data)
        };

        let batch = MultiSend {
            multi_send_address: network.multi_send,
            transactions: vec![transfer, free_balance_registration(network, channel)],
        };

        WithdrawCommitment {
            inner: batch.into_multisig_transaction(channel.multisig_address()),
        }
    }
}

impl Commitment for WithdrawCommitment {
    fn hash_to_sign(&self) -> Hash {
        self.inner.hash_to_sign()
    }

    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        self.inner.transaction(signatures)
    }
}
