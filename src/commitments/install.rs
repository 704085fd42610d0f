//! The commitment signed when a proposal becomes an installed app.

use super::{
    selector, Commitment, MultiSend, MultisigOperation, MultisigTransaction, Transaction,
};
use crate::abiencode::{
    encode,
    types::{Address, Hash, Signature, U256},
    AbiType, AbiValue,
};
use crate::network::NetworkContext;
use crate::sig;
use crate::state::{AppInstance, OutcomeSpec, StateChannel};

/// A multi-send batching the new app's conditional transaction together
/// with the free balance update that pays for it, so both take effect
/// atomically in a single on-chain call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallCommitment {
    inner: MultisigTransaction,
}

fn interpreter_for(network: &NetworkContext, outcome: &OutcomeSpec) -> Address {
    match outcome {
        OutcomeSpec::TwoPartyFixedOutcome { .. } => network.two_party_fixed_outcome_interpreter,
        OutcomeSpec::SingleAssetTwoPartyCoinTransfer { .. } => network.coin_transfer_interpreter,
    }
}

/// `registry.registerState(identityHash, stateHash, version, timeout)`, the
/// free-balance registration sub-call shared by install, uninstall and
/// withdraw batches. Authorized by coming from the multisig itself, so it
/// carries no signatures of its own.
pub(super) fn free_balance_registration(
    network: &NetworkContext,
    channel: &StateChannel,
) -> (MultisigOperation, Address, U256, Vec<u8>) {
    let fb = channel.free_balance();
    let mut data = selector("registerState(bytes32,bytes32,uint256,uint256)").to_vec();
    data.extend(
        encode(
            &[
                AbiType::Bytes32,
                AbiType::Bytes32,
                AbiType::Uint256,
                AbiType::Uint256,
            ],
            &[
                AbiValue::Bytes32(fb.identity_hash(network)),
                AbiValue::Bytes32(fb.state_hash()),
                AbiValue::Uint(U256::from(fb.version())),
                AbiValue::Uint(U256::from(fb.timeout())),
            ],
        )
        .unwrap(),
    );
    (
        MultisigOperation::Call,
        network.challenge_registry,
        U256::zero(),
        data,
    )
}

impl InstallCommitment {
    /// `channel` is the candidate channel *after* the install has been
    /// applied, so the batched free balance update reflects the deducted
    /// deposits.
    pub fn new(network: &NetworkContext, channel: &StateChannel, app: &AppInstance) -> Self {
        let mut conditional = selector(
            "executeEffectOfInterpretedAppOutcome(address,bytes32,address)",
        )
        .to_vec();
        conditional.extend(
            encode(
                &[AbiType::Address, AbiType::Bytes32, AbiType::Address],
                &[
                    AbiValue::Address(network.challenge_registry),
                    AbiValue::Bytes32(app.identity_hash()),
                    AbiValue::Address(interpreter_for(network, &app.outcome)),
                ],
            )
            .unwrap(),
        );

        let batch = MultiSend {
            multi_send_address: network.multi_send,
            transactions: vec![
                (
                    MultisigOperation::DelegateCall,
                    network.conditional_transaction_delegate,
                    U256::zero(),
                    conditional,
                ),
                free_balance_registration(network, channel),
            ],
        };

        InstallCommitment {
            inner: batch.into_multisig_transaction(channel.multisig_address()),
        }
    }
}

impl Commitment for InstallCommitment {
    fn hash_to_sign(&self) -> Hash {
        self.inner.hash_to_sign()
    }

    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        self.inner.transaction(signatures)
    }
}
