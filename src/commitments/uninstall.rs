//! The commitment signed at app uninstall.

use super::{Commitment, SetStateCommitment, Transaction};
use crate::abiencode::types::{Hash, Signature};
use crate::network::NetworkContext;
use crate::sig;
use crate::state::StateChannel;

/// An uninstall is a set-state on the free balance: the app's locked value,
/// converted through its outcome, is folded back into the per-token balance
/// tuples and the free balance version moves forward. Signing the new free
/// balance state is what retires the old conditional transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UninstallCommitment {
    inner: SetStateCommitment,
}

impl UninstallCommitment {
    /// `channel` is the candidate channel *after* the uninstall.
    pub fn new(network: &NetworkContext, channel: &StateChannel) -> Self {
        let fb = channel.free_balance();
        UninstallCommitment {
            inner: SetStateCommitment {
                challenge_registry: network.challenge_registry,
                app_identity_hash: fb.identity_hash(network),
                state_hash: fb.state_hash(),
                version_number: fb.version(),
                timeout: fb.timeout(),
            },
        }
    }
}

impl Commitment for UninstallCommitment {
    fn hash_to_sign(&self) -> Hash {
        self.inner.hash_to_sign()
    }

    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error> {
        self.inner.transaction(signatures)
    }
}
