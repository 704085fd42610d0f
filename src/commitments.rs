//! Commitment construction.
//!
//! A commitment is a short-lived value object that, given a channel/app
//! snapshot, deterministically computes (a) the digest each signer must sign
//! and (b) the on-chain transaction the collected signatures authorize.
//! Commitments are never persisted; both parties rebuild them from their own
//! ledger copy and must arrive at byte-identical digests.

mod install;
mod multisig;
mod set_state;
mod setup;
mod uninstall;
mod virtual_app;
mod withdraw;

pub use install::InstallCommitment;
pub use multisig::{
    selector, signatures_in_signer_order, MultiSend, MultisigOperation, MultisigTransaction,
};
pub use set_state::SetStateCommitment;
pub use setup::SetupCommitment;
pub use uninstall::UninstallCommitment;
pub use virtual_app::{
    VirtualAppAgreementCommitment, VirtualAppSetStateCommitment, EXPIRY_VERSION_NUMBER,
};
pub use withdraw::WithdrawCommitment;

use crate::abiencode::types::{Address, Hash, Signature, U256};
use crate::sig;

/// Leading byte of every commitment digest. Guards against a signature for
/// one commitment kind being replayed as another.
pub const COMMITMENT_TAG: u8 = 0x19;

/// The on-chain transaction a fully signed commitment authorizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub to: Address,
    pub value: U256,
    pub data: Vec<u8>,
}

/// Shared contract of all commitment types.
pub trait Commitment {
    /// The digest each party signs.
    fn hash_to_sign(&self) -> Hash;

    /// The final transaction once all signatures are known. Fails only if a
    /// signature is unrecoverable (needed to order them canonically).
    fn transaction(&self, signatures: &[Signature]) -> Result<Transaction, sig::Error>;
}
