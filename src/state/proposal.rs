//! The not-yet-installed counterpart of an app instance.

use serde::{Deserialize, Serialize};

use super::OutcomeSpec;
use crate::abiencode::{
    types::{Address, Hash, U256},
    AbiEncodings, AbiValue,
};
use crate::keys::Xpub;

/// Captures the asymmetric pre-agreement data of a proposed app, keyed by
/// the same identity hash the installed instance will eventually have.
///
/// Deposits are recorded in the proposer's frame of reference: the
/// `initiator_*` fields belong to whoever proposed, regardless of the
/// channel's canonical participant order. Install symmetrizes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstanceProposal {
    pub identity_hash: Hash,
    /// Assigned at proposal time as `num_proposed_apps + 1`; install reads
    /// it from here and never recomputes it.
    pub app_seq_no: u64,
    pub proposed_by: Xpub,
    pub proposed_to: Xpub,
    pub app_definition: Address,
    pub abi_encodings: AbiEncodings,
    pub initiator_deposit: U256,
    pub initiator_deposit_token: Address,
    pub responder_deposit: U256,
    pub responder_deposit_token: Address,
    pub default_timeout: u64,
    pub initial_state: Vec<AbiValue>,
    pub outcome: OutcomeSpec,
    /// Set when the app is funded through an intermediary's two direct
    /// channels instead of a single direct channel.
    pub intermediary: Option<Xpub>,
}
