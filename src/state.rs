//! The state channel data model.
//!
//! A [`StateChannel`] is a persistent, versioned ledger of app instances,
//! proposals and per-token free balances, keyed by the on-chain multisig
//! address. All mutators are pure: they validate, then return a *new*
//! channel value, which lets the protocol engine hold candidate and
//! committed versions side by side during a multi-step handshake and commit
//! exactly once at the persistence boundary.

mod app_instance;
mod channel;
mod free_balance;
mod outcome;
mod proposal;

pub use app_instance::{identity_hash, AppInstance, OutcomeSpec};
pub use channel::StateChannel;
pub use free_balance::{FreeBalance, FREE_BALANCE_APP_TIMEOUT};
pub use outcome::compute_outcome;
pub use proposal::AppInstanceProposal;

use core::fmt::Display;

use crate::abiencode::{self, types::Address, types::Hash, types::U256};
use crate::keys;

#[derive(Debug)]
pub enum Error {
    NoSuchProposal(Hash),
    NoSuchApp(Hash),
    ProposalExists(Hash),
    /// A second install for the same identity hash. The free balance is
    /// decremented at most once per app.
    AppExists(Hash),
    /// Proposal sequence numbers are assigned at proposal time and must be
    /// exactly `num_proposed_apps + 1`.
    WrongAppSeqNo {
        expected: u64,
        got: u64,
    },
    InsufficientFunds {
        token: Address,
        needed: U256,
        available: U256,
    },
    /// A credit would push a balance past 2^256-1.
    BalanceOverflow {
        token: Address,
        beneficiary: Address,
    },
    Encoding(abiencode::Error),
    Keys(keys::Error),
    OutcomeExceedsLimit {
        limit: U256,
        total: U256,
    },
    /// The app's final state does not have the shape its outcome type needs.
    InvalidOutcomeState(&'static str),
}

impl From<abiencode::Error> for Error {
    fn from(e: abiencode::Error) -> Self {
        Self::Encoding(e)
    }
}

impl From<keys::Error> for Error {
    fn from(e: keys::Error) -> Self {
        Self::Keys(e)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::NoSuchProposal(id) => write!(f, "no proposal with identity hash {id:?}"),
            Error::NoSuchApp(id) => write!(f, "no installed app with identity hash {id:?}"),
            Error::ProposalExists(id) => write!(f, "proposal {id:?} already exists"),
            Error::AppExists(id) => write!(f, "app {id:?} is already installed"),
            Error::WrongAppSeqNo { expected, got } => {
                write!(f, "wrong app sequence number: expected {expected}, got {got}")
            }
            Error::InsufficientFunds {
                token,
                needed,
                available,
            } => write!(
                f,
                "insufficient free balance for token {token:?}: needed {needed}, available {available}"
            ),
            Error::BalanceOverflow { token, beneficiary } => write!(
                f,
                "crediting {beneficiary:?} for token {token:?} overflows a uint256"
            ),
            Error::Encoding(e) => write!(f, "state does not re-encode against its abi encoding: {e}"),
            Error::Keys(e) => write!(f, "signing key derivation failed: {e:?}"),
            Error::OutcomeExceedsLimit { limit, total } => {
                write!(f, "outcome total {total} exceeds interpreter limit {limit}")
            }
            Error::InvalidOutcomeState(what) => write!(f, "invalid outcome state: {what}"),
        }
    }
}

impl std::error::Error for Error {}
