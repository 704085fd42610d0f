//! Off-chain state channel protocol engine.
//!
//! Two or more parties open a shared ledger (a channel) backed by an on-chain
//! multisig wallet, install and uninstall off-chain applications funded by
//! that ledger, update application state, and withdraw funds. The chain is
//! only touched at open/close or in a dispute; in between, every transition
//! is a mutually signed commitment that could be submitted if the
//! counterparty disappears.
//!
//! The crate is organised around four pieces:
//!
//! - [`state`]: the persistent, versioned channel ledger. All mutators are
//!   pure and return a new [`state::StateChannel`].
//! - [`commitments`]: one value type per on-chain operation, each producing
//!   the digest every party must sign and the final signed transaction.
//! - [`protocol`] + [`engine`]: named multi-step handshakes (Setup, Propose,
//!   Install, ...) run as explicit, interruptible state machines driven by
//!   message exchange.
//! - [`queue`]: the shard-locking scheduler that serialises concurrent
//!   protocol instances touching the same channel or app.

pub mod abiencode {
    mod encode;
    mod error;
    mod hashing;

    pub mod types;

    pub use encode::{encode, AbiEncodings, AbiType, AbiValue, PackedEncoder};
    pub use error::{Error, Result};
    pub use hashing::keccak256;

    #[cfg(test)]
    mod tests;
}

pub mod keys;
pub mod sig;

pub mod commitments;
pub mod state;

pub mod engine;
pub mod protocol;
pub mod queue;

pub mod network;
pub mod store;
pub mod wire;

mod client;

pub use abiencode::types::{Address, Hash, Signature, U256};
pub use client::{Node, PROTOCOL_TIMEOUT_SECS};
pub use keys::{KeyCache, Wallet, Xpub};
pub use network::NetworkContext;
pub use protocol::{Protocol, ProtocolError, ProtocolParams};
