//! Deployed contract addresses for the active chain.

use serde::{Deserialize, Serialize};

use crate::abiencode::types::Address;

/// Mapping of logical contract names to deployed addresses.
///
/// Supplied once at startup and treated as immutable for the process
/// lifetime. Commitment construction reads from here; nothing in this crate
/// ever talks to the chain itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkContext {
    pub challenge_registry: Address,
    pub minimum_viable_multisig: Address,
    pub proxy_factory: Address,
    pub multi_send: Address,
    /// The no-op app backing every channel's free balance.
    pub identity_app: Address,
    pub conditional_transaction_delegate: Address,
    pub two_party_fixed_outcome_interpreter: Address,
    pub coin_transfer_interpreter: Address,
}

impl NetworkContext {
    /// Distinct placeholder addresses, good enough for tests and for digest
    /// determinism checks.
    pub fn for_testing() -> Self {
        let addr = |b: u8| {
            let mut a = [0u8; 20];
            a[19] = b;
            Address(a)
        };
        NetworkContext {
            challenge_registry: addr(1),
            minimum_viable_multisig: addr(2),
            proxy_factory: addr(3),
            multi_send: addr(4),
            identity_app: addr(5),
            conditional_transaction_delegate: addr(6),
            two_party_fixed_outcome_interpreter: addr(7),
            coin_transfer_interpreter: addr(8),
        }
    }
}
