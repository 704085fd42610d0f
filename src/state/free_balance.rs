//! The distinguished app instance tracking undedicated per-token balances.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{app_instance::identity_hash, Error};
use crate::abiencode::{
    encode, keccak256,
    types::{Address, Hash, U256},
    AbiType, AbiValue,
};
use crate::network::NetworkContext;

/// Challenge window of the free balance app, in blocks.
pub const FREE_BALANCE_APP_TIMEOUT: u64 = 172_800;

/// Sequence number of the free balance in every channel's app-creation
/// sequence. User apps start at 1.
pub const FREE_BALANCE_APP_SEQ_NO: u64 = 0;

/// Per-token balance tuples of a channel, versioned like any other app:
/// every install, uninstall and withdrawal is a set-state on this instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeBalance {
    /// Root signing addresses of the channel owners, sorted ascending. These
    /// are the free balance app's participants.
    participants: Vec<Address>,
    version: u64,
    timeout: u64,
    /// token -> beneficiary -> amount.
    balances: BTreeMap<Address, BTreeMap<Address, U256>>,
}

impl FreeBalance {
    pub fn new(participants: Vec<Address>) -> Self {
        FreeBalance {
            participants,
            version: 0,
            timeout: FREE_BALANCE_APP_TIMEOUT,
            balances: BTreeMap::new(),
        }
    }

    pub fn participants(&self) -> &[Address] {
        &self.participants
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn balance_of(&self, token: Address, beneficiary: Address) -> U256 {
        self.balances
            .get(&token)
            .and_then(|per_token| per_token.get(&beneficiary))
            .copied()
            .unwrap_or_default()
    }

    /// All balances for one token in participant order.
    pub fn balances_for(&self, token: Address) -> Vec<(Address, U256)> {
        self.participants
            .iter()
            .map(|p| (*p, self.balance_of(token, *p)))
            .collect()
    }

    pub fn tokens(&self) -> impl Iterator<Item = Address> + '_ {
        self.balances.keys().copied()
    }

    pub(super) fn credit(
        &mut self,
        token: Address,
        beneficiary: Address,
        amount: U256,
    ) -> Result<(), Error> {
        let entry = self
            .balances
            .entry(token)
            .or_default()
            .entry(beneficiary)
            .or_default();
        *entry = entry
            .checked_add(amount)
            .ok_or(Error::BalanceOverflow { token, beneficiary })?;
        Ok(())
    }

    pub(super) fn deduct(
        &mut self,
        token: Address,
        beneficiary: Address,
        amount: U256,
    ) -> Result<(), Error> {
        let available = self.balance_of(token, beneficiary);
        if available < amount {
            return Err(Error::InsufficientFunds {
                token,
                needed: amount,
                available,
            });
        }
        self.balances
            .entry(token)
            .or_default()
            .insert(beneficiary, available - amount);
        Ok(())
    }

    pub(super) fn bump_version(&mut self) {
        self.version += 1;
    }

    /// Identity hash of the free balance app instance: the IdentityApp at
    /// channel nonce 0 with the root signing addresses as participants.
    pub fn identity_hash(&self, network: &NetworkContext) -> Hash {
        identity_hash(
            &self.participants,
            network.identity_app,
            self.timeout,
            FREE_BALANCE_APP_SEQ_NO,
        )
    }

    /// The ABI shape of the free balance state:
    /// `(address, (address, uint256)[])[]`, one entry per funded token.
    pub fn abi_state_types() -> Vec<AbiType> {
        vec![AbiType::Array(Box::new(AbiType::Tuple(vec![
            AbiType::Address,
            AbiType::Array(Box::new(AbiType::Tuple(vec![
                AbiType::Address,
                AbiType::Uint256,
            ]))),
        ])))]
    }

    pub fn to_abi_state(&self) -> Vec<AbiValue> {
        let per_token = self
            .balances
            .iter()
            .map(|(token, entries)| {
                AbiValue::Tuple(vec![
                    AbiValue::Address(*token),
                    AbiValue::Array(
                        entries
                            .iter()
                            .map(|(to, amount)| {
                                AbiValue::Tuple(vec![
                                    AbiValue::Address(*to),
                                    AbiValue::Uint(*amount),
                                ])
                            })
                            .collect(),
                    ),
                ])
            })
            .collect();
        vec![AbiValue::Array(per_token)]
    }

    pub fn state_hash(&self) -> Hash {
        // The state shape is fixed, encoding cannot fail.
        keccak256(&encode(&Self::abi_state_types(), &self.to_abi_state()).unwrap())
    }
}
