//! A single off-chain application's ledger entry.

use serde::{Deserialize, Serialize};

use super::Error;
use crate::abiencode::{
    self, encode, keccak256,
    types::{Address, Hash, U256},
    AbiEncodings, AbiType, AbiValue,
};

/// How the app's final state is converted into balance deltas at uninstall
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeSpec {
    /// The whole locked amount goes to one of two beneficiaries (or is
    /// split), selected by the app's final state.
    TwoPartyFixedOutcome {
        token: Address,
        amount: U256,
        beneficiaries: [Address; 2],
    },
    /// The final state itself lists coin transfers, capped by `limit`.
    SingleAssetTwoPartyCoinTransfer { token: Address, limit: U256 },
}

impl OutcomeSpec {
    pub fn token(&self) -> Address {
        match self {
            OutcomeSpec::TwoPartyFixedOutcome { token, .. } => *token,
            OutcomeSpec::SingleAssetTwoPartyCoinTransfer { token, .. } => *token,
        }
    }
}

/// The deterministic identity of an app instance.
///
/// A pure function of `(participants, app_definition, default_timeout,
/// channel_nonce)`: two parties computing a proposal for the same logical
/// app independently arrive at the same hash without exchanging it.
pub fn identity_hash(
    participants: &[Address],
    app_definition: Address,
    default_timeout: u64,
    channel_nonce: u64,
) -> Hash {
    let types = [
        AbiType::Array(Box::new(AbiType::Address)),
        AbiType::Address,
        AbiType::Uint256,
        AbiType::Uint256,
    ];
    let values = [
        AbiValue::Array(participants.iter().map(|a| AbiValue::Address(*a)).collect()),
        AbiValue::Address(app_definition),
        AbiValue::Uint(U256::from(default_timeout)),
        AbiValue::Uint(U256::from(channel_nonce)),
    ];
    // The inputs are statically well-typed, encoding cannot fail.
    keccak256(&encode(&types, &values).unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstance {
    pub multisig_address: Address,
    /// Per-app derived addresses of the co-signers, sorted ascending.
    pub signing_keys: Vec<Address>,
    /// Address of the on-chain verifier contract.
    pub app_definition: Address,
    pub abi_encodings: AbiEncodings,
    pub default_timeout: u64,
    /// Position in the channel's monotonically increasing app-creation
    /// sequence. Never reused, even across uninstalls.
    pub app_seq_no: u64,
    pub latest_state: Vec<AbiValue>,
    pub latest_version_number: u64,
    pub latest_timeout: u64,
    pub outcome: OutcomeSpec,
}

impl AppInstance {
    pub fn identity_hash(&self) -> Hash {
        identity_hash(
            &self.signing_keys,
            self.app_definition,
            self.default_timeout,
            self.app_seq_no,
        )
    }

    /// ABI-encode the latest state against the declared encoding.
    pub fn encoded_state(&self) -> Result<Vec<u8>, abiencode::Error> {
        encode(&self.abi_encodings.state, &self.latest_state)
    }

    pub fn state_hash(&self) -> Result<Hash, abiencode::Error> {
        Ok(keccak256(&self.encoded_state()?))
    }

    /// Replace the state wholesale and bump the version number by exactly 1.
    ///
    /// Fails before producing a new value if `new_state` does not re-encode
    /// against the declared ABI encoding; there is no partial-field merge.
    pub fn set_state(
        &self,
        new_state: Vec<AbiValue>,
        timeout: Option<u64>,
    ) -> Result<AppInstance, Error> {
        encode(&self.abi_encodings.state, &new_state)?;
        let mut next = self.clone();
        next.latest_state = new_state;
        next.latest_version_number = self.latest_version_number + 1;
        next.latest_timeout = timeout.unwrap_or(self.default_timeout);
        Ok(next)
    }

    /// Validate an action against the declared action encoding, if any.
    pub fn check_action(&self, action: &[AbiValue]) -> Result<(), Error> {
        match &self.abi_encodings.action {
            Some(types) => {
                encode(types, action)?;
                Ok(())
            }
            None => Err(Error::InvalidOutcomeState("app does not accept actions")),
        }
    }
}
