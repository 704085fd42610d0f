//! Creation and verification of Ethereum signatures over commitment digests.

use sha3::{Digest, Keccak256};

use crate::abiencode::types::{Address, Hash, Signature};

mod k256;
pub use self::k256::{recover_signer, Error, Signer};

/// Add the `\x19Ethereum Signed Message:\n32` prefix to a hash.
///
/// This is the format expected by the on-chain signature checks.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding, so hash directly instead of going through the encoder.
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

#[derive(Debug)]
pub enum ValidationError {
    RecoveryFailed(Error),
    /// The recovered address is not the expected signer. The protocol
    /// instance carrying this signature must abort without persisting.
    SignatureInvalid {
        expected: Address,
        recovered: Address,
    },
}

impl From<Error> for ValidationError {
    fn from(e: Error) -> Self {
        Self::RecoveryFailed(e)
    }
}

/// Recover the signer of `digest` from `sig` and compare it to `expected`.
///
/// Every peer-supplied signature in every protocol goes through this exact
/// gate before the protocol advances past the step that depends on it.
pub fn assert_signed_by(
    digest: Hash,
    sig: Signature,
    expected: Address,
) -> Result<(), ValidationError> {
    let recovered = recover_signer(digest, sig)?;
    if recovered != expected {
        return Err(ValidationError::SignatureInvalid {
            expected,
            recovered,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests;
