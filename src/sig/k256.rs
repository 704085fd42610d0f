//! Signer using the k256 crate (pure Rust implementation of ecdsa).

use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as K256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};
use sha3::{Digest, Keccak256};

use super::hash_to_eth_signed_msg_hash;
use crate::abiencode::types::{Address, Hash, Signature};

pub use k256::ecdsa::Error;

/// Holds the local signing key and the address derived from it.
#[derive(Debug)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

pub(crate) fn address_of(key: &VerifyingKey) -> Address {
    // Convert the key into an EncodedPoint (on the curve), which has the data
    // we need in bytes [1..]. This panics if the bytes representation of
    // EncodedPoint is not 65 bytes, which is unlikely to change in the
    // dependency.
    let pk_bytes: [u8; 65] = key.to_encoded_point(false).as_bytes().try_into().unwrap();

    // Throw away the first byte, which is not part of the public key. It is
    // added by serialize_uncompressed due to the encoding used.
    let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = address_of(&key.verifying_key());
        Self { key, addr }
    }

    pub fn from_bytes(private_key: &[u8; 32]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(private_key)?;
        let addr = address_of(&key.verifying_key());
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Signature {
        let hash = hash_to_eth_signed_msg_hash(msg);

        // Signing a 32-byte prehash with a valid key cannot fail.
        let sig: recoverable::Signature = self.key.sign_prehash(&hash.0).unwrap();

        // The recoverable::Signature layout is already r || s || v, but v has
        // to be shifted by 27 for the signature to be valid in the EVM.
        let mut sig_bytes: [u8; 65] = sig.as_bytes().try_into().expect(
            "Unreachable: Signature size doesn't match, something big must have changed in the dependency",
        );
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Signature(sig_bytes)
    }
}

/// Recover the address that signed `msg` (after the Ethereum message prefix).
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
    let hash = hash_to_eth_signed_msg_hash(msg);

    // Undo adding the 27, to go back to the format expected below.
    let mut sig_bytes: [u8; 65] = eth_sig.0;
    sig_bytes[64] = sig_bytes[64].wrapping_sub(27);

    let sig = recoverable::Signature::from_bytes(&sig_bytes)?;
    let verifying_key = sig.recover_verifying_key_from_digest_bytes(&hash.0.into())?;
    Ok(address_of(&verifying_key))
}
