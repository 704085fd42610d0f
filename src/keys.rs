//! Extended public keys and deterministic signing-key derivation.
//!
//! Every participant is identified by an xpub-style extended public key: a
//! compressed secp256k1 point plus a 32-byte chain code. Per-channel and
//! per-app signing addresses are derived from it with non-hardened BIP32
//! child key derivation: index 0 is the root protocol signing address, index
//! `app_seq_no` signs the commitments of the app installed at that sequence
//! number. Derivation is pure, so two parties derive identical key sets
//! without exchanging anything beyond the xpubs themselves.

use core::fmt::{self, Debug, Display};
use std::collections::HashMap;

use hmac::{Hmac, Mac};
use k256::{
    ecdsa::SigningKey,
    elliptic_curve::{sec1::ToEncodedPoint, PrimeField},
    FieldBytes, ProjectivePoint, PublicKey, Scalar,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha512;
use sha3::{Digest, Keccak256};

use crate::abiencode::types::Address;
use crate::sig::Signer;

#[derive(Debug)]
pub enum Error {
    /// The serialized public key is not a valid curve point.
    InvalidPoint,
    /// The derived child key is zero or the point at infinity. Happens with
    /// probability ~2^-128; callers treat it as a hard error rather than
    /// skipping to the next index.
    InvalidChildKey,
    InvalidPrivateKey,
}

/// An extended public key: compressed point plus chain code.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Xpub {
    public_key: [u8; 33],
    chain_code: [u8; 32],
}

impl Debug for Xpub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xpub0x{}{}", hex::encode(self.public_key), hex::encode(self.chain_code))
    }
}

impl Display for Xpub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Serialize for Xpub {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = [0u8; 65];
        bytes[..33].copy_from_slice(&self.public_key);
        bytes[33..].copy_from_slice(&self.chain_code);
        serializer.serialize_str(&hex::encode(bytes))
    }
}

impl<'de> Deserialize<'de> for Xpub {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(de::Error::custom)?;
        if bytes.len() != 65 {
            return Err(de::Error::custom("xpub must be 65 bytes"));
        }
        let mut public_key = [0u8; 33];
        let mut chain_code = [0u8; 32];
        public_key.copy_from_slice(&bytes[..33]);
        chain_code.copy_from_slice(&bytes[33..]);
        Ok(Xpub {
            public_key,
            chain_code,
        })
    }
}

fn address_of_point(pk: &PublicKey) -> Address {
    // Keccak over the uncompressed point without the leading 0x04 byte.
    let encoded = pk.to_encoded_point(false);
    let hash: [u8; 32] = Keccak256::digest(&encoded.as_bytes()[1..]).into();
    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

/// HMAC-SHA512(chain_code, ser_P(parent) || index), split into the scalar
/// tweak (left half) and the child chain code (right half).
fn ckd_tweak(public_key: &[u8; 33], chain_code: &[u8; 32], index: u32) -> ([u8; 32], [u8; 32]) {
    // HMAC accepts any key length, so this cannot fail.
    let mut mac = Hmac::<Sha512>::new_from_slice(chain_code).unwrap();
    mac.update(public_key);
    mac.update(&index.to_be_bytes());
    let out = mac.finalize().into_bytes();

    let mut il = [0u8; 32];
    let mut ir = [0u8; 32];
    il.copy_from_slice(&out[..32]);
    ir.copy_from_slice(&out[32..]);
    (il, ir)
}

impl Xpub {
    pub fn new(public_key: [u8; 33], chain_code: [u8; 32]) -> Self {
        Xpub {
            public_key,
            chain_code,
        }
    }

    /// Build the xpub matching a root private key. The test harness and the
    /// wallet glue use this; the protocol engine itself only ever sees xpubs.
    pub fn from_private(private_key: &[u8; 32], chain_code: [u8; 32]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(private_key).map_err(|_| Error::InvalidPrivateKey)?;
        let point = key.verifying_key().to_encoded_point(true);
        let public_key: [u8; 33] = point
            .as_bytes()
            .try_into()
            .map_err(|_| Error::InvalidPoint)?;
        Ok(Xpub {
            public_key,
            chain_code,
        })
    }

    /// Derive the address at `index`: child = parent + IL·G.
    pub fn derive_address(&self, index: u32) -> Result<Address, Error> {
        let parent = PublicKey::from_sec1_bytes(&self.public_key).map_err(|_| Error::InvalidPoint)?;
        let (il, _) = ckd_tweak(&self.public_key, &self.chain_code, index);

        let tweak: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(&il)).into();
        let tweak = tweak.ok_or(Error::InvalidChildKey)?;

        let child = parent.to_projective() + ProjectivePoint::GENERATOR * tweak;
        let child = PublicKey::from_affine(child.to_affine()).map_err(|_| Error::InvalidChildKey)?;
        Ok(address_of_point(&child))
    }
}

/// Derive the child signing key at `index` from a root private key. The
/// resulting [`Signer`] signs for the address `xpub.derive_address(index)`.
pub fn derive_signing_key(
    private_key: &[u8; 32],
    chain_code: [u8; 32],
    index: u32,
) -> Result<Signer, Error> {
    let xpub = Xpub::from_private(private_key, chain_code)?;
    let (il, _) = ckd_tweak(&xpub.public_key, &chain_code, index);

    let parent: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(private_key)).into();
    let parent = parent.ok_or(Error::InvalidPrivateKey)?;
    let tweak: Option<Scalar> = Scalar::from_repr(*FieldBytes::from_slice(&il)).into();
    let tweak = tweak.ok_or(Error::InvalidChildKey)?;

    let child = parent + tweak;
    let child_bytes: [u8; 32] = child.to_bytes().into();
    Signer::from_bytes(&child_bytes).map_err(|_| Error::InvalidChildKey)
}

/// A participant's root key material: the private counterpart of its xpub.
///
/// The protocol engine holds exactly one of these and derives a fresh
/// [`Signer`] per signing index from it. The private key never leaves this
/// struct.
#[derive(Clone)]
pub struct Wallet {
    private_key: [u8; 32],
    chain_code: [u8; 32],
    xpub: Xpub,
}

impl Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the private key.
        f.debug_struct("Wallet").field("xpub", &self.xpub).finish()
    }
}

impl Wallet {
    pub fn new(private_key: [u8; 32], chain_code: [u8; 32]) -> Result<Self, Error> {
        let xpub = Xpub::from_private(&private_key, chain_code)?;
        Ok(Wallet {
            private_key,
            chain_code,
            xpub,
        })
    }

    pub fn random<R: rand::Rng>(rng: &mut R) -> Self {
        loop {
            if let Ok(wallet) = Wallet::new(rng.gen(), rng.gen()) {
                return wallet;
            }
        }
    }

    pub fn xpub(&self) -> Xpub {
        self.xpub
    }

    /// The signer whose address is `self.xpub().derive_address(index)`.
    pub fn signer_for(&self, index: u32) -> Result<Signer, Error> {
        derive_signing_key(&self.private_key, self.chain_code, index)
    }
}

/// Memoizes `(xpub, index) -> Address`.
///
/// Owned by whichever component derives keys and passed by reference; there
/// is no ambient global cache.
#[derive(Default, Debug)]
pub struct KeyCache {
    cache: HashMap<(Xpub, u32), Address>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derive(&mut self, xpub: &Xpub, index: u32) -> Result<Address, Error> {
        if let Some(addr) = self.cache.get(&(*xpub, index)) {
            return Ok(*addr);
        }
        let addr = xpub.derive_address(index)?;
        self.cache.insert((*xpub, index), addr);
        Ok(addr)
    }

    /// Derive one address per xpub at `index` and sort them ascending by
    /// numeric address value. This is the canonical participant order used
    /// at every boundary.
    pub fn sorted_addresses(&mut self, xpubs: &[Xpub], index: u32) -> Result<Vec<Address>, Error> {
        let mut addrs = Vec::with_capacity(xpubs.len());
        for xpub in xpubs {
            addrs.push(self.derive(xpub, index)?);
        }
        addrs.sort();
        Ok(addrs)
    }

    /// Sort the xpubs themselves by their address at index 0, the order in
    /// which multisig owners are stored.
    pub fn sorted_owners(&mut self, xpubs: &[Xpub]) -> Result<Vec<Xpub>, Error> {
        let mut keyed = Vec::with_capacity(xpubs.len());
        for xpub in xpubs {
            keyed.push((self.derive(xpub, 0)?, *xpub));
        }
        keyed.sort_by_key(|(addr, _)| *addr);
        Ok(keyed.into_iter().map(|(_, xpub)| xpub).collect())
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    fn random_root(rng: &mut StdRng) -> ([u8; 32], [u8; 32]) {
        // Not every 32-byte string is a valid scalar, but the probability of
        // hitting an invalid one with a seeded test rng is negligible.
        (rng.gen(), rng.gen())
    }

    #[test]
    fn derived_address_matches_derived_signing_key() {
        let mut rng = StdRng::seed_from_u64(10);
        let (private, chain) = random_root(&mut rng);
        let xpub = Xpub::from_private(&private, chain).unwrap();

        for index in [0u32, 1, 7, 255] {
            let signer = derive_signing_key(&private, chain, index).unwrap();
            assert_eq!(xpub.derive_address(index).unwrap(), signer.address());
        }
    }

    #[test]
    fn derivation_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(11);
        let (private, chain) = random_root(&mut rng);
        let xpub = Xpub::from_private(&private, chain).unwrap();

        assert_eq!(
            xpub.derive_address(42).unwrap(),
            xpub.derive_address(42).unwrap()
        );
        assert_ne!(
            xpub.derive_address(1).unwrap(),
            xpub.derive_address(2).unwrap()
        );
    }

    #[test]
    fn wallet_signers_match_xpub_addresses() {
        let mut rng = StdRng::seed_from_u64(14);
        let wallet = Wallet::random(&mut rng);
        let xpub = wallet.xpub();

        for index in [0u32, 1, 9] {
            let signer = wallet.signer_for(index).unwrap();
            assert_eq!(signer.address(), xpub.derive_address(index).unwrap());
        }
    }

    #[test]
    fn cache_returns_same_addresses() {
        let mut rng = StdRng::seed_from_u64(12);
        let (private, chain) = random_root(&mut rng);
        let xpub = Xpub::from_private(&private, chain).unwrap();

        let mut cache = KeyCache::new();
        let first = cache.derive(&xpub, 3).unwrap();
        let second = cache.derive(&xpub, 3).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, xpub.derive_address(3).unwrap());
    }

    #[test]
    fn sorted_addresses_are_ascending() {
        let mut rng = StdRng::seed_from_u64(13);
        let mut cache = KeyCache::new();

        let mut xpubs = Vec::new();
        for _ in 0..4 {
            let (private, chain) = random_root(&mut rng);
            xpubs.push(Xpub::from_private(&private, chain).unwrap());
        }

        let addrs = cache.sorted_addresses(&xpubs, 5).unwrap();
        for pair in addrs.windows(2) {
            assert!(pair[0] < pair[1]);
        }

        let owners = cache.sorted_owners(&xpubs).unwrap();
        let owner_addrs: Vec<_> = owners
            .iter()
            .map(|x| cache.derive(x, 0).unwrap())
            .collect();
        for pair in owner_addrs.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
