//! Primitive on-chain value types shared by the whole crate.
//!
//! Everything that ends up inside a digest or a transaction payload is built
//! from these: 20-byte addresses, 32-byte hashes, 65-byte recoverable
//! signatures and 256-bit unsigned integers. All of them render as `0x`-hex
//! in `Debug` output and serialize as hex strings, so wire envelopes and
//! persisted channel snapshots stay human-readable.

use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl core::fmt::Display for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! impl_hex_serde {
    ($T:ident, $N:literal) => {
        impl Serialize for $T {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut s = String::with_capacity(2 + 2 * $N);
                s.push_str("0x");
                s.push_str(&hex::encode(self.0));
                serializer.serialize_str(&s)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                let s = s.strip_prefix("0x").unwrap_or(&s);
                let bytes = hex::decode(s).map_err(de::Error::custom)?;
                let arr: [u8; $N] = bytes
                    .try_into()
                    .map_err(|_| de::Error::custom("wrong byte length"))?;
                Ok($T(arr))
            }
        }
    };
}

macro_rules! bytes_type {
    ($T:ident, $N:literal) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl_hex_debug!($T);
        impl_hex_serde!($T, $N);
    };
}

/// 32 bytes, usually the output of keccak256. Also the identity hash of an
/// app instance and the `bytes32` ABI type.
bytes_type!(Hash, 32);

/// Recoverable ECDSA signature in Ethereum layout: `r || s || v`, v in
/// {27, 28}.
bytes_type!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

/// 20-byte Ethereum address.
///
/// The derived `Ord` compares the raw big-endian bytes, which is the same
/// order as comparing the numeric value of the address. Multisig owners,
/// signing keys and signature arrays are always sorted ascending by this
/// order so that every party independently assembles byte-identical digests.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(pub [u8; 20]);
impl_hex_debug!(Address);
impl_hex_serde!(Address, 20);

impl Distribution<Address> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Address {
        Address(rng.gen())
    }
}

construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        let mut s = String::with_capacity(66);
        s.push_str("0x");
        s.push_str(&hex::encode(bytes));
        serializer.serialize_str(&s)
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        let bytes = hex::decode(s).map_err(de::Error::custom)?;
        if bytes.len() > 32 {
            return Err(de::Error::custom("uint256 out of range"));
        }
        Ok(U256::from_big_endian(&bytes))
    }
}

impl U256 {
    /// The 32-byte big-endian representation, i.e. one ABI word.
    pub fn to_word(self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}
