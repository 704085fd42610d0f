use rand::{rngs::StdRng, Rng, SeedableRng};

use super::{assert_signed_by, recover_signer, Signer, ValidationError};
use crate::abiencode::types::Hash;

#[test]
fn sign_and_recover_roundtrip() {
    let mut rng = StdRng::seed_from_u64(0);
    let signer = Signer::new(&mut rng);

    let msg: Hash = rng.gen();
    let sig = signer.sign_eth(msg);

    let recovered = recover_signer(msg, sig).unwrap();
    assert_eq!(recovered, signer.address());
}

#[test]
fn assert_signed_by_accepts_the_signer() {
    let mut rng = StdRng::seed_from_u64(1);
    let signer = Signer::new(&mut rng);
    let msg: Hash = rng.gen();
    let sig = signer.sign_eth(msg);

    assert_signed_by(msg, sig, signer.address()).unwrap();
}

#[test]
fn assert_signed_by_rejects_other_addresses() {
    let mut rng = StdRng::seed_from_u64(2);
    let signer = Signer::new(&mut rng);
    let other = Signer::new(&mut rng);
    let msg: Hash = rng.gen();
    let sig = signer.sign_eth(msg);

    match assert_signed_by(msg, sig, other.address()) {
        Err(ValidationError::SignatureInvalid {
            expected,
            recovered,
        }) => {
            assert_eq!(expected, other.address());
            assert_eq!(recovered, signer.address());
        }
        other => panic!("expected SignatureInvalid, got {other:?}"),
    }
}

#[test]
fn signature_covers_the_exact_digest() {
    let mut rng = StdRng::seed_from_u64(3);
    let signer = Signer::new(&mut rng);
    let msg: Hash = rng.gen();
    let other_msg: Hash = rng.gen();
    let sig = signer.sign_eth(msg);

    // Recovering against a different digest yields a different address (or
    // an error), never a silent pass.
    match recover_signer(other_msg, sig) {
        Ok(addr) => assert_ne!(addr, signer.address()),
        Err(_) => {}
    }
}
