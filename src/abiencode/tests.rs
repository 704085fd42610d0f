use super::types::{Address, Hash, U256};
use super::{encode, keccak256, AbiType, AbiValue, Error, PackedEncoder};

fn word(hex_str: &str) -> Vec<u8> {
    let mut padded = String::from("0".repeat(64 - hex_str.len()));
    padded.push_str(hex_str);
    hex::decode(padded).unwrap()
}

#[test]
fn keccak_empty_matches_reference() {
    assert_eq!(
        hex::encode(keccak256(b"").0),
        "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
    );
}

#[test]
fn static_values_one_word_each() {
    let out = encode(
        &[AbiType::Uint256, AbiType::Bool, AbiType::Address],
        &[
            AbiValue::Uint(U256::from(5)),
            AbiValue::Bool(true),
            AbiValue::Address(Address([0x11; 20])),
        ],
    )
    .unwrap();

    let mut expected = word("5");
    expected.extend(word("1"));
    expected.extend(word(&"11".repeat(20)));
    assert_eq!(out, expected);
}

#[test]
fn dynamic_bytes_offset_length_padding() {
    let out = encode(
        &[AbiType::Bytes],
        &[AbiValue::Bytes(vec![0xa1, 0xa2, 0xa3, 0xa4])],
    )
    .unwrap();

    let mut expected = word("20"); // offset
    expected.extend(word("4")); // length
    let mut tail = vec![0xa1, 0xa2, 0xa3, 0xa4];
    tail.extend([0u8; 28]);
    expected.extend(tail);
    assert_eq!(out, expected);
}

#[test]
fn uint_array() {
    let out = encode(
        &[AbiType::Array(Box::new(AbiType::Uint256))],
        &[AbiValue::Array(vec![
            AbiValue::Uint(U256::from(1)),
            AbiValue::Uint(U256::from(2)),
        ])],
    )
    .unwrap();

    let mut expected = word("20");
    expected.extend(word("2"));
    expected.extend(word("1"));
    expected.extend(word("2"));
    assert_eq!(out, expected);
}

#[test]
fn static_value_after_dynamic_value() {
    let out = encode(
        &[AbiType::Bytes, AbiType::Uint256],
        &[
            AbiValue::Bytes(vec![0xff]),
            AbiValue::Uint(U256::from(7)),
        ],
    )
    .unwrap();

    // Head is two slots; the bytes tail starts at 0x40.
    let mut expected = word("40");
    expected.extend(word("7"));
    expected.extend(word("1"));
    let mut tail = vec![0xff];
    tail.extend([0u8; 31]);
    expected.extend(tail);
    assert_eq!(out, expected);
}

#[test]
fn type_mismatch_is_rejected() {
    let err = encode(&[AbiType::Uint256], &[AbiValue::Bool(false)]).unwrap_err();
    assert_eq!(
        err,
        Error::TypeMismatch {
            expected: "uint256",
            got: "bool"
        }
    );
}

#[test]
fn arity_mismatch_is_rejected() {
    let err = encode(&[AbiType::Uint256, AbiType::Bool], &[AbiValue::Uint(U256::zero())])
        .unwrap_err();
    assert_eq!(err, Error::ArityMismatch { expected: 2, got: 1 });
}

#[test]
fn packed_digest_is_deterministic() {
    let digest = |tag| {
        PackedEncoder::new()
            .push_u8(tag)
            .push_hash(Hash([0xab; 32]))
            .push_u64(3)
            .keccak()
    };
    assert_eq!(digest(0x19), digest(0x19));
    assert_ne!(digest(0x19), digest(0x1a));
}
