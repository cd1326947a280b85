//! Interop Tests
//!
//! Property tests for the byte-level contract every interop binding keeps:
//! - `starts_with` matches exactly the value's own encoding
//! - `hash` equals the hash of the encoding, for every hash function
//! - `equivalent` agrees with `==`
//! - `read` inverts `write`

use std::fmt::Debug;

use driftkv::interop::{
    decode, encode, ByteArrayInterop, BytesInterop, Crc32Hash, Fnv1a64, HashFunction,
    Interoperable, Utf8Interop,
};
use driftkv::DriftError;
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

// =============================================================================
// Helper Functions
// =============================================================================

fn check_contract<E>(a: &E, b: &E, suffix: &[u8]) -> Result<(), TestCaseError>
where
    E: Interoperable + PartialEq + Debug,
{
    let interop = E::Interop::default();
    let encoded_a = encode(&interop, a).unwrap();
    let encoded_b = encode(&interop, b).unwrap();
    prop_assert_eq!(encoded_a.len(), interop.size(a));

    // starts_with: own encoding, with trailing bytes, and nobody else's
    let mut extended = encoded_a.to_vec();
    extended.extend_from_slice(suffix);
    prop_assert!(interop.starts_with(&encoded_a, a));
    prop_assert!(interop.starts_with(&extended, a));
    prop_assert_eq!(interop.starts_with(&encoded_b, a), a == b);
    if !encoded_a.is_empty() {
        prop_assert!(!interop.starts_with(&encoded_a[..encoded_a.len() - 1], a));
    }

    // hash: streaming equals hashing the encoding
    prop_assert_eq!(interop.hash(&Fnv1a64, a), Fnv1a64.hash_bytes(&encoded_a));
    prop_assert_eq!(interop.hash(&Crc32Hash, a), Crc32Hash.hash_bytes(&encoded_a));

    // equivalent agrees with ==, and equal values hash equally
    prop_assert_eq!(interop.equivalent(a, b), a == b);
    if interop.equivalent(a, b) {
        prop_assert_eq!(interop.hash(&Fnv1a64, a), interop.hash(&Fnv1a64, b));
    }

    let decoded: E = decode(&interop, &encoded_a).unwrap();
    prop_assert_eq!(&decoded, a);
    Ok(())
}

// =============================================================================
// Contract Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_u32_contract(a in any::<u32>(), b in any::<u32>(), suffix in prop::collection::vec(any::<u8>(), 0..8)) {
        check_contract(&a, &b, &suffix)?;
        check_contract(&a, &a, &suffix)?;
    }

    #[test]
    fn prop_i32_contract(a in any::<i32>(), b in any::<i32>()) {
        check_contract(&a, &b, &[])?;
    }

    #[test]
    fn prop_u64_contract(a in any::<u64>(), b in any::<u64>(), suffix in prop::collection::vec(any::<u8>(), 0..8)) {
        check_contract(&a, &b, &suffix)?;
    }

    #[test]
    fn prop_i64_contract(a in any::<i64>(), b in any::<i64>()) {
        check_contract(&a, &b, &[])?;
        check_contract(&b, &b, &[])?;
    }

    #[test]
    fn prop_string_contract(a in ".{0,64}", b in ".{0,64}", suffix in prop::collection::vec(any::<u8>(), 0..8)) {
        check_contract(&a, &b, &suffix)?;
        check_contract(&a, &a.clone(), &suffix)?;
    }

    #[test]
    fn prop_bytes_contract(
        a in prop::collection::vec(any::<u8>(), 0..128),
        b in prop::collection::vec(any::<u8>(), 0..128),
        suffix in prop::collection::vec(any::<u8>(), 0..8),
    ) {
        check_contract(&a, &b, &suffix)?;
        check_contract(&a, &a.clone(), &suffix)?;
    }

    #[test]
    fn prop_string_prefix_is_not_a_match(a in "[a-z]{1,16}", extra in "[a-z]{1,4}") {
        // a longer string shares a's bytes but not its length prefix
        let longer = format!("{}{}", a, extra);
        let interop = Utf8Interop;
        let encoded = encode(&interop, &longer).unwrap();
        prop_assert!(!interop.starts_with(&encoded, &a));
    }
}

// =============================================================================
// Error Cases
// =============================================================================

#[test]
fn test_string_too_long_is_encoding_error() {
    let interop = Utf8Interop;
    let long = "x".repeat(Utf8Interop::MAX_LEN + 1);
    assert!(matches!(encode(&interop, &long), Err(DriftError::Encoding(_))));
}

#[test]
fn test_write_into_short_buffer_fails_without_writing() {
    let interop = ByteArrayInterop;
    let mut buf = [0xAAu8; 4];
    let mut cursor = &mut buf[..];
    let result = interop.write(&mut cursor, &vec![1u8, 2, 3]);
    assert!(matches!(result, Err(DriftError::Encoding(_))));
    assert_eq!(buf, [0xAA; 4]);
}

#[test]
fn test_truncated_input_is_encoding_error() {
    let interop = ByteArrayInterop;
    let encoded = encode(&interop, &vec![9u8; 10]).unwrap();
    let result: Result<Vec<u8>, _> = decode(&interop, &encoded[..encoded.len() - 1]);
    assert!(matches!(result, Err(DriftError::Encoding(_))));
}

#[test]
fn test_trailing_bytes_rejected_by_decode() {
    let interop = Utf8Interop;
    let mut encoded = encode(&interop, &"abc".to_string()).unwrap().to_vec();
    encoded.push(0);
    let result: Result<String, _> = decode(&interop, &encoded);
    assert!(result.is_err());
}

#[test]
fn test_invalid_utf8_rejected() {
    let interop = Utf8Interop;
    let bytes = [2u8, 0, 0xff, 0xfe];
    let result: Result<String, _> = decode(&interop, &bytes);
    assert!(matches!(result, Err(DriftError::Encoding(_))));
}
