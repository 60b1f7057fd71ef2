//! Field element conversion helpers for the two proof-system fields
//!
//! Two distinct prime fields are involved: the ballot-proof inner field
//! (BN254 scalar field, which the twisted-Edwards encryption curve is
//! embedded in) and the aggregation outer field (BLS12-377 scalar field,
//! over which the Merkle trees hash). All canonical encodings are 32 bytes.

use ark_ff::{BigInteger, PrimeField};
use num_bigint::BigUint;

use crate::constants::HASH_LEN;

/// Ballot-proof field: BN254 scalar field.
pub type InnerField = ark_bn254::Fr;

/// Aggregation / Merkle tree field: BLS12-377 scalar field.
pub type OuterField = ark_bls12_377::Fr;

/// Canonical little-endian encoding, zero-padded to 32 bytes.
pub fn to_bytes_le<F: PrimeField>(f: &F) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    let bytes = f.into_bigint().to_bytes_le();
    out[..bytes.len().min(HASH_LEN)].copy_from_slice(&bytes[..bytes.len().min(HASH_LEN)]);
    out
}

/// Canonical big-endian encoding, zero-padded to 32 bytes.
pub fn to_bytes_be<F: PrimeField>(f: &F) -> [u8; HASH_LEN] {
    let mut out = to_bytes_le(f);
    out.reverse();
    out
}

/// Interpret little-endian bytes as a field element, reducing mod the prime.
pub fn from_bytes_le<F: PrimeField>(bytes: &[u8]) -> F {
    F::from_le_bytes_mod_order(bytes)
}

/// Interpret big-endian bytes as a field element, reducing mod the prime.
pub fn from_bytes_be<F: PrimeField>(bytes: &[u8]) -> F {
    F::from_be_bytes_mod_order(bytes)
}

/// Reduce an inner element into the outer field through its canonical bytes.
///
/// Used for the signed digest: voters sign `reduce(inputs_hash, outer)`.
pub fn inner_to_outer(f: &InnerField) -> OuterField {
    OuterField::from_be_bytes_mod_order(&to_bytes_be(f))
}

/// A 20-byte address as an inner field element (big-endian).
pub fn address_to_inner(addr: &[u8; 20]) -> InnerField {
    InnerField::from_be_bytes_mod_order(addr)
}

/// A 20-byte address as an outer field element (big-endian).
pub fn address_to_outer(addr: &[u8; 20]) -> OuterField {
    OuterField::from_be_bytes_mod_order(addr)
}

pub fn biguint_to_field<F: PrimeField>(v: &BigUint) -> F {
    F::from_le_bytes_mod_order(&v.to_bytes_le())
}

pub fn field_to_biguint<F: PrimeField>(f: &F) -> BigUint {
    BigUint::from_bytes_le(&f.into_bigint().to_bytes_le())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_std::UniformRand;

    #[test]
    fn test_le_round_trip() {
        let mut rng = ark_std::test_rng();
        for _ in 0..16 {
            let f = InnerField::rand(&mut rng);
            let bytes = to_bytes_le(&f);
            assert_eq!(from_bytes_le::<InnerField>(&bytes), f);
        }
    }

    #[test]
    fn test_be_round_trip() {
        let mut rng = ark_std::test_rng();
        for _ in 0..16 {
            let f = OuterField::rand(&mut rng);
            let bytes = to_bytes_be(&f);
            assert_eq!(from_bytes_be::<OuterField>(&bytes), f);
        }
    }

    #[test]
    fn test_biguint_round_trip() {
        let v = BigUint::from(123_456_789u64);
        let f: InnerField = biguint_to_field(&v);
        assert_eq!(field_to_biguint(&f), v);
    }

    #[test]
    fn test_inner_to_outer_is_deterministic() {
        let f = InnerField::from(42u64);
        assert_eq!(inner_to_outer(&f), inner_to_outer(&f));
        assert_eq!(inner_to_outer(&f), OuterField::from(42u64));
    }
}
