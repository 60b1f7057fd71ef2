//! MiMC7 over the two scalar fields
//!
//! Round constants are derived by an iterated Keccak-256 chain from a seed
//! string and reduced into the target field, so the same construction
//! instantiates over both fields. 91 rounds, exponent 7, Miyaguchi-Preneel
//! chaining for multi-input hashing.

use std::sync::OnceLock;

use ark_ff::{Field, PrimeField};
use sha3::{Digest, Keccak256};

use super::fields::{InnerField, OuterField};

const N_ROUNDS: usize = 91;
const SEED: &[u8] = b"mimc7_seed";

/// MiMC7 permutation instance over a prime field.
pub struct Mimc7<F: PrimeField> {
    constants: Vec<F>,
}

impl<F: PrimeField> Mimc7<F> {
    fn new() -> Self {
        let mut constants = Vec::with_capacity(N_ROUNDS);
        // c[0] is zero; the rest walk the keccak chain
        constants.push(F::zero());
        let mut h: [u8; 32] = Keccak256::digest(SEED).into();
        for _ in 1..N_ROUNDS {
            constants.push(F::from_be_bytes_mod_order(&h));
            h = Keccak256::digest(h).into();
        }
        Self { constants }
    }

    /// Keyed permutation: 91 rounds of `t = (x + k + c_i)^7`, plus final key.
    pub fn hash(&self, x: F, k: F) -> F {
        let mut r = x;
        for c in &self.constants {
            let t = r + k + c;
            r = t.pow([7u64]);
        }
        r + k
    }

    /// Multi-input hash with Miyaguchi-Preneel chaining.
    pub fn hash_many(&self, xs: &[F]) -> F {
        let mut r = F::zero();
        for x in xs {
            r = r + x + self.hash(*x, r);
        }
        r
    }
}

fn inner_instance() -> &'static Mimc7<InnerField> {
    static INSTANCE: OnceLock<Mimc7<InnerField>> = OnceLock::new();
    INSTANCE.get_or_init(Mimc7::new)
}

fn outer_instance() -> &'static Mimc7<OuterField> {
    static INSTANCE: OnceLock<Mimc7<OuterField>> = OnceLock::new();
    INSTANCE.get_or_init(Mimc7::new)
}

/// MiMC7 over the inner field. Used for ballot public-input hashing.
pub fn mimc7_inner(xs: &[InnerField]) -> InnerField {
    inner_instance().hash_many(xs)
}

/// MiMC7 over the outer field. Used by the Merkle trees.
pub fn mimc_outer(xs: &[OuterField]) -> OuterField {
    outer_instance().hash_many(xs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_std::Zero;

    #[test]
    fn test_deterministic() {
        let a = [InnerField::from(1u64), InnerField::from(2u64)];
        assert_eq!(mimc7_inner(&a), mimc7_inner(&a));
    }

    #[test]
    fn test_order_sensitive() {
        let a = [InnerField::from(1u64), InnerField::from(2u64)];
        let b = [InnerField::from(2u64), InnerField::from(1u64)];
        assert_ne!(mimc7_inner(&a), mimc7_inner(&b));
    }

    #[test]
    fn test_nonzero_on_zero_input() {
        let h = mimc_outer(&[OuterField::zero(), OuterField::zero()]);
        assert!(!h.is_zero());
    }

    #[test]
    fn test_fields_disagree() {
        // Same construction, different primes: reductions must differ.
        let inner = mimc7_inner(&[InnerField::from(7u64)]);
        let outer = mimc_outer(&[OuterField::from(7u64)]);
        assert_ne!(
            crate::crypto::fields::to_bytes_le(&inner),
            crate::crypto::fields::to_bytes_le(&outer)
        );
    }
}
