//! Cryptographic primitives: field helpers, MiMC7, the encryption curve,
//! exponential ElGamal, and voter signature checks.
//!
//! Nullifiers and commitments are Poseidon-derived by voters; the
//! sequencer treats them as opaque field elements and never recomputes
//! them.

pub mod babyjubjub;
pub mod elgamal;
pub mod fields;
pub mod mimc;
pub mod signature;
