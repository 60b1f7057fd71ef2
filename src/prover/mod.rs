//! Proving-system capability
//!
//! The proving backend (circuit compilation, trusted setup, witness
//! generation, proof production and verification) is opaque to the core.
//! The core constructs inputs and consumes outputs: keys, constraint
//! systems, proofs, and witnesses are byte blobs; public inputs are
//! 32-byte field encodings.
//!
//! What is in scope is the public-witness emulation: an inner proof's
//! public input is embedded into the outer field as four 64-bit limbs,
//! each placed as the low limb of an outer element; dummy slots take the
//! shape `[1, 0, 0, 0]`.

pub mod artifacts;

use ark_ff::PrimeField;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::crypto::fields::{self, InnerField, OuterField};
use crate::errors::{Error, Result};
use crate::types::serde_hex_vec;

/// Opaque proving backend.
#[async_trait]
pub trait ProofSystem: Send + Sync {
    /// Compile a circuit identifier into a constraint system.
    async fn compile(&self, circuit: &str) -> Result<Vec<u8>>;

    /// Produce `(proving_key, verifying_key)` for a constraint system.
    async fn setup(&self, ccs: &[u8]) -> Result<(Vec<u8>, Vec<u8>)>;

    /// Produce a proof from a witness. The witness encodes its public
    /// inputs up front (see [`encode_witness`]).
    async fn prove(&self, pk: &[u8], ccs: &[u8], witness: &[u8]) -> Result<Vec<u8>>;

    /// Verify a proof against public inputs.
    async fn verify(&self, vk: &[u8], proof: &[u8], public_inputs: &[[u8; 32]]) -> Result<bool>;
}

/// Witness layout shared with the backend: public-input count, the
/// inputs, then the private remainder.
pub fn encode_witness(public_inputs: &[[u8; 32]], private: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + public_inputs.len() * 32 + private.len());
    out.extend_from_slice(&(public_inputs.len() as u32).to_le_bytes());
    for input in public_inputs {
        out.extend_from_slice(input);
    }
    out.extend_from_slice(private);
    out
}

/// Public inputs of an encoded witness.
pub fn witness_public_inputs(witness: &[u8]) -> Result<Vec<[u8; 32]>> {
    if witness.len() < 4 {
        return Err(Error::MalformedInput("witness too short".into()));
    }
    let count = u32::from_le_bytes(witness[..4].try_into().unwrap()) as usize;
    let mut out = Vec::with_capacity(count);
    let mut rest = &witness[4..];
    for _ in 0..count {
        let input: [u8; 32] = rest
            .get(..32)
            .ok_or_else(|| Error::MalformedInput("witness truncated".into()))?
            .try_into()
            .unwrap();
        out.push(input);
        rest = &rest[32..];
    }
    Ok(out)
}

// =============================================================================
// Outer-field witness emulation
// =============================================================================

/// Embed an inner public input into outer-field witness form: the inner
/// scalar splits into four 64-bit limbs, each becoming the low limb of an
/// outer element. Dummy slots substitute the fixed shape `[1, 0, 0, 0]`.
pub fn to_outer_witness(inner: &InnerField, valid: bool) -> [OuterField; 4] {
    if !valid {
        return [
            OuterField::from(1u64),
            OuterField::from(0u64),
            OuterField::from(0u64),
            OuterField::from(0u64),
        ];
    }
    let limbs = inner.into_bigint().0;
    [
        OuterField::from(limbs[0]),
        OuterField::from(limbs[1]),
        OuterField::from(limbs[2]),
        OuterField::from(limbs[3]),
    ]
}

/// Invert [`to_outer_witness`] for a valid slot. Fails if any element
/// exceeds 64 bits, which a well-formed witness never does.
pub fn from_outer_witness(witness: &[OuterField; 4]) -> Result<InnerField> {
    let mut limbs = [0u64; 4];
    for (i, element) in witness.iter().enumerate() {
        let raw = element.into_bigint().0;
        if raw[1] != 0 || raw[2] != 0 || raw[3] != 0 {
            return Err(Error::Internal("outer witness limb exceeds 64 bits".into()));
        }
        limbs[i] = raw[0];
    }
    InnerField::from_bigint(ark_ff::BigInt::new(limbs))
        .ok_or_else(|| Error::Internal("outer witness exceeds inner modulus".into()))
}

/// An inner proof rewrapped for recursive verification: the proof bytes in
/// the aggregator's form plus the emulated public witness.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecursiveProof {
    #[serde(with = "serde_hex_vec")]
    pub proof: Vec<u8>,
    pub public_witness: [[u8; 32]; 4],
}

/// Convert a submitted inner proof to the aggregator's recursive form.
pub fn to_recursive_form(proof: &[u8], inputs_hash: &InnerField) -> RecursiveProof {
    let witness = to_outer_witness(inputs_hash, true);
    let mut public_witness = [[0u8; 32]; 4];
    for (slot, element) in public_witness.iter_mut().zip(witness.iter()) {
        *slot = fields::to_bytes_le(element);
    }
    RecursiveProof {
        proof: proof.to_vec(),
        public_witness,
    }
}

// =============================================================================
// Deterministic in-memory backend
// =============================================================================

/// Deterministic proof system for tests and development. Proofs are
/// keyed digests over the verifying key and public inputs, so a proof
/// verifies exactly for the key and inputs it was produced with.
#[derive(Default)]
pub struct MockProofSystem;

const MOCK_PK_TAG: &[u8; 2] = b"pk";

impl MockProofSystem {
    fn digest(parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().as_bytes().to_vec()
    }
}

#[async_trait]
impl ProofSystem for MockProofSystem {
    async fn compile(&self, circuit: &str) -> Result<Vec<u8>> {
        Ok(Self::digest(&[b"ccs", circuit.as_bytes()]))
    }

    async fn setup(&self, ccs: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let vk = Self::digest(&[b"vk", ccs]);
        let mut pk = MOCK_PK_TAG.to_vec();
        pk.extend_from_slice(&vk);
        Ok((pk, vk))
    }

    async fn prove(&self, pk: &[u8], _ccs: &[u8], witness: &[u8]) -> Result<Vec<u8>> {
        if pk.len() < MOCK_PK_TAG.len() + 32 || &pk[..2] != MOCK_PK_TAG {
            return Err(Error::Prover("malformed proving key".into()));
        }
        let vk = &pk[2..34];
        let publics = witness_public_inputs(witness)?;
        let mut parts: Vec<&[u8]> = vec![b"proof", vk];
        for input in &publics {
            parts.push(input.as_slice());
        }
        Ok(Self::digest(&parts))
    }

    async fn verify(&self, vk: &[u8], proof: &[u8], public_inputs: &[[u8; 32]]) -> Result<bool> {
        let mut parts: Vec<&[u8]> = vec![b"proof", vk];
        for input in public_inputs {
            parts.push(input.as_slice());
        }
        Ok(Self::digest(&parts) == proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_std::UniformRand;

    #[test]
    fn test_outer_witness_round_trip() {
        let mut rng = ark_std::test_rng();
        for _ in 0..32 {
            let inner = InnerField::rand(&mut rng);
            let witness = to_outer_witness(&inner, true);
            assert_eq!(from_outer_witness(&witness).unwrap(), inner);
        }
    }

    #[test]
    fn test_dummy_witness_shape() {
        let inner = InnerField::from(99u64);
        let witness = to_outer_witness(&inner, false);
        assert_eq!(witness[0], OuterField::from(1u64));
        assert_eq!(witness[1], OuterField::from(0u64));
        assert_eq!(witness[2], OuterField::from(0u64));
        assert_eq!(witness[3], OuterField::from(0u64));
    }

    #[test]
    fn test_witness_encoding_round_trip() {
        let publics = vec![[1u8; 32], [2u8; 32]];
        let witness = encode_witness(&publics, b"private");
        assert_eq!(witness_public_inputs(&witness).unwrap(), publics);
    }

    #[tokio::test]
    async fn test_mock_prove_verify() {
        let system = MockProofSystem;
        let ccs = system.compile("ballot_proof").await.unwrap();
        let (pk, vk) = system.setup(&ccs).await.unwrap();
        let publics = vec![[7u8; 32]];
        let witness = encode_witness(&publics, b"secret");
        let proof = system.prove(&pk, &ccs, &witness).await.unwrap();
        assert!(system.verify(&vk, &proof, &publics).await.unwrap());
        // different inputs fail
        assert!(!system.verify(&vk, &proof, &[[8u8; 32]]).await.unwrap());
        // different circuit's key fails
        let other_ccs = system.compile("aggregator").await.unwrap();
        let (_, other_vk) = system.setup(&other_ccs).await.unwrap();
        assert!(!system.verify(&other_vk, &proof, &publics).await.unwrap());
    }
}
