//! Ballot verification driver
//!
//! Takes a submitted ballot through the verification contract, in order:
//! census root equality, census proof, address and signature, public-input
//! hash reconstruction, inner proof verification against the cached
//! verifying key, and conversion to the aggregator's recursive form.
//! Verification is a pure function of the process snapshot and the ballot.

use std::sync::Arc;
use std::time::Duration;

use ark_ff::PrimeField;

use crate::census::CensusRegistry;
use crate::constants::circuits;
use crate::crypto::fields::{self, InnerField};
use crate::crypto::mimc::mimc7_inner;
use crate::crypto::signature;
use crate::errors::{Error, Result};
use crate::prover::artifacts::{vk_id, KeyCache};
use crate::prover::{to_recursive_form, ProofSystem};
use crate::types::{Process, SubmittedBallot, VerifiedBallot};

/// Number of elements in the per-voter public-input tuple.
const VOTER_TUPLE_LEN: usize = 47;

/// Reconstruct the public-input hash for one voter:
/// `MiMC7(process_id, census_root, enc_key.x, enc_key.y, ballot_mode...,
/// address, nullifier, commitment, ciphertext coordinates)`.
pub fn compute_inputs_hash(process: &Process, ballot: &SubmittedBallot) -> Result<InnerField> {
    let (enc_x, enc_y) = crate::crypto::babyjubjub::coordinates(&process.encryption_public()?);
    let mut tuple = Vec::with_capacity(VOTER_TUPLE_LEN);
    tuple.push(process.id.to_inner_field());
    tuple.push(InnerField::from_le_bytes_mod_order(&process.census_root));
    tuple.push(enc_x);
    tuple.push(enc_y);
    tuple.extend_from_slice(&process.ballot_mode.hash_inputs());
    tuple.push(fields::address_to_inner(&ballot.address));
    tuple.push(InnerField::from_le_bytes_mod_order(&ballot.nullifier));
    tuple.push(InnerField::from_le_bytes_mod_order(&ballot.commitment));
    tuple.extend(ballot.ballot.hash_inputs());
    debug_assert_eq!(tuple.len(), VOTER_TUPLE_LEN);
    Ok(mimc7_inner(&tuple))
}

/// The per-voter hash of a padded slot: the same tuple, all zeros.
pub fn dummy_voter_hash() -> InnerField {
    mimc7_inner(&[InnerField::from(0u64); VOTER_TUPLE_LEN])
}

/// The 32-byte digest voters sign: the inputs hash reduced into the outer
/// field, big-endian.
pub fn signed_digest(inputs_hash: &InnerField) -> [u8; 32] {
    fields::to_bytes_be(&fields::inner_to_outer(inputs_hash))
}

pub struct VoteVerifier {
    prover: Arc<dyn ProofSystem>,
    keys: Arc<KeyCache>,
    verify_timeout: Duration,
}

impl VoteVerifier {
    pub fn new(prover: Arc<dyn ProofSystem>, keys: Arc<KeyCache>, verify_timeout: Duration) -> Self {
        Self {
            prover,
            keys,
            verify_timeout,
        }
    }

    /// Run the full verification contract. The caller has already
    /// resolved the process; everything else happens here.
    pub async fn verify(
        &self,
        process: &Process,
        ballot: &SubmittedBallot,
    ) -> Result<VerifiedBallot> {
        // census root must match the process snapshot
        if ballot.census_proof.root != process.census_root {
            return Err(Error::InvalidCensusProof);
        }
        // the proof must be for the voter's address
        if ballot.census_proof.key != ballot.address {
            return Err(Error::InvalidCensusProof);
        }
        if !CensusRegistry::verify_proof(&ballot.census_proof)? {
            return Err(Error::InvalidCensusProof);
        }

        // the public key must derive to the census key, and the signature
        // must cover the reduced inputs hash
        let public_key = signature::parse_public_key(&ballot.public_key)?;
        if signature::derive_address(&public_key) != ballot.address {
            return Err(Error::InvalidSignature);
        }
        let inputs_hash = ballot.inputs_hash_field();
        signature::verify_prehash(&public_key, &signed_digest(&inputs_hash), &ballot.signature)?;

        // the declared hash must match the reconstruction from public data
        if compute_inputs_hash(process, ballot)? != inputs_hash {
            return Err(Error::InvalidBallotProof);
        }

        // inner proof against the cached verifying key
        let vk = self.keys.get(&vk_id(circuits::BALLOT_PROOF)).await?;
        let public_inputs = [fields::to_bytes_le(&inputs_hash)];
        let verified = tokio::time::timeout(
            self.verify_timeout,
            self.prover.verify(&vk, &ballot.proof, &public_inputs),
        )
        .await
        .map_err(|_| Error::Prover("ballot proof verification timed out".into()))??;
        if !verified {
            return Err(Error::InvalidBallotProof);
        }

        Ok(VerifiedBallot {
            ballot: ballot.clone(),
            recursive_proof: to_recursive_form(&ballot.proof, &inputs_hash),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dummy_voter_hash_deterministic() {
        assert_eq!(dummy_voter_hash(), dummy_voter_hash());
    }

    #[test]
    fn test_signed_digest_reduces_into_outer() {
        let h = InnerField::from(123u64);
        let digest = signed_digest(&h);
        assert_eq!(
            digest,
            fields::to_bytes_be(&crate::crypto::fields::OuterField::from(123u64))
        );
    }
}
