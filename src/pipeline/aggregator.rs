//! Batch aggregation driver
//!
//! Bundles up to K verified ballots into one recursive proof asserting
//! that every included inner proof is valid, that each inner
//! public-input hash matches the per-voter hash reconstructed from the
//! declared public data, and that the sum of per-voter hashes equals the
//! batch public-inputs hash. Padded slots carry the process's dummy
//! proof with deterministic zero public data; the verifying key per slot
//! switches on the validity bit. The encoded valid-count is the integer
//! whose low `v` bits are set.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::{circuits, VOTES_PER_BATCH};
use crate::crypto::fields::{self, InnerField, OuterField};
use crate::crypto::mimc::mimc7_inner;
use crate::errors::{Error, Result};
use crate::prover::artifacts::{ccs_id, pk_id, KeyCache};
use crate::prover::{encode_witness, to_outer_witness, ProofSystem};
use crate::types::{Process, ProcessId, VerifiedBallot};

use super::verifier::dummy_voter_hash;

/// One aggregated batch, ready for the state-transition driver.
#[derive(Clone, Debug)]
pub struct AggregatedBatch {
    pub process_id: ProcessId,
    /// The real ballots, in verification order. Slots beyond these were
    /// padded.
    pub ballots: Vec<VerifiedBallot>,
    /// Low-bit validity mask: `v` real ballots set the low `v` bits.
    pub valid_count: u64,
    /// Batch public-inputs hash, reduced into the outer field.
    pub inputs_hash: [u8; 32],
    pub proof: Vec<u8>,
}

/// Per-slot private witness handed to the backend.
#[derive(Serialize, Deserialize)]
struct SlotWitness {
    valid: bool,
    #[serde(with = "crate::types::serde_hex_vec")]
    proof: Vec<u8>,
    public_witness: [[u8; 32]; 4],
}

pub struct Aggregator {
    prover: Arc<dyn ProofSystem>,
    keys: Arc<KeyCache>,
    prove_timeout: Duration,
}

impl Aggregator {
    pub fn new(prover: Arc<dyn ProofSystem>, keys: Arc<KeyCache>, prove_timeout: Duration) -> Self {
        Self {
            prover,
            keys,
            prove_timeout,
        }
    }

    /// Build and prove one batch from `1..=K` verified ballots.
    pub async fn aggregate(
        &self,
        process: &Process,
        ballots: Vec<VerifiedBallot>,
    ) -> Result<AggregatedBatch> {
        if ballots.is_empty() || ballots.len() > VOTES_PER_BATCH {
            return Err(Error::Internal(format!(
                "batch must hold 1..={VOTES_PER_BATCH} ballots, got {}",
                ballots.len()
            )));
        }
        let valid = ballots.len();

        // per-voter hashes; padded slots hash the all-zero tuple
        let mut voter_hashes: Vec<InnerField> =
            ballots.iter().map(|b| b.ballot.inputs_hash_field()).collect();
        voter_hashes.resize(VOTES_PER_BATCH, dummy_voter_hash());
        let batch_hash = mimc7_inner(&voter_hashes);

        let valid_count = (1u64 << valid) - 1;
        let inputs_hash = fields::to_bytes_le(&fields::inner_to_outer(&batch_hash));
        let public_inputs = [
            inputs_hash,
            fields::to_bytes_le(&OuterField::from(valid_count)),
        ];

        // slot witnesses: real proofs, then dummy-shaped padding
        let dummy_shape = to_outer_witness(&InnerField::from(0u64), false);
        let mut dummy_witness = [[0u8; 32]; 4];
        for (slot, element) in dummy_witness.iter_mut().zip(dummy_shape.iter()) {
            *slot = fields::to_bytes_le(element);
        }
        let mut slots: Vec<SlotWitness> = ballots
            .iter()
            .map(|b| SlotWitness {
                valid: true,
                proof: b.recursive_proof.proof.clone(),
                public_witness: b.recursive_proof.public_witness,
            })
            .collect();
        for _ in valid..VOTES_PER_BATCH {
            slots.push(SlotWitness {
                valid: false,
                proof: process.dummy_proof.clone(),
                public_witness: dummy_witness,
            });
        }
        let witness = encode_witness(&public_inputs, &serde_json::to_vec(&slots)?);

        let pk = self.keys.get(&pk_id(circuits::AGGREGATOR)).await?;
        let ccs = self.keys.get(&ccs_id(circuits::AGGREGATOR)).await?;
        let proof = match self.prove_once(&pk, &ccs, &witness).await {
            Ok(proof) => proof,
            Err(e) => {
                // one retry on backend failure, then surface
                warn!(process = %process.id, error = %e, "aggregator proof failed, retrying");
                self.prove_once(&pk, &ccs, &witness).await?
            }
        };

        Ok(AggregatedBatch {
            process_id: process.id,
            ballots,
            valid_count,
            inputs_hash,
            proof,
        })
    }

    async fn prove_once(&self, pk: &[u8], ccs: &[u8], witness: &[u8]) -> Result<Vec<u8>> {
        tokio::time::timeout(self.prove_timeout, self.prover.prove(pk, ccs, witness))
            .await
            .map_err(|_| Error::Prover("aggregation proof timed out".into()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_count_low_bits() {
        // 3 of 10 slots real
        let v = 3usize;
        let mask = (1u64 << v) - 1;
        assert_eq!(mask, 0b0000000111);
        assert_eq!(mask.count_ones() as usize, v);
    }
}
