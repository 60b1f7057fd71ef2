//! State-transition driver
//!
//! Applies one aggregated batch to the process state and drives the
//! final proof. The batch stays staged until the proof lands: a prover
//! failure aborts the staging so the pre-batch root stands and the batch
//! can retry with the same contents. A failed proof retries once with a
//! freshly assembled witness.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::constants::{circuits, VOTES_PER_BATCH};
use crate::errors::{Error, Result};
use crate::prover::artifacts::{ccs_id, pk_id, vk_id, KeyCache};
use crate::prover::{encode_witness, ProofSystem};
use crate::state::{BatchApplication, ProcessState, SlotBallot, StateTransitionWitness};
use crate::types::{Process, TransitionBundle};

use super::aggregator::AggregatedBatch;

pub struct TransitionDriver {
    prover: Arc<dyn ProofSystem>,
    keys: Arc<KeyCache>,
    prove_timeout: Duration,
}

impl TransitionDriver {
    pub fn new(prover: Arc<dyn ProofSystem>, keys: Arc<KeyCache>, prove_timeout: Duration) -> Self {
        Self {
            prover,
            keys,
            prove_timeout,
        }
    }

    fn build_witness(
        process: &Process,
        application: &BatchApplication,
        batch: &AggregatedBatch,
        aggregator_vk: Vec<u8>,
    ) -> StateTransitionWitness {
        StateTransitionWitness {
            process_id: process.id,
            census_root: process.census_root,
            ballot_mode_bytes: process.ballot_mode.to_bytes(),
            encryption_key: process.encryption_key,
            root_before: application.root_before,
            root_after: application.root_after,
            num_new: application.num_new,
            num_overwrites: application.num_overwrites,
            slot_transitions: application.slot_transitions.clone(),
            results_add_transition: application.results_add_transition.clone(),
            results_sub_transition: application.results_sub_transition.clone(),
            process_id_proof: application.process_id_proof.clone(),
            census_root_proof: application.census_root_proof.clone(),
            ballot_mode_proof: application.ballot_mode_proof.clone(),
            encryption_key_proof: application.encryption_key_proof.clone(),
            aggregator_proof: batch.proof.clone(),
            aggregator_vk,
        }
    }

    /// Fold a batch into the state and prove the transition. On success
    /// the state is committed and the output bundle returned; on failure
    /// the pre-batch root stands.
    pub async fn settle(
        &self,
        process: &Process,
        state: &mut ProcessState,
        batch: &AggregatedBatch,
    ) -> Result<(TransitionBundle, BatchApplication)> {
        let mut slots: Vec<Option<SlotBallot>> = batch
            .ballots
            .iter()
            .map(|verified| {
                Some(SlotBallot {
                    address: verified.ballot.address,
                    ballot: verified.ballot.ballot,
                })
            })
            .collect();
        slots.resize(VOTES_PER_BATCH, None);

        let application = state.stage_batch(&slots)?;
        let public_inputs = [application.root_before, application.root_after];

        let aggregator_vk = self.keys.get(&vk_id(circuits::AGGREGATOR)).await?;
        let pk = self.keys.get(&pk_id(circuits::STATE_TRANSITION)).await?;
        let ccs = self.keys.get(&ccs_id(circuits::STATE_TRANSITION)).await?;

        let witness = Self::build_witness(process, &application, batch, aggregator_vk.to_vec());
        let proof = match self
            .prove_once(&pk, &ccs, &witness, &public_inputs)
            .await
        {
            Ok(proof) => proof,
            Err(e) => {
                // fresh witness on retry, in case of upstream prover
                // nondeterminism
                warn!(process = %process.id, error = %e, "transition proof failed, retrying");
                let fresh =
                    Self::build_witness(process, &application, batch, aggregator_vk.to_vec());
                match self.prove_once(&pk, &ccs, &fresh, &public_inputs).await {
                    Ok(proof) => proof,
                    Err(e) => {
                        state.abort_batch()?;
                        return Err(e);
                    }
                }
            }
        };

        state.commit_batch()?;
        Ok((
            TransitionBundle {
                process_id: process.id,
                root_before: application.root_before,
                root_after: application.root_after,
                valid_votes: batch.valid_count,
                proof,
            },
            application,
        ))
    }

    async fn prove_once(
        &self,
        pk: &[u8],
        ccs: &[u8],
        witness: &StateTransitionWitness,
        public_inputs: &[[u8; 32]],
    ) -> Result<Vec<u8>> {
        let encoded = encode_witness(public_inputs, &serde_json::to_vec(witness)?);
        tokio::time::timeout(self.prove_timeout, self.prover.prove(pk, ccs, &encoded))
            .await
            .map_err(|_| Error::Prover("transition proof timed out".into()))?
    }
}
