//! Shared fixtures: a sequencer over a throwaway store, funded censuses,
//! and fully proved ballots driven through the deterministic backend.

use std::sync::Arc;

use k256::ecdsa::SigningKey;
use num_bigint::BigUint;
use uuid::Uuid;

use zkvoting_sequencer::chain::NoopChainClient;
use zkvoting_sequencer::config::SequencerConfig;
use zkvoting_sequencer::constants::circuits;
use zkvoting_sequencer::crypto::elgamal::Ballot;
use zkvoting_sequencer::crypto::fields;
use zkvoting_sequencer::crypto::signature::{derive_address, sign_prehash};
use zkvoting_sequencer::pipeline::verifier::{compute_inputs_hash, signed_digest};
use zkvoting_sequencer::pipeline::{setup_digest, Sequencer};
use zkvoting_sequencer::prover::artifacts::{
    bootstrap_artifacts, ccs_id, pk_id, ArtifactStore, MemoryArtifactStore,
};
use zkvoting_sequencer::prover::{encode_witness, MockProofSystem, ProofSystem};
use zkvoting_sequencer::storage::Store;
use zkvoting_sequencer::types::{BallotMode, CensusProof, Process, SubmittedBallot};

pub struct Harness {
    pub sequencer: Arc<Sequencer>,
    pub prover: Arc<MockProofSystem>,
    pub artifacts: Arc<MemoryArtifactStore>,
}

pub async fn harness() -> Harness {
    let prover = Arc::new(MockProofSystem);
    let artifacts = Arc::new(MemoryArtifactStore::default());
    bootstrap_artifacts(prover.as_ref(), &artifacts).await.unwrap();
    let sequencer = Sequencer::new(
        SequencerConfig::default(),
        Store::temporary().unwrap(),
        prover.clone(),
        artifacts.clone(),
        Arc::new(NoopChainClient),
    )
    .await
    .unwrap();
    Harness {
        sequencer,
        prover,
        artifacts,
    }
}

pub struct Voter {
    pub key: SigningKey,
    pub address: [u8; 20],
}

pub fn voter(seed: u8) -> Voter {
    let mut bytes = [seed; 32];
    bytes[0] = bytes[0].max(1);
    let key = SigningKey::from_slice(&bytes).unwrap();
    let address = derive_address(key.verifying_key());
    Voter { key, address }
}

/// Create a census holding the given voters (weight 1 each) and a process
/// bound to its root.
pub async fn setup_process(harness: &Harness, voters: &[Voter]) -> (Uuid, Process) {
    let census_id = Uuid::new_v4();
    harness.sequencer.censuses.create(census_id).await.unwrap();
    let rows: Vec<(Vec<u8>, BigUint)> = voters
        .iter()
        .map(|v| (v.address.to_vec(), BigUint::from(1u8)))
        .collect();
    let outcome = harness
        .sequencer
        .censuses
        .insert_batch(&census_id, &rows)
        .await
        .unwrap();
    assert!(outcome.invalid.is_empty());

    let organizer = SigningKey::from_slice(&[0x99; 32]).unwrap();
    let mode = BallotMode::default();
    let digest = setup_digest(31337, 1, &outcome.root, &mode);
    let signature = sign_prehash(&organizer, &digest).unwrap();
    let process = harness
        .sequencer
        .clone()
        .create_process(31337, 1, outcome.root, mode, &signature)
        .await
        .unwrap();
    (census_id, process)
}

/// Build a fully proved ballot for a voter: census proof, encryption,
/// public-input hash, signature, and an inner proof from the backend.
pub async fn make_ballot(
    harness: &Harness,
    census_id: &Uuid,
    process: &Process,
    voter: &Voter,
    vote_fields: &[u64],
    nullifier: [u8; 32],
) -> SubmittedBallot {
    let census_proof: CensusProof = harness
        .sequencer
        .censuses
        .prove(census_id, &voter.address)
        .await
        .unwrap();
    let mut rng = ark_std::test_rng();
    let encrypted = Ballot::encrypt(
        vote_fields,
        &process.encryption_public().unwrap(),
        &mut rng,
    );

    let mut ballot = SubmittedBallot {
        process_id: process.id,
        address: voter.address,
        public_key: voter
            .key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec(),
        census_proof,
        ballot: encrypted,
        nullifier,
        commitment: [0xc0; 32],
        inputs_hash: [0u8; 32],
        proof: Vec::new(),
        signature: Vec::new(),
    };

    let inputs_hash = compute_inputs_hash(process, &ballot).unwrap();
    ballot.inputs_hash = fields::to_bytes_le(&inputs_hash);
    ballot.signature = sign_prehash(&voter.key, &signed_digest(&inputs_hash))
        .unwrap()
        .to_vec();

    let ccs = harness
        .artifacts
        .load(&ccs_id(circuits::BALLOT_PROOF))
        .await
        .unwrap();
    let pk = harness
        .artifacts
        .load(&pk_id(circuits::BALLOT_PROOF))
        .await
        .unwrap();
    let witness = encode_witness(&[ballot.inputs_hash], b"voter witness");
    ballot.proof = harness.prover.prove(&pk, &ccs, &witness).await.unwrap();
    ballot
}
