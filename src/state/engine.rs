//! Per-process authenticated state
//!
//! A sparse Merkle tree per process holds singleton leaves at well-known
//! keys (process id, census root, ballot mode, encryption key, results
//! accumulators) and one dynamic leaf per voter address, valued with the
//! hash of that voter's current ballot. Tree values must fit the hash
//! output, so oversized records (ballot mode, encryption key, serialized
//! accumulators, ballots) keep their hash in the tree and their full bytes
//! beside it under the same keyspace.
//!
//! Batch application is single-writer and atomic: mutations stage in
//! memory and commit in one storage batch; any failure leaves the
//! pre-batch root intact.

use crate::census::tree::{MerkleProof, NodeStore, StagedStore, Tree};
use crate::constants::{state_keys, MAX_TREE_LEVELS};
use crate::crypto::elgamal::Ballot;
use crate::crypto::fields::{self, OuterField};
use crate::crypto::mimc::mimc_outer;
use crate::errors::{Error, Result};
use crate::storage::{keys, Keyspace, Store};
use crate::types::Process;

use super::witness::{MerkleTransition, SingletonProof};

const ACC_ADD_KEY: &[u8] = b"acc:add";
const ACC_SUB_KEY: &[u8] = b"acc:sub";
const BALLOT_BLOB_PREFIX: &[u8] = b"b:";

/// Hash arbitrary bytes into a 32-byte tree value.
pub fn hash_to_value(bytes: &[u8]) -> [u8; 32] {
    let fields: Vec<OuterField> = bytes
        .chunks(31)
        .map(fields::from_bytes_le::<OuterField>)
        .collect();
    fields::to_bytes_le(&mimc_outer(&fields))
}

/// A real slot of a batch: a verified ballot to fold in.
#[derive(Clone, Debug)]
pub struct SlotBallot {
    pub address: [u8; 20],
    pub ballot: Ballot,
}

/// Result of applying one batch.
#[derive(Clone, Debug)]
pub struct BatchApplication {
    pub root_before: [u8; 32],
    pub root_after: [u8; 32],
    pub num_new: u64,
    pub num_overwrites: u64,
    pub slot_transitions: Vec<MerkleTransition>,
    pub results_add_transition: MerkleTransition,
    pub results_sub_transition: MerkleTransition,
    pub process_id_proof: SingletonProof,
    pub census_root_proof: SingletonProof,
    pub ballot_mode_proof: SingletonProof,
    pub encryption_key_proof: SingletonProof,
}

/// The state tree of one process. Single writer; the pipeline owns it.
pub struct ProcessState {
    tree: Tree<StagedStore>,
    base: Keyspace,
}

impl ProcessState {
    /// Initialize state for a new process: singleton leaves for the
    /// process id, census root, ballot mode, encryption key, and both
    /// zero accumulators. Returns the genesis root.
    pub fn init(store: &Store, process: &Process) -> Result<(Self, [u8; 32])> {
        let base = store.keyspace(&keys::state_nodes(&process.id.marshal()))?;
        let mut tree = Tree::open(StagedStore::new(base.clone()), MAX_TREE_LEVELS)?;
        if tree.root() != [0u8; 32] {
            return Err(Error::AlreadyExists(format!("state for {}", process.id)));
        }
        let zero = Ballot::zero().to_bytes();

        tree.add(state_keys::PROCESS_ID, &process.id.marshal())?;
        tree.add(state_keys::CENSUS_ROOT, &process.census_root)?;
        tree.add(
            state_keys::BALLOT_MODE,
            &hash_to_value(&process.ballot_mode.to_bytes()),
        )?;
        tree.add(
            state_keys::ENCRYPTION_KEY,
            &hash_to_value(&process.encryption_key),
        )?;
        tree.add(state_keys::RESULTS_ADD, &hash_to_value(&zero))?;
        tree.add(state_keys::RESULTS_SUB, &hash_to_value(&zero))?;
        tree.store_mut().put(ACC_ADD_KEY, &zero)?;
        tree.store_mut().put(ACC_SUB_KEY, &zero)?;
        tree.store_mut().flush()?;

        let root = tree.root();
        Ok((Self { tree, base }, root))
    }

    /// Reopen existing state from storage.
    pub fn open(store: &Store, process_id: &[u8; 32]) -> Result<Self> {
        let base = store.keyspace(&keys::state_nodes(process_id))?;
        let tree = Tree::open(StagedStore::new(base.clone()), MAX_TREE_LEVELS)?;
        Ok(Self { tree, base })
    }

    pub fn root(&self) -> [u8; 32] {
        self.tree.root()
    }

    fn read_ballot(&self, key: &[u8]) -> Result<Option<Ballot>> {
        match self.tree.store().get(key)? {
            Some(bytes) => Ok(Some(Ballot::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The accumulators as full ciphertext ballots.
    pub fn results(&self) -> Result<(Ballot, Ballot)> {
        let add = self.read_ballot(ACC_ADD_KEY)?.unwrap_or_else(Ballot::zero);
        let sub = self.read_ballot(ACC_SUB_KEY)?.unwrap_or_else(Ballot::zero);
        Ok((add, sub))
    }

    /// A voter's current ballot, if any.
    pub fn ballot_of(&self, address: &[u8; 20]) -> Result<Option<Ballot>> {
        let mut key = BALLOT_BLOB_PREFIX.to_vec();
        key.extend_from_slice(address);
        self.read_ballot(&key)
    }

    fn singleton_proof(&self, key: &[u8]) -> Result<SingletonProof> {
        let proof = self.tree.prove(key)?;
        if !proof.included {
            return Err(Error::Internal(format!(
                "singleton leaf {} missing",
                hex::encode(key)
            )));
        }
        Ok(SingletonProof {
            key: key.to_vec(),
            value: proof.value,
            siblings: proof.pack_siblings(),
        })
    }

    fn transition(
        &mut self,
        key: &[u8],
        value: [u8; 32],
    ) -> Result<(MerkleTransition, Option<[u8; 32]>)> {
        let root_before = self.tree.root();
        let before: MerkleProof = self.tree.prove(key)?;
        let old = self.tree.set(key, &value)?;
        let after = self.tree.prove(key)?;
        Ok((
            MerkleTransition {
                key: key.to_vec(),
                old_value: if before.included { before.value } else { [0u8; 32] },
                new_value: after.value,
                siblings_before: before.pack_siblings(),
                siblings_after: after.pack_siblings(),
                root_before,
                root_after: self.tree.root(),
                noop: false,
            },
            old,
        ))
    }

    /// Stage one batch. Slots are folded in verification order; `None`
    /// slots are dummies and emit noop transitions. Nothing persists
    /// until [`ProcessState::commit_batch`]; on error the staged writes
    /// are dropped and the pre-batch root stands.
    pub fn stage_batch(&mut self, slots: &[Option<SlotBallot>]) -> Result<BatchApplication> {
        let root_before = self.tree.root();
        match self.apply_batch_inner(slots, root_before) {
            Ok(application) => Ok(application),
            Err(e) => {
                self.abort_batch()?;
                Err(e)
            }
        }
    }

    /// Persist a staged batch in one atomic storage write.
    pub fn commit_batch(&mut self) -> Result<()> {
        self.tree.store_mut().flush()
    }

    /// Drop a staged batch and restore the pre-batch root.
    pub fn abort_batch(&mut self) -> Result<()> {
        self.tree.store_mut().discard();
        self.tree = Tree::open(StagedStore::new(self.base.clone()), MAX_TREE_LEVELS)?;
        Ok(())
    }

    /// Stage and commit in one step.
    pub fn apply_batch(&mut self, slots: &[Option<SlotBallot>]) -> Result<BatchApplication> {
        let application = self.stage_batch(slots)?;
        self.commit_batch()?;
        Ok(application)
    }

    fn apply_batch_inner(
        &mut self,
        slots: &[Option<SlotBallot>],
        root_before: [u8; 32],
    ) -> Result<BatchApplication> {
        // singletons are proved once, against the pre-batch root
        let process_id_proof = self.singleton_proof(state_keys::PROCESS_ID)?;
        let census_root_proof = self.singleton_proof(state_keys::CENSUS_ROOT)?;
        let ballot_mode_proof = self.singleton_proof(state_keys::BALLOT_MODE)?;
        let encryption_key_proof = self.singleton_proof(state_keys::ENCRYPTION_KEY)?;

        let (mut results_add, mut results_sub) = self.results()?;
        let mut num_new = 0u64;
        let mut num_overwrites = 0u64;
        let mut slot_transitions = Vec::with_capacity(slots.len());

        for slot in slots {
            match slot {
                Some(entry) => {
                    let prev = self.ballot_of(&entry.address)?;
                    let ballot_bytes = entry.ballot.to_bytes();
                    let (transition, _) =
                        self.transition(&entry.address, hash_to_value(&ballot_bytes))?;
                    slot_transitions.push(transition);

                    results_add = results_add.add(&entry.ballot);
                    if let Some(previous) = prev {
                        results_sub = results_sub.add(&previous);
                        num_overwrites += 1;
                    }
                    num_new += 1;

                    let mut blob_key = BALLOT_BLOB_PREFIX.to_vec();
                    blob_key.extend_from_slice(&entry.address);
                    self.tree.store_mut().put(&blob_key, &ballot_bytes)?;
                }
                None => slot_transitions.push(MerkleTransition::noop(self.tree.root())),
            }
        }

        let add_bytes = results_add.to_bytes();
        let (results_add_transition, _) =
            self.transition(state_keys::RESULTS_ADD, hash_to_value(&add_bytes))?;
        self.tree.store_mut().put(ACC_ADD_KEY, &add_bytes)?;

        let sub_bytes = results_sub.to_bytes();
        let (results_sub_transition, _) =
            self.transition(state_keys::RESULTS_SUB, hash_to_value(&sub_bytes))?;
        self.tree.store_mut().put(ACC_SUB_KEY, &sub_bytes)?;

        Ok(BatchApplication {
            root_before,
            root_after: self.tree.root(),
            num_new,
            num_overwrites,
            slot_transitions,
            results_add_transition,
            results_sub_transition,
            process_id_proof,
            census_root_proof,
            ballot_mode_proof,
            encryption_key_proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::census::tree::verify_proof;
    use crate::census::tree::unpack_siblings;
    use crate::crypto::elgamal::EncryptionKeypair;
    use crate::types::{BallotMode, ProcessId, ProcessStatus};

    fn test_process() -> (Store, Process) {
        let store = Store::temporary().unwrap();
        let mut rng = ark_std::test_rng();
        let keys = EncryptionKeypair::generate(&mut rng);
        let mut process = Process {
            id: ProcessId {
                chain_id: 1,
                creator: [9u8; 20],
                nonce: 1,
            },
            census_root: [3u8; 32],
            ballot_mode: BallotMode::default(),
            encryption_key: [0u8; 64],
            encryption_secret: [0u8; 32],
            state_root: [0u8; 32],
            status: ProcessStatus::Ready,
            start_time: 0,
            duration: 3600,
            max_votes: 1000,
            settled_votes: 0,
            batch_count: 0,
            dummy_proof: Vec::new(),
            final_results: None,
        };
        process.set_encryption_keypair(&keys.secret, &keys.public);
        (store, process)
    }

    fn encrypted(fields: &[u64], process: &Process) -> Ballot {
        let mut rng = ark_std::test_rng();
        Ballot::encrypt(fields, &process.encryption_public().unwrap(), &mut rng)
    }

    #[test]
    fn test_init_creates_singletons() {
        let (store, process) = test_process();
        let (state, root) = ProcessState::init(&store, &process).unwrap();
        assert_ne!(root, [0u8; 32]);
        let proof = state.tree.prove(state_keys::PROCESS_ID).unwrap();
        assert!(proof.included);
    }

    #[test]
    fn test_apply_batch_counts() {
        let (store, process) = test_process();
        let (mut state, _) = ProcessState::init(&store, &process).unwrap();
        let slots = vec![
            Some(SlotBallot {
                address: [1u8; 20],
                ballot: encrypted(&[1, 0, 0, 0, 0, 0, 0, 0], &process),
            }),
            Some(SlotBallot {
                address: [2u8; 20],
                ballot: encrypted(&[0, 1, 0, 0, 0, 0, 0, 0], &process),
            }),
            None,
        ];
        let application = state.apply_batch(&slots).unwrap();
        assert_eq!(application.num_new, 2);
        assert_eq!(application.num_overwrites, 0);
        assert_eq!(application.slot_transitions.len(), 3);
        assert!(application.slot_transitions[2].noop);
        assert_ne!(application.root_before, application.root_after);
    }

    #[test]
    fn test_overwrite_compensation() {
        let (store, process) = test_process();
        let (mut state, _) = ProcessState::init(&store, &process).unwrap();
        let b1 = encrypted(&[1, 0, 0, 0, 0, 0, 0, 0], &process);
        let b2 = encrypted(&[0, 1, 0, 0, 0, 0, 0, 0], &process);

        state
            .apply_batch(&[Some(SlotBallot {
                address: [1u8; 20],
                ballot: b1,
            })])
            .unwrap();
        let application = state
            .apply_batch(&[Some(SlotBallot {
                address: [1u8; 20],
                ballot: b2,
            })])
            .unwrap();
        assert_eq!(application.num_overwrites, 1);

        // net tally is the replacement ballot alone
        let (add, sub) = state.results().unwrap();
        let secret = process.encryption_secret_scalar();
        let net = add.sub(&sub).decrypt(&secret, 100).unwrap();
        assert_eq!(net, [0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_same_address_twice_in_one_batch() {
        let (store, process) = test_process();
        let (mut state, _) = ProcessState::init(&store, &process).unwrap();
        let b1 = encrypted(&[1, 0, 0, 0, 0, 0, 0, 0], &process);
        let b2 = encrypted(&[0, 0, 1, 0, 0, 0, 0, 0], &process);
        let application = state
            .apply_batch(&[
                Some(SlotBallot {
                    address: [1u8; 20],
                    ballot: b1,
                }),
                Some(SlotBallot {
                    address: [1u8; 20],
                    ballot: b2,
                }),
            ])
            .unwrap();
        // last one wins; the first contributes to both accumulators
        assert_eq!(application.num_new, 2);
        assert_eq!(application.num_overwrites, 1);
        let (add, sub) = state.results().unwrap();
        let secret = process.encryption_secret_scalar();
        let net = add.sub(&sub).decrypt(&secret, 100).unwrap();
        assert_eq!(net, [0, 0, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_transition_chain_roots() {
        let (store, process) = test_process();
        let (mut state, _) = ProcessState::init(&store, &process).unwrap();
        let slots: Vec<_> = (1u8..=3)
            .map(|i| {
                Some(SlotBallot {
                    address: [i; 20],
                    ballot: encrypted(&[i as u64, 0, 0, 0, 0, 0, 0, 0], &process),
                })
            })
            .collect();
        let application = state.apply_batch(&slots).unwrap();

        // transitions chain: root_after of i equals root_before of i + 1
        let mut cursor = application.root_before;
        for transition in &application.slot_transitions {
            assert_eq!(transition.root_before, cursor);
            cursor = transition.root_after;
        }
        assert_eq!(
            application.results_add_transition.root_before, cursor
        );
        assert_eq!(
            application.results_sub_transition.root_after,
            application.root_after
        );
    }

    #[test]
    fn test_singleton_proofs_verify_against_pre_root() {
        let (store, process) = test_process();
        let (mut state, genesis) = ProcessState::init(&store, &process).unwrap();
        let application = state
            .apply_batch(&[Some(SlotBallot {
                address: [1u8; 20],
                ballot: encrypted(&[1, 0, 0, 0, 0, 0, 0, 0], &process),
            })])
            .unwrap();
        assert_eq!(application.root_before, genesis);
        let proof = &application.process_id_proof;
        let siblings = unpack_siblings(&proof.siblings).unwrap();
        assert!(verify_proof(&genesis, &proof.key, &proof.value, &siblings));
    }

    #[test]
    fn test_abort_restores_pre_batch_root() {
        let (store, process) = test_process();
        let (mut state, genesis) = ProcessState::init(&store, &process).unwrap();
        state
            .stage_batch(&[Some(SlotBallot {
                address: [1u8; 20],
                ballot: encrypted(&[1, 0, 0, 0, 0, 0, 0, 0], &process),
            })])
            .unwrap();
        assert_ne!(state.root(), genesis);
        state.abort_batch().unwrap();
        assert_eq!(state.root(), genesis);
    }

    #[test]
    fn test_reopen_preserves_root() {
        let (store, process) = test_process();
        let (mut state, _) = ProcessState::init(&store, &process).unwrap();
        state
            .apply_batch(&[Some(SlotBallot {
                address: [1u8; 20],
                ballot: encrypted(&[1, 0, 0, 0, 0, 0, 0, 0], &process),
            })])
            .unwrap();
        let root = state.root();
        drop(state);
        let reopened = ProcessState::open(&store, &process.id.marshal()).unwrap();
        assert_eq!(reopened.root(), root);
    }
}
