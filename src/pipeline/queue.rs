//! Verified-ballot queue
//!
//! Per-process FIFO of verified ballots awaiting aggregation,
//! deduplicated by nullifier: a repeat nullifier replaces the earlier
//! entry and moves to the back of the queue (the state engine treats the
//! later ballot as an overwrite). Entries persist under the process's
//! `vb_` keyspace keyed by sequence number, so a restart resumes with the
//! queue intact. Single-writer; the owner wraps it in a lock.

use std::collections::{BTreeMap, HashMap};

use crate::errors::Result;
use crate::storage::Keyspace;
use crate::types::VerifiedBallot;

pub struct VerifiedQueue {
    keyspace: Keyspace,
    entries: BTreeMap<u64, VerifiedBallot>,
    by_nullifier: HashMap<[u8; 32], u64>,
    next_seq: u64,
}

impl VerifiedQueue {
    /// Open the queue, reloading any persisted entries.
    pub fn open(keyspace: Keyspace) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut by_nullifier = HashMap::new();
        let mut next_seq = 0u64;
        for item in keyspace.iter() {
            let (key, value) = item?;
            if key.len() != 8 {
                continue;
            }
            let seq = u64::from_be_bytes(key.try_into().unwrap());
            let ballot: VerifiedBallot = serde_json::from_slice(&value)?;
            by_nullifier.insert(ballot.ballot.nullifier, seq);
            entries.insert(seq, ballot);
            next_seq = next_seq.max(seq + 1);
        }
        Ok(Self {
            keyspace,
            entries,
            by_nullifier,
            next_seq,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a verified ballot. A duplicate nullifier overwrites the
    /// queued entry.
    pub fn push(&mut self, ballot: VerifiedBallot) -> Result<()> {
        let nullifier = ballot.ballot.nullifier;
        if let Some(old_seq) = self.by_nullifier.remove(&nullifier) {
            self.entries.remove(&old_seq);
            self.keyspace.delete(&old_seq.to_be_bytes())?;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.keyspace
            .put(&seq.to_be_bytes(), &serde_json::to_vec(&ballot)?)?;
        self.by_nullifier.insert(nullifier, seq);
        self.entries.insert(seq, ballot);
        Ok(())
    }

    /// Remove and return up to `max` entries in queue order.
    pub fn take(&mut self, max: usize) -> Result<Vec<VerifiedBallot>> {
        let seqs: Vec<u64> = self.entries.keys().take(max).copied().collect();
        let mut out = Vec::with_capacity(seqs.len());
        for seq in seqs {
            let ballot = self.entries.remove(&seq).expect("seq just listed");
            self.keyspace.delete(&seq.to_be_bytes())?;
            self.by_nullifier.remove(&ballot.ballot.nullifier);
            out.push(ballot);
        }
        Ok(out)
    }

    /// Put taken entries back at the front, preserving their order. Used
    /// when a batch is discarded.
    pub fn requeue_front(&mut self, ballots: Vec<VerifiedBallot>) -> Result<()> {
        let front = self.entries.keys().next().copied().unwrap_or(u64::MAX / 2);
        let count = ballots.len() as u64;
        for (i, ballot) in ballots.into_iter().enumerate() {
            let seq = front.saturating_sub(count - i as u64);
            self.keyspace
                .put(&seq.to_be_bytes(), &serde_json::to_vec(&ballot)?)?;
            self.by_nullifier.insert(ballot.ballot.nullifier, seq);
            self.entries.insert(seq, ballot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prover::RecursiveProof;
    use crate::storage::Store;
    use crate::types::{BallotMode, CensusProof, ProcessId, SubmittedBallot};
    use crate::crypto::elgamal::Ballot;
    use num_bigint::BigUint;

    fn ballot(nullifier: u8) -> VerifiedBallot {
        VerifiedBallot {
            ballot: SubmittedBallot {
                process_id: ProcessId {
                    chain_id: 1,
                    creator: [0; 20],
                    nonce: 0,
                },
                address: [nullifier; 20],
                public_key: vec![2; 33],
                census_proof: CensusProof {
                    root: [0; 32],
                    key: vec![nullifier; 20],
                    value: [0; 32],
                    siblings: vec![0, 0, 0, 0],
                    weight: BigUint::from(1u8),
                },
                ballot: Ballot::zero(),
                nullifier: [nullifier; 32],
                commitment: [0; 32],
                inputs_hash: [0; 32],
                proof: vec![1],
                signature: vec![2],
            },
            recursive_proof: RecursiveProof {
                proof: vec![1],
                public_witness: [[0; 32]; 4],
            },
        }
    }

    fn queue() -> VerifiedQueue {
        let store = Store::temporary().unwrap();
        VerifiedQueue::open(store.keyspace("vb_test").unwrap()).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = queue();
        q.push(ballot(1)).unwrap();
        q.push(ballot(2)).unwrap();
        q.push(ballot(3)).unwrap();
        let taken = q.take(2).unwrap();
        assert_eq!(taken[0].ballot.nullifier, [1; 32]);
        assert_eq!(taken[1].ballot.nullifier, [2; 32]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_nullifier_overwrite() {
        let mut q = queue();
        q.push(ballot(1)).unwrap();
        q.push(ballot(2)).unwrap();
        let mut replacement = ballot(1);
        replacement.ballot.proof = vec![9];
        q.push(replacement).unwrap();
        assert_eq!(q.len(), 2);
        let taken = q.take(2).unwrap();
        // the replacement moved to the back
        assert_eq!(taken[0].ballot.nullifier, [2; 32]);
        assert_eq!(taken[1].ballot.nullifier, [1; 32]);
        assert_eq!(taken[1].ballot.proof, vec![9]);
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut q = queue();
        for i in 1..=4 {
            q.push(ballot(i)).unwrap();
        }
        let taken = q.take(2).unwrap();
        q.requeue_front(taken).unwrap();
        let all = q.take(4).unwrap();
        let order: Vec<u8> = all.iter().map(|b| b.ballot.nullifier[0]).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let store = Store::temporary().unwrap();
        let ks = store.keyspace("vb_test").unwrap();
        {
            let mut q = VerifiedQueue::open(ks.clone()).unwrap();
            q.push(ballot(1)).unwrap();
            q.push(ballot(2)).unwrap();
        }
        let mut q = VerifiedQueue::open(ks).unwrap();
        assert_eq!(q.len(), 2);
        let taken = q.take(2).unwrap();
        assert_eq!(taken[0].ballot.nullifier, [1; 32]);
    }
}
