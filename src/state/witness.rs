//! State-transition witness assembly
//!
//! The outer proof attests a batch against just the pre- and post-roots.
//! Each mutation yields a Merkle transition; transitions chain so that the
//! siblings-before of transition `i + 1` are consistent with the root
//! after transition `i`. Singleton leaves are proved once against the
//! pre-batch root.

use serde::{Deserialize, Serialize};

use crate::types::{hex_array, serde_hex_vec, ProcessId};

/// One authenticated mutation of the state tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleTransition {
    #[serde(with = "serde_hex_vec")]
    pub key: Vec<u8>,
    /// Zero when the key was absent before the mutation.
    #[serde(with = "hex_array")]
    pub old_value: [u8; 32],
    #[serde(with = "hex_array")]
    pub new_value: [u8; 32],
    #[serde(with = "serde_hex_vec")]
    pub siblings_before: Vec<u8>,
    #[serde(with = "serde_hex_vec")]
    pub siblings_after: Vec<u8>,
    #[serde(with = "hex_array")]
    pub root_before: [u8; 32],
    #[serde(with = "hex_array")]
    pub root_after: [u8; 32],
    /// Dummy slots emit a transition that changes nothing.
    pub noop: bool,
}

impl MerkleTransition {
    pub fn noop(root: [u8; 32]) -> Self {
        Self {
            key: Vec::new(),
            old_value: [0u8; 32],
            new_value: [0u8; 32],
            siblings_before: Vec::new(),
            siblings_after: Vec::new(),
            root_before: root,
            root_after: root,
            noop: true,
        }
    }
}

/// Plain inclusion proof of a singleton leaf against the pre-batch root.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingletonProof {
    #[serde(with = "serde_hex_vec")]
    pub key: Vec<u8>,
    #[serde(with = "hex_array")]
    pub value: [u8; 32],
    #[serde(with = "serde_hex_vec")]
    pub siblings: Vec<u8>,
}

/// Everything the final proof needs as witness.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransitionWitness {
    pub process_id: ProcessId,
    #[serde(with = "hex_array")]
    pub census_root: [u8; 32],
    #[serde(with = "serde_hex_vec")]
    pub ballot_mode_bytes: Vec<u8>,
    #[serde(with = "hex_array")]
    pub encryption_key: [u8; 64],
    #[serde(with = "hex_array")]
    pub root_before: [u8; 32],
    #[serde(with = "hex_array")]
    pub root_after: [u8; 32],
    pub num_new: u64,
    pub num_overwrites: u64,
    /// One transition per batch slot, in application order.
    pub slot_transitions: Vec<MerkleTransition>,
    pub results_add_transition: MerkleTransition,
    pub results_sub_transition: MerkleTransition,
    pub process_id_proof: SingletonProof,
    pub census_root_proof: SingletonProof,
    pub ballot_mode_proof: SingletonProof,
    pub encryption_key_proof: SingletonProof,
    #[serde(with = "serde_hex_vec")]
    pub aggregator_proof: Vec<u8>,
    #[serde(with = "serde_hex_vec")]
    pub aggregator_vk: Vec<u8>,
}
