//! Protocol constants and well-known state keys

/// Ciphertext fields per ballot
pub const FIELDS_PER_BALLOT: usize = 8;

/// Ballots per aggregation batch
pub const VOTES_PER_BATCH: usize = 10;

/// Maximum census key length in bytes; longer keys are hashed and truncated
pub const CENSUS_KEY_MAX_LEN: usize = 20;

/// Sparse Merkle tree depth (census and state trees)
pub const MAX_TREE_LEVELS: usize = 160;

/// Hash output length in bytes
pub const HASH_LEN: usize = 32;

/// Process id wire length: chain_id(4) | creator(20) | nonce(8)
pub const PROCESS_ID_LEN: usize = 32;

/// Ballot wire length: per ciphertext C1.X, C1.Y, C2.X, C2.Y, 32 bytes each
pub const BALLOT_WIRE_LEN: usize = FIELDS_PER_BALLOT * 4 * 32;

/// Well-known singleton leaf keys of the process state tree.
///
/// Voter ballots are keyed by their 20-byte address; a real address would
/// need nineteen leading zero bytes to collide with these.
pub mod state_keys {
    pub const PROCESS_ID: &[u8] = &[0x00];
    pub const CENSUS_ROOT: &[u8] = &[0x01];
    pub const BALLOT_MODE: &[u8] = &[0x02];
    pub const ENCRYPTION_KEY: &[u8] = &[0x03];
    pub const RESULTS_ADD: &[u8] = &[0x04];
    pub const RESULTS_SUB: &[u8] = &[0x05];
}

/// Artifact identifiers for verifying/proving key lookup
pub mod circuits {
    /// Per-ballot inner proof
    pub const BALLOT_PROOF: &str = "ballot_proof";
    /// Sentinel witness proved once per process for padded slots
    pub const BALLOT_PROOF_DUMMY: &str = "ballot_proof_dummy";
    /// Recursive batch aggregation
    pub const AGGREGATOR: &str = "aggregator";
    /// Final state transition
    pub const STATE_TRANSITION: &str = "state_transition";
}
