//! Core domain records: process ids, ballot modes, processes, census
//! proofs, and the ballot lifecycle.

use ark_ff::PrimeField;
use num_bigint::BigUint;
use num_traits::One;
use serde::{Deserialize, Serialize};

use crate::constants::{FIELDS_PER_BALLOT, PROCESS_ID_LEN};
use crate::crypto::babyjubjub::{point_from_bytes, point_to_bytes, CurvePoint, CurveScalar};
use crate::crypto::elgamal::Ballot;
use crate::crypto::fields::{self, InnerField};
use crate::errors::{Error, Result};
use crate::prover::RecursiveProof;

/// Hex-encoded fixed-length byte arrays in JSON records.
pub mod hex_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        v: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("wrong length"))
    }
}

/// Decimal-string big integers, the wire form for all unbounded values.
pub mod biguint_dec {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(v: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigUint::from_str(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Process id
// =============================================================================

/// Globally unique process identifier:
/// `chain_id (4, BE) || creator_address (20) || nonce (8, BE)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId {
    pub chain_id: u32,
    pub creator: [u8; 20],
    pub nonce: u64,
}

impl ProcessId {
    pub fn marshal(&self) -> [u8; PROCESS_ID_LEN] {
        let mut out = [0u8; PROCESS_ID_LEN];
        out[..4].copy_from_slice(&self.chain_id.to_be_bytes());
        out[4..24].copy_from_slice(&self.creator);
        out[24..].copy_from_slice(&self.nonce.to_be_bytes());
        out
    }

    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PROCESS_ID_LEN {
            return Err(Error::MalformedInput(format!(
                "process id must be {PROCESS_ID_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            chain_id: u32::from_be_bytes(bytes[..4].try_into().unwrap()),
            creator: bytes[4..24].try_into().unwrap(),
            nonce: u64::from_be_bytes(bytes[24..].try_into().unwrap()),
        })
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes =
            hex::decode(s).map_err(|_| Error::MalformedInput("bad process id hex".into()))?;
        Self::unmarshal(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.marshal())
    }

    /// The id as an inner field element, for public-input hashing.
    pub fn to_inner_field(&self) -> InnerField {
        InnerField::from_be_bytes_mod_order(&self.marshal())
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ProcessId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ProcessId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ProcessId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Ballot mode
// =============================================================================

/// Per-process voting rules, fixed at setup. Its deterministic
/// serialization hashes into every ballot's public inputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallotMode {
    pub max_count: u8,
    #[serde(with = "biguint_dec")]
    pub max_value: BigUint,
    #[serde(with = "biguint_dec")]
    pub min_value: BigUint,
    pub force_uniqueness: bool,
    pub cost_from_weight: bool,
    pub cost_exponent: u8,
    #[serde(with = "biguint_dec")]
    pub max_total_cost: BigUint,
    #[serde(with = "biguint_dec")]
    pub min_total_cost: BigUint,
}

impl BallotMode {
    pub fn validate(&self) -> Result<()> {
        if self.max_count as usize > FIELDS_PER_BALLOT {
            return Err(Error::MalformedInput(format!(
                "maxCount exceeds {FIELDS_PER_BALLOT}"
            )));
        }
        if self.min_value > self.max_value {
            return Err(Error::MalformedInput("minValue exceeds maxValue".into()));
        }
        if self.min_total_cost > self.max_total_cost {
            return Err(Error::MalformedInput(
                "minTotalCost exceeds maxTotalCost".into(),
            ));
        }
        Ok(())
    }

    fn biguint_be32(v: &BigUint) -> [u8; 32] {
        let bytes = v.to_bytes_be();
        let mut out = [0u8; 32];
        let start = 32usize.saturating_sub(bytes.len());
        out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(32)..]);
        out
    }

    /// Deterministic serialization: flags first, then each big int 32-byte
    /// big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 4 * 32);
        out.push(self.max_count);
        out.push(self.force_uniqueness as u8);
        out.push(self.cost_from_weight as u8);
        out.push(self.cost_exponent);
        out.extend_from_slice(&Self::biguint_be32(&self.max_value));
        out.extend_from_slice(&Self::biguint_be32(&self.min_value));
        out.extend_from_slice(&Self::biguint_be32(&self.max_total_cost));
        out.extend_from_slice(&Self::biguint_be32(&self.min_total_cost));
        out
    }

    /// Field elements in voter-hash order: max_count, force_uniqueness,
    /// max_value, min_value, max_total_cost, min_total_cost,
    /// cost_exponent, cost_from_weight.
    pub fn hash_inputs(&self) -> [InnerField; 8] {
        [
            InnerField::from(self.max_count as u64),
            InnerField::from(self.force_uniqueness as u64),
            fields::biguint_to_field(&self.max_value),
            fields::biguint_to_field(&self.min_value),
            fields::biguint_to_field(&self.max_total_cost),
            fields::biguint_to_field(&self.min_total_cost),
            InnerField::from(self.cost_exponent as u64),
            InnerField::from(self.cost_from_weight as u64),
        ]
    }
}

impl Default for BallotMode {
    fn default() -> Self {
        Self {
            max_count: FIELDS_PER_BALLOT as u8,
            max_value: BigUint::from(u32::MAX),
            min_value: BigUint::from(0u8),
            force_uniqueness: false,
            cost_from_weight: false,
            cost_exponent: 1,
            max_total_cost: BigUint::from(u64::MAX),
            min_total_cost: BigUint::from(0u8),
        }
    }
}

// =============================================================================
// Process
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProcessStatus {
    Ready,
    Open,
    Ended,
    Finalized,
}

impl ProcessStatus {
    /// Whether ballots are still accepted.
    pub fn accepts_votes(&self) -> bool {
        matches!(self, ProcessStatus::Ready | ProcessStatus::Open)
    }
}

/// A voting process as the sequencer persists it. The encryption secret is
/// sequencer-held and never leaves the record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Process {
    pub id: ProcessId,
    #[serde(with = "hex_array")]
    pub census_root: [u8; 32],
    pub ballot_mode: BallotMode,
    #[serde(with = "hex_array")]
    pub encryption_key: [u8; 64],
    #[serde(with = "hex_array")]
    pub encryption_secret: [u8; 32],
    #[serde(with = "hex_array")]
    pub state_root: [u8; 32],
    pub status: ProcessStatus,
    pub start_time: u64,
    pub duration: u64,
    pub max_votes: u64,
    /// Ballots folded into state transitions so far.
    pub settled_votes: u64,
    /// State transitions produced so far.
    pub batch_count: u64,
    /// Proof of the sentinel dummy witness, produced at setup and reused
    /// for every padded batch slot.
    #[serde(with = "serde_hex_vec")]
    pub dummy_proof: Vec<u8>,
    /// Decrypted net tally, present once the process is finalized.
    pub final_results: Option<[u64; FIELDS_PER_BALLOT]>,
}

impl Process {
    pub fn encryption_public(&self) -> Result<CurvePoint> {
        point_from_bytes(&self.encryption_key)
    }

    pub fn encryption_secret_scalar(&self) -> CurveScalar {
        CurveScalar::from_le_bytes_mod_order(&self.encryption_secret)
    }

    pub fn set_encryption_keypair(&mut self, secret: &CurveScalar, public: &CurvePoint) {
        let mut secret_bytes = [0u8; 32];
        let le = fields::to_bytes_le(secret);
        secret_bytes.copy_from_slice(&le);
        self.encryption_secret = secret_bytes;
        self.encryption_key = point_to_bytes(public);
    }
}

// =============================================================================
// Census proof
// =============================================================================

/// Merkle inclusion proof against a census root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusProof {
    #[serde(with = "hex_array")]
    pub root: [u8; 32],
    #[serde(with = "serde_hex_vec")]
    pub key: Vec<u8>,
    #[serde(with = "hex_array")]
    pub value: [u8; 32],
    #[serde(with = "serde_hex_vec")]
    pub siblings: Vec<u8>,
    #[serde(with = "biguint_dec")]
    pub weight: BigUint,
}

/// Hex-encoded variable-length byte strings.
pub mod serde_hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Ballots in flight
// =============================================================================

/// A ballot as submitted by a voter, before verification.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedBallot {
    pub process_id: ProcessId,
    #[serde(with = "hex_array")]
    pub address: [u8; 20],
    #[serde(with = "serde_hex_vec")]
    pub public_key: Vec<u8>,
    pub census_proof: CensusProof,
    pub ballot: Ballot,
    #[serde(with = "hex_array")]
    pub nullifier: [u8; 32],
    #[serde(with = "hex_array")]
    pub commitment: [u8; 32],
    /// MiMC7 hash of the public-input tuple, little-endian inner field
    /// encoding.
    #[serde(with = "hex_array")]
    pub inputs_hash: [u8; 32],
    #[serde(with = "serde_hex_vec")]
    pub proof: Vec<u8>,
    #[serde(with = "serde_hex_vec")]
    pub signature: Vec<u8>,
}

impl SubmittedBallot {
    pub fn inputs_hash_field(&self) -> InnerField {
        fields::from_bytes_le(&self.inputs_hash)
    }
}

/// A ballot that passed verification, carrying its recursive-form proof.
/// Consumed exactly once by an aggregation batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifiedBallot {
    pub ballot: SubmittedBallot,
    pub recursive_proof: RecursiveProof,
}

/// Lifecycle of a submitted ballot, pollable by nullifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BallotStatus {
    /// Accepted into the verified store, awaiting aggregation.
    Verified,
    /// Consumed by an aggregation batch.
    Aggregated,
    /// Folded into a settled state transition.
    Settled,
    /// Rejected during verification.
    Rejected { code: u32, reason: String },
}

/// Output bundle of a settled state transition, ready for on-chain
/// submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionBundle {
    pub process_id: ProcessId,
    #[serde(with = "hex_array")]
    pub root_before: [u8; 32],
    #[serde(with = "hex_array")]
    pub root_after: [u8; 32],
    pub valid_votes: u64,
    #[serde(with = "serde_hex_vec")]
    pub proof: Vec<u8>,
}

/// Default participant weight when none is supplied.
pub fn default_weight() -> BigUint {
    BigUint::one()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_round_trip() {
        let id = ProcessId {
            chain_id: 11,
            creator: [0xab; 20],
            nonce: 900,
        };
        let bytes = id.marshal();
        assert_eq!(bytes.len(), PROCESS_ID_LEN);
        assert_eq!(ProcessId::unmarshal(&bytes).unwrap(), id);
        assert_eq!(ProcessId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn test_process_id_layout() {
        let id = ProcessId {
            chain_id: 1,
            creator: [2; 20],
            nonce: 3,
        };
        let bytes = id.marshal();
        assert_eq!(&bytes[..4], &[0, 0, 0, 1]);
        assert_eq!(&bytes[4..24], &[2; 20]);
        assert_eq!(&bytes[24..], &[0, 0, 0, 0, 0, 0, 0, 3]);
    }

    #[test]
    fn test_ballot_mode_validation() {
        let mut mode = BallotMode::default();
        mode.validate().unwrap();
        mode.min_value = BigUint::from(10u8);
        mode.max_value = BigUint::from(5u8);
        assert!(mode.validate().is_err());
    }

    #[test]
    fn test_ballot_mode_serialization_deterministic() {
        let mode = BallotMode::default();
        assert_eq!(mode.to_bytes(), mode.to_bytes());
        assert_eq!(mode.to_bytes().len(), 4 + 4 * 32);
    }

    #[test]
    fn test_ballot_mode_json_uses_decimal_strings() {
        let mode = BallotMode::default();
        let json = serde_json::to_value(&mode).unwrap();
        assert!(json.get("maxValue").unwrap().is_string());
    }

    #[test]
    fn test_status_vote_acceptance() {
        assert!(ProcessStatus::Ready.accepts_votes());
        assert!(ProcessStatus::Open.accepts_votes());
        assert!(!ProcessStatus::Ended.accepts_votes());
        assert!(!ProcessStatus::Finalized.accepts_votes());
    }
}
