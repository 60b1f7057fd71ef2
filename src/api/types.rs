//! JSON request and response bodies
//!
//! All `hex` fields are lowercase unprefixed hex; big integers travel as
//! decimal strings.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{BallotMode, Process};

/// Decimal form of a little-endian coordinate pair.
pub fn point_decimal(point: &[u8; 64]) -> [String; 2] {
    [
        BigUint::from_bytes_le(&point[..32]).to_string(),
        BigUint::from_bytes_le(&point[32..]).to_string(),
    ]
}

// =============================================================================
// Processes
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessRequest {
    pub census_root: String,
    pub ballot_mode: BallotMode,
    pub nonce: u64,
    pub chain_id: u32,
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessResponse {
    pub process_id: String,
    pub encryption_pub_key: [String; 2],
    pub state_root: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub process_id: String,
    pub census_root: String,
    pub ballot_mode: BallotMode,
    pub encryption_pub_key: [String; 2],
    pub state_root: String,
    pub status: String,
    pub start_time: u64,
    pub duration: u64,
    pub max_votes: u64,
    pub settled_votes: u64,
    pub batch_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_results: Option<Vec<String>>,
}

impl From<Process> for ProcessResponse {
    fn from(process: Process) -> Self {
        Self {
            process_id: process.id.to_hex(),
            census_root: hex::encode(process.census_root),
            encryption_pub_key: point_decimal(&process.encryption_key),
            state_root: hex::encode(process.state_root),
            status: format!("{:?}", process.status).to_uppercase(),
            start_time: process.start_time,
            duration: process.duration,
            max_votes: process.max_votes,
            settled_votes: process.settled_votes,
            batch_count: process.batch_count,
            final_results: process
                .final_results
                .map(|results| results.iter().map(u64::to_string).collect()),
            ballot_mode: process.ballot_mode,
        }
    }
}

// =============================================================================
// Censuses
// =============================================================================

#[derive(Serialize)]
pub struct CreateCensusResponse {
    pub census: Uuid,
}

#[derive(Deserialize)]
pub struct ParticipantInput {
    pub key: String,
    pub weight: Option<String>,
}

#[derive(Deserialize)]
pub struct AddParticipantsRequest {
    pub participants: Vec<ParticipantInput>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddParticipantsResponse {
    pub root: String,
    pub invalid: Vec<InvalidRow>,
}

#[derive(Serialize)]
pub struct InvalidRow {
    pub index: usize,
    pub reason: String,
}

#[derive(Serialize)]
pub struct ParticipantOutput {
    pub key: String,
    pub weight: String,
}

#[derive(Serialize)]
pub struct ParticipantsResponse {
    pub participants: Vec<ParticipantOutput>,
}

#[derive(Serialize)]
pub struct RootResponse {
    pub root: String,
}

#[derive(Serialize)]
pub struct SizeResponse {
    pub size: u64,
}

#[derive(Deserialize)]
pub struct ProofQuery {
    pub key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CensusProofResponse {
    pub root: String,
    pub key: String,
    pub value: String,
    pub siblings: String,
    pub weight: String,
}

// =============================================================================
// Votes
// =============================================================================

#[derive(Serialize)]
pub struct SubmitVoteResponse {
    pub nullifier: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_decimal() {
        let mut point = [0u8; 64];
        point[0] = 5;
        point[32] = 1;
        assert_eq!(point_decimal(&point), ["5".to_string(), "1".to_string()]);
    }
}
