//! HTTP endpoint handlers
//!
//! Thin adapter over the coordinator: parse, delegate, encode. Bodies
//! live in [`super::types`].

use std::str::FromStr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use num_bigint::BigUint;
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::pipeline::Sequencer;
use crate::types::{BallotStatus, ProcessId, SubmittedBallot};

use super::types::{
    point_decimal, AddParticipantsRequest, AddParticipantsResponse, CensusProofResponse,
    CreateCensusResponse, CreateProcessRequest, CreateProcessResponse, InvalidRow,
    ParticipantOutput, ParticipantsResponse, ProcessResponse, ProofQuery, RootResponse,
    SizeResponse, SubmitVoteResponse,
};

fn hex_bytes(s: &str, what: &str) -> Result<Vec<u8>> {
    hex::decode(s).map_err(|_| Error::MalformedInput(format!("bad {what} hex")))
}

fn hex32(s: &str, what: &str) -> Result<[u8; 32]> {
    hex_bytes(s, what)?
        .try_into()
        .map_err(|_| Error::MalformedInput(format!("{what} must be 32 bytes")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|_| Error::MalformedInput("bad census id".into()))
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload
        .map(|Json(inner)| inner)
        .map_err(|e| Error::MalformedInput(e.to_string()))
}

// =============================================================================
// Liveness
// =============================================================================

pub async fn ping() -> StatusCode {
    StatusCode::OK
}

// =============================================================================
// Processes
// =============================================================================

pub async fn create_process(
    State(sequencer): State<Arc<Sequencer>>,
    payload: std::result::Result<Json<CreateProcessRequest>, JsonRejection>,
) -> Result<Json<CreateProcessResponse>> {
    let request = body(payload)?;
    let census_root = hex32(&request.census_root, "censusRoot")?;
    let signature = hex_bytes(&request.signature, "signature")?;
    let process = sequencer
        .clone()
        .create_process(
            request.chain_id,
            request.nonce,
            census_root,
            request.ballot_mode,
            &signature,
        )
        .await?;
    Ok(Json(CreateProcessResponse {
        process_id: process.id.to_hex(),
        encryption_pub_key: point_decimal(&process.encryption_key),
        state_root: hex::encode(process.state_root),
    }))
}

pub async fn get_process(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<String>,
) -> Result<Json<ProcessResponse>> {
    let id = ProcessId::from_hex(&id)?;
    Ok(Json(sequencer.process(&id)?.into()))
}

// =============================================================================
// Censuses
// =============================================================================

pub async fn create_census(
    State(sequencer): State<Arc<Sequencer>>,
) -> Result<Json<CreateCensusResponse>> {
    let uuid = Uuid::new_v4();
    sequencer.censuses.create(uuid).await?;
    Ok(Json(CreateCensusResponse { census: uuid }))
}

pub async fn add_participants(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<String>,
    payload: std::result::Result<Json<AddParticipantsRequest>, JsonRejection>,
) -> Result<Json<AddParticipantsResponse>> {
    let uuid = parse_uuid(&id)?;
    let request = body(payload)?;
    let mut rows = Vec::with_capacity(request.participants.len());
    for participant in &request.participants {
        let key = hex_bytes(&participant.key, "participant key")?;
        let weight = match &participant.weight {
            Some(w) => BigUint::from_str(w)
                .map_err(|_| Error::MalformedInput("bad participant weight".into()))?,
            None => crate::types::default_weight(),
        };
        rows.push((key, weight));
    }
    let outcome = sequencer.censuses.insert_batch(&uuid, &rows).await?;
    Ok(Json(AddParticipantsResponse {
        root: hex::encode(outcome.root),
        invalid: outcome
            .invalid
            .into_iter()
            .map(|(index, error)| InvalidRow {
                index,
                reason: error.to_string(),
            })
            .collect(),
    }))
}

pub async fn list_participants(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<String>,
) -> Result<Json<ParticipantsResponse>> {
    let uuid = parse_uuid(&id)?;
    let participants = sequencer.censuses.participants(&uuid).await?;
    Ok(Json(ParticipantsResponse {
        participants: participants
            .into_iter()
            .map(|(key, weight)| ParticipantOutput {
                key: hex::encode(key),
                weight: weight.to_string(),
            })
            .collect(),
    }))
}

pub async fn census_root(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<String>,
) -> Result<Json<RootResponse>> {
    let uuid = parse_uuid(&id)?;
    let root = sequencer.censuses.root(&uuid).await?;
    Ok(Json(RootResponse {
        root: hex::encode(root),
    }))
}

/// Size by census id, or by root when the segment parses as a 32-byte
/// hex root. A root shared by several censuses resolves to the first
/// registered one.
pub async fn census_size(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<String>,
) -> Result<Json<SizeResponse>> {
    let size = match Uuid::parse_str(&id) {
        Ok(uuid) => sequencer.censuses.size(&uuid).await?,
        Err(_) => {
            let root = hex32(&id, "census id or root")?;
            sequencer.censuses.size_by_root(&root).await?
        }
    };
    Ok(Json(SizeResponse { size }))
}

/// Deletes the census. The verb is GET for wire compatibility.
pub async fn delete_census(
    State(sequencer): State<Arc<Sequencer>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let uuid = parse_uuid(&id)?;
    sequencer.censuses.delete(&uuid).await?;
    Ok(StatusCode::OK)
}

pub async fn proof_by_root(
    State(sequencer): State<Arc<Sequencer>>,
    Path(root): Path<String>,
    Query(query): Query<ProofQuery>,
) -> Result<Json<CensusProofResponse>> {
    let root = hex32(&root, "root")?;
    let key = hex_bytes(&query.key, "key")?;
    let proof = sequencer.censuses.proof_by_root(&root, &key).await?;
    Ok(Json(CensusProofResponse {
        root: hex::encode(proof.root),
        key: hex::encode(&proof.key),
        value: hex::encode(proof.value),
        siblings: hex::encode(&proof.siblings),
        weight: proof.weight.to_string(),
    }))
}

// =============================================================================
// Votes
// =============================================================================

pub async fn submit_vote(
    State(sequencer): State<Arc<Sequencer>>,
    payload: std::result::Result<Json<SubmittedBallot>, JsonRejection>,
) -> Result<Json<SubmitVoteResponse>> {
    let ballot = body(payload)?;
    let nullifier = ballot.nullifier;
    sequencer.submit_vote(ballot).await?;
    Ok(Json(SubmitVoteResponse {
        nullifier: hex::encode(nullifier),
        status: "verified".into(),
    }))
}

pub async fn vote_status(
    State(sequencer): State<Arc<Sequencer>>,
    Path((process_id, nullifier)): Path<(String, String)>,
) -> Result<Json<BallotStatus>> {
    let process_id = ProcessId::from_hex(&process_id)?;
    let nullifier = hex32(&nullifier, "nullifier")?;
    sequencer
        .vote_status(&process_id, &nullifier)
        .map(Json)
        .ok_or_else(|| Error::NotFound("ballot".into()))
}
