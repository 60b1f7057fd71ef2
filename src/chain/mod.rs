//! On-chain collaborator capability
//!
//! Contract bindings are external; the core consults them through this
//! opaque client during setup and finalization.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{Process, ProcessId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Confirmed,
    Failed,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn create_process(&self, process: &Process) -> Result<[u8; 32]>;

    async fn wait_tx(&self, hash: [u8; 32], timeout: Duration) -> Result<TxStatus>;

    async fn create_organization(&self, address: [u8; 20], info: &str) -> Result<[u8; 32]>;

    async fn get_process(&self, id: &ProcessId) -> Result<Process>;
}

/// Client that accepts everything locally. Used in tests and when the
/// sequencer runs detached from a chain.
#[derive(Default)]
pub struct NoopChainClient;

#[async_trait]
impl ChainClient for NoopChainClient {
    async fn create_process(&self, process: &Process) -> Result<[u8; 32]> {
        Ok(*blake3::hash(&process.id.marshal()).as_bytes())
    }

    async fn wait_tx(&self, _hash: [u8; 32], _timeout: Duration) -> Result<TxStatus> {
        Ok(TxStatus::Confirmed)
    }

    async fn create_organization(&self, address: [u8; 20], _info: &str) -> Result<[u8; 32]> {
        Ok(*blake3::hash(&address).as_bytes())
    }

    async fn get_process(&self, id: &ProcessId) -> Result<Process> {
        Err(crate::errors::Error::NotFound(format!("process {id}")))
    }
}
