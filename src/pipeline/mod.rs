//! Process coordinator
//!
//! Owns the per-process lifecycle: ingestion, verification workers, the
//! aggregation loop, and state transitions. One aggregation task runs per
//! process; verification runs under a per-process worker budget and
//! replies synchronously to the submitter. Shutdown cancels the loops;
//! in-flight batches are discarded idempotently (their ballots stay in
//! the verified queue).

pub mod aggregator;
pub mod queue;
pub mod transition;
pub mod verifier;

use std::collections::HashMap;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha3::{Digest, Keccak256};
use tokio::sync::{watch, Mutex, Notify, RwLock, Semaphore};
use tracing::{info, warn};

use crate::census::CensusRegistry;
use crate::chain::ChainClient;
use crate::config::SequencerConfig;
use crate::constants::{circuits, FIELDS_PER_BALLOT, VOTES_PER_BATCH};
use crate::crypto::elgamal::{Ballot, EncryptionKeypair};
use crate::crypto::signature;
use crate::errors::{Error, Result};
use crate::prover::artifacts::{ccs_id, pk_id, ArtifactStore, KeyCache};
use crate::prover::{encode_witness, ProofSystem};
use crate::state::ProcessState;
use crate::storage::{keys, Store};
use crate::types::{
    BallotMode, BallotStatus, Process, ProcessId, ProcessStatus, SubmittedBallot, TransitionBundle,
    VerifiedBallot,
};

use self::aggregator::Aggregator;
use self::queue::VerifiedQueue;
use self::transition::TransitionDriver;
use self::verifier::VoteVerifier;

/// The digest an organization key signs to set up a process:
/// `keccak256(chain_id BE || nonce BE || census_root || ballot_mode)`.
pub fn setup_digest(chain_id: u32, nonce: u64, census_root: &[u8; 32], mode: &BallotMode) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(chain_id.to_be_bytes());
    hasher.update(nonce.to_be_bytes());
    hasher.update(census_root);
    hasher.update(mode.to_bytes());
    hasher.finalize().into()
}

struct ProcessWorkers {
    queue: Mutex<VerifiedQueue>,
    state: Mutex<ProcessState>,
    batch_ready: Notify,
    verify_slots: Semaphore,
}

pub struct Sequencer {
    config: SequencerConfig,
    store: Store,
    pub censuses: Arc<CensusRegistry>,
    chain: Arc<dyn ChainClient>,
    prover: Arc<dyn ProofSystem>,
    keys: Arc<KeyCache>,
    verifier: VoteVerifier,
    aggregator: Aggregator,
    transition: TransitionDriver,
    processes: RwLock<HashMap<ProcessId, Arc<ProcessWorkers>>>,
    statuses: StdRwLock<HashMap<(ProcessId, [u8; 32]), BallotStatus>>,
    bundles: StdRwLock<HashMap<ProcessId, TransitionBundle>>,
    shutdown: watch::Sender<bool>,
}

impl Sequencer {
    /// Build the coordinator and resume workers for every process still
    /// accepting votes.
    pub async fn new(
        config: SequencerConfig,
        store: Store,
        prover: Arc<dyn ProofSystem>,
        artifacts: Arc<dyn ArtifactStore>,
        chain: Arc<dyn ChainClient>,
    ) -> Result<Arc<Self>> {
        let keys = Arc::new(KeyCache::new(artifacts));
        let (shutdown, _) = watch::channel(false);
        let sequencer = Arc::new(Self {
            verifier: VoteVerifier::new(
                Arc::clone(&prover),
                Arc::clone(&keys),
                config.verify_timeout(),
            ),
            aggregator: Aggregator::new(
                Arc::clone(&prover),
                Arc::clone(&keys),
                config.prove_timeout(),
            ),
            transition: TransitionDriver::new(
                Arc::clone(&prover),
                Arc::clone(&keys),
                config.prove_timeout(),
            ),
            censuses: CensusRegistry::new(store.clone()),
            chain,
            prover,
            keys,
            store,
            config,
            processes: RwLock::new(HashMap::new()),
            statuses: StdRwLock::new(HashMap::new()),
            bundles: StdRwLock::new(HashMap::new()),
            shutdown,
        });

        // resume persisted processes
        let records = sequencer.store.scan_prefix(keys::PROCESS_PREFIX)?;
        for (_, raw) in records {
            match serde_json::from_slice::<Process>(&raw) {
                Ok(process) if process.status.accepts_votes() => {
                    Arc::clone(&sequencer).start_workers(&process).await?;
                    info!(process = %process.id, "resumed process workers");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "skipping corrupt process record"),
            }
        }
        Ok(sequencer)
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Stop every worker loop. In-flight verifications drop; partially
    /// built batches are discarded and their ballots stay queued.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    // =========================================================================
    // Processes
    // =========================================================================

    /// Create a process from a signed setup message. The creator address
    /// is recovered from the signature; the process id is always derived
    /// from `(chain_id, creator, nonce)`, never randomized.
    pub async fn create_process(
        self: Arc<Self>,
        chain_id: u32,
        nonce: u64,
        census_root: [u8; 32],
        ballot_mode: BallotMode,
        setup_signature: &[u8],
    ) -> Result<Process> {
        ballot_mode.validate()?;
        let digest = setup_digest(chain_id, nonce, &census_root, &ballot_mode);
        let creator = signature::recover_address(&digest, setup_signature)?;
        let id = ProcessId {
            chain_id,
            creator,
            nonce,
        };
        if self.store.get(&keys::process(&id.marshal()))?.is_some() {
            return Err(Error::AlreadyExists(format!("process {id}")));
        }

        let keypair = EncryptionKeypair::generate(&mut rand::rngs::OsRng);
        let mut process = Process {
            id,
            census_root,
            ballot_mode,
            encryption_key: [0u8; 64],
            encryption_secret: [0u8; 32],
            state_root: [0u8; 32],
            status: ProcessStatus::Ready,
            start_time: Self::now(),
            duration: self.config.default_duration_secs,
            max_votes: self.config.default_max_votes,
            settled_votes: 0,
            batch_count: 0,
            dummy_proof: Vec::new(),
            final_results: None,
        };
        process.set_encryption_keypair(&keypair.secret, &keypair.public);
        process.dummy_proof = self.prove_dummy().await?;

        let (_, state_root) = ProcessState::init(&self.store, &process)?;
        process.state_root = state_root;
        self.store
            .put_json(&keys::process(&id.marshal()), &process)?;

        // on-chain registration runs in the background
        let chain = Arc::clone(&self.chain);
        let for_chain = process.clone();
        tokio::spawn(async move {
            match chain.create_process(&for_chain).await {
                Ok(hash) => {
                    if let Err(e) = chain.wait_tx(hash, Duration::from_secs(120)).await {
                        warn!(process = %for_chain.id, error = %e, "process registration unconfirmed");
                    }
                }
                Err(e) => warn!(process = %for_chain.id, error = %e, "process registration failed"),
            }
        });

        Arc::clone(&self).start_workers(&process).await?;
        info!(process = %process.id, "process created");
        Ok(process)
    }

    /// The sentinel witness proved once per process; padded batch slots
    /// reuse this proof.
    async fn prove_dummy(&self) -> Result<Vec<u8>> {
        let ccs = self.keys.get(&ccs_id(circuits::BALLOT_PROOF_DUMMY)).await?;
        let pk = self.keys.get(&pk_id(circuits::BALLOT_PROOF_DUMMY)).await?;
        let witness = encode_witness(&[[0u8; 32]], b"dummy");
        self.prover.prove(&pk, &ccs, &witness).await
    }

    pub fn process(&self, id: &ProcessId) -> Result<Process> {
        self.store
            .get_json::<Process>(&keys::process(&id.marshal()))?
            .ok_or(Error::ProcessNotFound)
    }

    /// Transition a process's status, persisting the record.
    pub fn set_process_status(&self, id: &ProcessId, status: ProcessStatus) -> Result<Process> {
        let mut process = self.process(id)?;
        process.status = status;
        self.store
            .put_json(&keys::process(&id.marshal()), &process)?;
        Ok(process)
    }

    async fn start_workers(self: Arc<Self>, process: &Process) -> Result<Arc<ProcessWorkers>> {
        let queue = VerifiedQueue::open(
            self.store
                .keyspace(&keys::verified_ballots(&process.id.marshal()))?,
        )?;
        let state = ProcessState::open(&self.store, &process.id.marshal())?;
        let workers = Arc::new(ProcessWorkers {
            queue: Mutex::new(queue),
            state: Mutex::new(state),
            batch_ready: Notify::new(),
            verify_slots: Semaphore::new(self.config.workers_per_process),
        });
        self.processes
            .write()
            .await
            .insert(process.id, Arc::clone(&workers));
        let id = process.id;
        let loop_workers = Arc::clone(&workers);
        tokio::spawn(Arc::clone(&self).run_aggregation_loop(id, loop_workers));
        Ok(workers)
    }

    async fn workers(&self, id: &ProcessId) -> Result<Arc<ProcessWorkers>> {
        self.processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(Error::ProcessNotFound)
    }

    // =========================================================================
    // Ingestion
    // =========================================================================

    /// Verify a submitted ballot and deposit it in the verified store.
    /// The outcome returns synchronously to the submitter.
    pub async fn submit_vote(&self, ballot: SubmittedBallot) -> Result<()> {
        let mut process = self.process(&ballot.process_id)?;

        // auto-close on elapsed duration; a ballot racing the close is
        // dropped the same way as one for an unknown process
        if process.status.accepts_votes()
            && Self::now() > process.start_time.saturating_add(process.duration)
        {
            process = self.set_process_status(&ballot.process_id, ProcessStatus::Ended)?;
        }
        if !process.status.accepts_votes() {
            return Err(Error::ProcessNotFound);
        }
        if process.settled_votes >= process.max_votes {
            return Err(Error::ConstraintViolation("vote cap reached".into()));
        }

        let workers = self.workers(&ballot.process_id).await?;
        let _permit = workers
            .verify_slots
            .acquire()
            .await
            .map_err(|_| Error::Internal("verifier pool closed".into()))?;

        let nullifier = ballot.nullifier;
        match self.verifier.verify(&process, &ballot).await {
            Ok(verified) => {
                let len = {
                    let mut queue = workers.queue.lock().await;
                    queue.push(verified)?;
                    queue.len()
                };
                self.set_status(ballot.process_id, nullifier, BallotStatus::Verified);
                if len >= VOTES_PER_BATCH {
                    workers.batch_ready.notify_one();
                }
                Ok(())
            }
            Err(e) => {
                self.set_status(
                    ballot.process_id,
                    nullifier,
                    BallotStatus::Rejected {
                        code: e.code(),
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    fn set_status(&self, process_id: ProcessId, nullifier: [u8; 32], status: BallotStatus) {
        self.statuses
            .write()
            .expect("status map poisoned")
            .insert((process_id, nullifier), status);
    }

    /// Last observed status of a ballot, by nullifier.
    pub fn vote_status(&self, process_id: &ProcessId, nullifier: &[u8; 32]) -> Option<BallotStatus> {
        self.statuses
            .read()
            .expect("status map poisoned")
            .get(&(*process_id, *nullifier))
            .cloned()
    }

    /// Ballots waiting in the verified store.
    pub async fn verified_count(&self, id: &ProcessId) -> Result<usize> {
        let workers = self.workers(id).await?;
        let queue = workers.queue.lock().await;
        Ok(queue.len())
    }

    /// Current accumulators `(results_add, results_sub)`.
    pub async fn results(&self, id: &ProcessId) -> Result<(Ballot, Ballot)> {
        let workers = self.workers(id).await?;
        let state = workers.state.lock().await;
        state.results()
    }

    /// Output bundle of the most recent settled transition.
    pub fn last_transition(&self, id: &ProcessId) -> Option<TransitionBundle> {
        self.bundles
            .read()
            .expect("bundle map poisoned")
            .get(id)
            .cloned()
    }

    // =========================================================================
    // Aggregation loop
    // =========================================================================

    async fn run_aggregation_loop(self: Arc<Self>, id: ProcessId, workers: Arc<ProcessWorkers>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let deadline = tokio::time::sleep(self.config.batch_deadline());
            tokio::pin!(deadline);
            let ballots = tokio::select! {
                _ = workers.batch_ready.notified() => {
                    let mut queue = workers.queue.lock().await;
                    if queue.len() >= VOTES_PER_BATCH {
                        queue.take(VOTES_PER_BATCH)
                    } else {
                        Ok(Vec::new())
                    }
                }
                _ = &mut deadline => {
                    // pad whatever arrived before the deadline
                    let mut queue = workers.queue.lock().await;
                    queue.take(VOTES_PER_BATCH)
                }
                _ = shutdown.changed() => break,
            };
            let ballots = match ballots {
                Ok(ballots) => ballots,
                Err(e) => {
                    warn!(process = %id, error = %e, "verified queue read failed");
                    continue;
                }
            };
            if ballots.is_empty() {
                continue;
            }
            if let Err(e) = self.seal_batch(&id, &workers, ballots).await {
                warn!(process = %id, error = %e, "batch failed, ballots requeued");
            }
        }
    }

    async fn seal_batch(
        &self,
        id: &ProcessId,
        workers: &ProcessWorkers,
        ballots: Vec<VerifiedBallot>,
    ) -> Result<()> {
        let process = self.process(id)?;
        for verified in &ballots {
            self.set_status(*id, verified.ballot.nullifier, BallotStatus::Aggregated);
        }

        let batch = match self.aggregator.aggregate(&process, ballots.clone()).await {
            Ok(batch) => batch,
            Err(e) => {
                // no ballot can be rejected once aggregation begins; the
                // whole batch returns to the queue
                self.requeue(workers, ballots).await;
                return Err(e);
            }
        };

        let mut state = workers.state.lock().await;
        match self.transition.settle(&process, &mut state, &batch).await {
            Ok((bundle, application)) => {
                drop(state);
                for verified in &batch.ballots {
                    self.set_status(*id, verified.ballot.nullifier, BallotStatus::Settled);
                }
                let mut process = self.process(id)?;
                process.state_root = bundle.root_after;
                process.settled_votes += application.num_new;
                process.batch_count += 1;
                self.store
                    .put_json(&keys::process(&id.marshal()), &process)?;
                self.bundles
                    .write()
                    .expect("bundle map poisoned")
                    .insert(*id, bundle);
                info!(
                    process = %id,
                    new = application.num_new,
                    overwrites = application.num_overwrites,
                    "state transition settled"
                );
                Ok(())
            }
            Err(e) => {
                drop(state);
                self.requeue(workers, batch.ballots).await;
                Err(e)
            }
        }
    }

    async fn requeue(&self, workers: &ProcessWorkers, ballots: Vec<VerifiedBallot>) {
        let process_id = ballots
            .first()
            .map(|b| b.ballot.process_id);
        let nullifiers: Vec<[u8; 32]> = ballots.iter().map(|b| b.ballot.nullifier).collect();
        let mut queue = workers.queue.lock().await;
        if let Err(e) = queue.requeue_front(ballots) {
            warn!(error = %e, "requeue failed, ballots lost from queue");
            return;
        }
        if let Some(process_id) = process_id {
            for nullifier in nullifiers {
                self.set_status(process_id, nullifier, BallotStatus::Verified);
            }
        }
    }

    /// End voting, settle any waiting ballots, and decrypt the net tally
    /// off-path with the sequencer-held key. The decrypted results
    /// persist on the process record and the status becomes Finalized.
    pub async fn finalize_process(
        &self,
        id: &ProcessId,
        max_message: u64,
    ) -> Result<[u64; FIELDS_PER_BALLOT]> {
        let process = self.process(id)?;
        if process.status == ProcessStatus::Finalized {
            return Err(Error::AlreadyExists(format!("finalized process {id}")));
        }
        if process.status.accepts_votes() {
            self.set_process_status(id, ProcessStatus::Ended)?;
        }
        // settle whatever is still queued; a process ended before a
        // restart has no workers and nothing to settle
        match self.flush_batch(id).await {
            Ok(()) | Err(Error::ProcessNotFound) => {}
            Err(e) => return Err(e),
        }

        let state = ProcessState::open(&self.store, &id.marshal())?;
        let (add, sub) = state.results()?;
        let results = add
            .sub(&sub)
            .decrypt(&process.encryption_secret_scalar(), max_message)?;

        let mut process = self.process(id)?;
        process.status = ProcessStatus::Finalized;
        process.final_results = Some(results);
        self.store
            .put_json(&keys::process(&id.marshal()), &process)?;
        info!(process = %id, "process finalized");
        Ok(results)
    }

    /// Force the current queue contents into a padded batch immediately,
    /// regardless of the deadline. Used by operators and tests.
    pub async fn flush_batch(&self, id: &ProcessId) -> Result<()> {
        let workers = self.workers(id).await?;
        let ballots = {
            let mut queue = workers.queue.lock().await;
            queue.take(VOTES_PER_BATCH)?
        };
        if ballots.is_empty() {
            return Ok(());
        }
        self.seal_batch(id, &workers, ballots).await
    }
}
