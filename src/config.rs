//! Sequencer configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "zkvoting-sequencer", about = "Privacy-voting sequencer")]
pub struct SequencerConfig {
    /// Data directory for the embedded store
    #[arg(long, env = "SEQUENCER_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// HTTP listen port
    #[arg(long, env = "SEQUENCER_PORT", default_value_t = 9090)]
    pub port: u16,

    /// Verifier workers per process
    #[arg(long, env = "SEQUENCER_WORKERS", default_value_t = 4)]
    pub workers_per_process: usize,

    /// Seconds before a partial batch is padded and sealed
    #[arg(long, env = "SEQUENCER_BATCH_DEADLINE_SECS", default_value_t = 120)]
    pub batch_deadline_secs: u64,

    /// Timeout for a single cryptographic proof verification, in seconds
    #[arg(long, env = "SEQUENCER_VERIFY_TIMEOUT_SECS", default_value_t = 30)]
    pub verify_timeout_secs: u64,

    /// Deadline for proof production, in seconds
    #[arg(long, env = "SEQUENCER_PROVE_TIMEOUT_SECS", default_value_t = 600)]
    pub prove_timeout_secs: u64,

    /// Default voting duration for new processes, in seconds
    #[arg(long, env = "SEQUENCER_DEFAULT_DURATION_SECS", default_value_t = 86400)]
    pub default_duration_secs: u64,

    /// Default vote cap for new processes
    #[arg(long, env = "SEQUENCER_DEFAULT_MAX_VOTES", default_value_t = 100_000)]
    pub default_max_votes: u64,

    /// Directory holding proving/verifying key artifacts
    #[arg(long, env = "SEQUENCER_ARTIFACT_DIR", default_value = "./artifacts")]
    pub artifact_dir: PathBuf,
}

impl SequencerConfig {
    pub fn batch_deadline(&self) -> Duration {
        Duration::from_secs(self.batch_deadline_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn prove_timeout(&self) -> Duration {
        Duration::from_secs(self.prove_timeout_secs)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            port: 9090,
            workers_per_process: 4,
            batch_deadline_secs: 120,
            verify_timeout_secs: 30,
            prove_timeout_secs: 600,
            default_duration_secs: 86400,
            default_max_votes: 100_000,
            artifact_dir: PathBuf::from("./artifacts"),
        }
    }
}
