//! Sequencer entry point

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use zkvoting_sequencer::api;
use zkvoting_sequencer::chain::NoopChainClient;
use zkvoting_sequencer::config::SequencerConfig;
use zkvoting_sequencer::pipeline::Sequencer;
use zkvoting_sequencer::prover::artifacts::{bootstrap_artifacts, FsArtifactStore, MemoryArtifactStore};
use zkvoting_sequencer::prover::{MockProofSystem, ProofSystem};
use zkvoting_sequencer::storage::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = SequencerConfig::parse();
    let store = Store::open(&config.data_dir).context("opening data directory")?;
    let prover: Arc<dyn ProofSystem> = Arc::new(MockProofSystem);

    // prefer pre-built artifacts on disk; otherwise bootstrap through the
    // backend so development runs work out of the box
    let artifacts: Arc<dyn zkvoting_sequencer::prover::artifacts::ArtifactStore> =
        if config.artifact_dir.is_dir() {
            Arc::new(FsArtifactStore::new(config.artifact_dir.clone()))
        } else {
            let memory = MemoryArtifactStore::default();
            bootstrap_artifacts(prover.as_ref(), &memory)
                .await
                .context("bootstrapping artifacts")?;
            Arc::new(memory)
        };

    let port = config.port;
    let sequencer = Sequencer::new(
        config,
        store,
        prover,
        artifacts,
        Arc::new(NoopChainClient),
    )
    .await
    .context("starting sequencer")?;

    info!("sequencer ready");
    tokio::select! {
        result = api::serve(Arc::clone(&sequencer), port) => {
            result.context("http server")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            sequencer.stop();
        }
    }
    Ok(())
}
