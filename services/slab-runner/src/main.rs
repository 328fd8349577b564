//! Pipeline runner.
//!
//! Loads a YAML pipeline description, generates its source datasets and
//! runs the stages over a group of in-process ranks sharing one storage
//! backend. Interrupting the run (or reaching the configured checkpoint
//! interval) stops every rank at the next batch boundary; `--resume` picks
//! the run up from the checkpoint files.

mod config;
mod processors;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::RunnerConfig;
use slab_core::{
    build_backend, BackendKind, CancellationToken, ChunkPlan, Communicator, DatasetDescriptor,
    DimSlice, EngineConfig, FileCheckpointer, Pipeline, PipelineContext, RunOutcome,
    StorageBackend, ThreadCommunicator, ThreadGroup, TracingProgress,
};

#[derive(Parser, Debug)]
#[command(name = "slab-runner")]
#[command(about = "Run a pattern-sliced processing pipeline over in-process ranks")]
struct Args {
    /// Pipeline configuration file
    #[arg(short, long, default_value = "config/pipeline.yaml")]
    config: PathBuf,

    /// Number of ranks
    #[arg(short, long, default_value_t = 1, env = "SLAB_RANKS")]
    ranks: usize,

    /// Storage backend (zarr, in_memory); overrides the config file
    #[arg(long)]
    backend: Option<String>,

    /// Output directory for stores and checkpoints; overrides the config file
    #[arg(long)]
    out_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: Level,

    /// Continue from existing checkpoint files
    #[arg(long)]
    resume: bool,
}

fn parse_level(value: &str) -> std::result::Result<Level, String> {
    value
        .parse::<Level>()
        .map_err(|_| format!("unknown log level '{}'", value))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting slab runner");

    let config = RunnerConfig::load(&args.config)?;
    let mut engine = config.engine.clone().with_env_overrides();
    if let Some(backend) = &args.backend {
        engine.backend = BackendKind::from_str(backend);
    }
    if let Some(out_path) = &args.out_path {
        engine.out_path = out_path.clone();
    }
    engine
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid engine configuration: {}", e))?;

    if args.ranks == 0 {
        bail!("--ranks must be at least 1");
    }
    if args.resume && engine.backend == BackendKind::InMemory {
        bail!("cannot resume a run whose datasets were held in memory");
    }

    info!(
        config = %args.config.display(),
        ranks = args.ranks,
        backend = %engine.backend,
        out_path = %engine.out_path.display(),
        stages = config.stages.len(),
        resume = args.resume,
        "Loaded configuration"
    );

    let checkpoint_dir = engine.out_path.join("checkpoints");
    if !args.resume {
        clear_checkpoints(&checkpoint_dir)?;
    }

    let backend = build_backend(engine.backend, &engine.out_path, None)?;
    let descriptors = config.descriptors()?;
    if !args.resume {
        write_sources(&config, backend.as_ref())?;
    }
    let pipeline = config.pipeline()?;

    let token = CancellationToken::new(engine.checkpoint_interval());
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, checkpointing at the next batch boundary");
                token.cancel();
            }
        });
    }

    let group = ThreadGroup::new(args.ranks, engine.barrier_timeout())?;
    let tasks = group.communicators().into_iter().map(|comm| {
        let job = RankJob {
            engine: engine.clone(),
            backend: backend.clone(),
            descriptors: descriptors.clone(),
            pipeline: pipeline.clone(),
            checkpoint_dir: checkpoint_dir.clone(),
            token: token.clone(),
        };
        tokio::task::spawn_blocking(move || job.run(comm))
    });

    let results = futures::future::try_join_all(tasks)
        .await
        .context("Rank task panicked")?;
    let outcomes = results.into_iter().collect::<Result<Vec<_>>>()?;

    backend.close()?;
    report(&outcomes);
    Ok(())
}

/// Everything one rank needs to run the pipeline.
struct RankJob {
    engine: EngineConfig,
    backend: Arc<dyn StorageBackend>,
    descriptors: Vec<DatasetDescriptor>,
    pipeline: Pipeline,
    checkpoint_dir: PathBuf,
    token: CancellationToken,
}

impl RankJob {
    fn run(self, comm: ThreadCommunicator) -> Result<RunOutcome> {
        let rank = comm.rank();
        let checkpointer = FileCheckpointer::new(&self.checkpoint_dir, rank, self.token)?;

        let mut ctx = PipelineContext::new(self.engine, Arc::new(comm), self.backend)
            .with_checkpointer(Arc::new(checkpointer))
            .with_progress(Arc::new(TracingProgress::new(rank)));
        for desc in self.descriptors {
            ctx.add_dataset(desc);
        }

        self.pipeline
            .run(&mut ctx)
            .with_context(|| format!("Rank {} failed", rank))
    }
}

fn clear_checkpoints(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to clear checkpoints in {:?}", dir))?;
        info!(path = %dir.display(), "Cleared previous checkpoints");
    }
    Ok(())
}

/// Create and fill every source dataset at its stored shape.
fn write_sources(config: &RunnerConfig, backend: &dyn StorageBackend) -> Result<()> {
    for dataset in &config.datasets {
        let data = dataset.generate()?;
        let full: Vec<DimSlice> = dataset.shape.iter().map(|&s| DimSlice::full(s)).collect();
        backend
            .create_dataset(&dataset.name, &dataset.shape, dataset.dtype, &ChunkPlan::Auto)
            .and_then(|_| backend.write(&dataset.name, &full, data.view()))
            .with_context(|| format!("Failed to write source dataset '{}'", dataset.name))?;
        info!(dataset = %dataset.name, shape = ?dataset.shape, "Wrote source dataset");
    }
    Ok(())
}

fn report(outcomes: &[RunOutcome]) {
    let mut frames = 0;
    for (rank, outcome) in outcomes.iter().enumerate() {
        match outcome {
            RunOutcome::Completed {
                frames: rank_frames,
                ..
            } => frames += rank_frames,
            RunOutcome::Killed {
                completed_plugins,
                transfer_idx,
                process_idx,
            } => info!(
                rank = rank,
                completed = completed_plugins,
                transfer = transfer_idx,
                process = process_idx,
                "Rank checkpointed"
            ),
        }
    }

    if outcomes.iter().any(RunOutcome::is_killed) {
        info!("Run stopped at a checkpoint; rerun with --resume to continue");
    } else {
        info!(frames = frames, ranks = outcomes.len(), "Pipeline finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_level() {
        let args = Args::try_parse_from(["slab-runner"]).unwrap();
        assert_eq!(args.log_level, Level::INFO);
    }

    #[test]
    fn test_log_level_is_case_insensitive() {
        let args = Args::try_parse_from(["slab-runner", "--log-level", "DEBUG"]).unwrap();
        assert_eq!(args.log_level, Level::DEBUG);
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let err = Args::try_parse_from(["slab-runner", "--log-level", "verbose"]).unwrap_err();
        assert!(err.to_string().contains("unknown log level"));
    }
}
