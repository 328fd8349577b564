//! Running a sequence of stages on one rank.
//!
//! A [`PipelineContext`] carries everything that lives for a whole run: the
//! engine configuration, this rank's communicator, the shared backend, the
//! dataset index, the checkpointer, the progress reporter and run counters.
//! [`Pipeline::run`] takes every rank through the stages in lock step:
//!
//! ```text
//!   validate all stages (every rank, before any barrier)
//!   for each stage not yet completed:
//!       barrier  start
//!       plan chunks for outputs, rank 0 creates them
//!       barrier  create
//!       transfer loop
//!       barrier  done
//!       agree on partial stage / kill, write checkpoint
//!       revert previews
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::StorageBackend;
use crate::checkpoint::{Checkpointer, NoCheckpoint};
use crate::chunking::{ChunkPlanner, PatternAccess};
use crate::comm::Communicator;
use crate::config::EngineConfig;
use crate::dataset::{DatasetDescriptor, DatasetMeta};
use crate::error::{Result, SlabError};
use crate::padding::PaddingDirective;
use crate::pattern::{Pattern, PatternName};
use crate::progress::{ProgressReporter, TracingProgress};
use crate::slicing::SliceListBuilder;
use crate::transport::{
    FrameProcessor, LoopOutcome, ResumePoint, TransferInput, TransferLoop, TransferOutput,
};

/// State owned by one rank for one end-to-end run.
pub struct PipelineContext {
    pub config: EngineConfig,
    pub comm: Arc<dyn Communicator>,
    pub backend: Arc<dyn StorageBackend>,
    pub datasets: BTreeMap<String, DatasetDescriptor>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub progress: Arc<dyn ProgressReporter>,
    /// Stages executed by this context (skipped stages excluded).
    pub stages_run: usize,
    /// Frames processed by this rank.
    pub frames_processed: usize,
}

impl PipelineContext {
    pub fn new(
        config: EngineConfig,
        comm: Arc<dyn Communicator>,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        let rank = comm.rank();
        Self {
            config,
            comm,
            backend,
            datasets: BTreeMap::new(),
            checkpointer: Arc::new(NoCheckpoint::default()),
            progress: Arc::new(TracingProgress::new(rank)),
            stages_run: 0,
            frames_processed: 0,
        }
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn n_ranks(&self) -> usize {
        self.comm.size()
    }

    /// Register (or replace) a dataset.
    pub fn add_dataset(&mut self, desc: DatasetDescriptor) {
        self.datasets.insert(desc.name.clone(), desc);
    }

    pub fn dataset(&self, name: &str) -> Result<&DatasetDescriptor> {
        self.datasets
            .get(name)
            .ok_or_else(|| SlabError::DatasetNotFound(name.to_string()))
    }

    pub fn dataset_mut(&mut self, name: &str) -> Result<&mut DatasetDescriptor> {
        self.datasets
            .get_mut(name)
            .ok_or_else(|| SlabError::DatasetNotFound(name.to_string()))
    }
}

/// A dataset read by a stage.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub dataset: String,
    pub pattern: PatternName,
    pub padding: PaddingDirective,
}

impl StageInput {
    pub fn new(dataset: impl Into<String>, pattern: PatternName) -> Self {
        Self {
            dataset: dataset.into(),
            pattern,
            padding: PaddingDirective::new(),
        }
    }

    pub fn with_padding(mut self, padding: PaddingDirective) -> Self {
        self.padding = padding;
        self
    }
}

/// A dataset written by a stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub dataset: String,
    pub pattern: PatternName,
    /// Layout of the output; defaults to the first input's shape, type,
    /// labels and patterns.
    pub descriptor: Option<DatasetDescriptor>,
    pub unpad: bool,
}

impl StageOutput {
    pub fn new(dataset: impl Into<String>, pattern: PatternName) -> Self {
        Self {
            dataset: dataset.into(),
            pattern,
            descriptor: None,
            unpad: true,
        }
    }

    pub fn with_descriptor(mut self, descriptor: DatasetDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Write results as returned, without stripping input padding.
    pub fn keep_padding(mut self) -> Self {
        self.unpad = false;
        self
    }
}

/// One processing step.
#[derive(Clone)]
pub struct Stage {
    pub name: String,
    pub inputs: Vec<StageInput>,
    pub outputs: Vec<StageOutput>,
    pub processor: Arc<dyn FrameProcessor>,
    /// Overrides `EngineConfig::max_transfer_frames`.
    pub max_transfer_frames: Option<usize>,
    /// Overrides `EngineConfig::max_process_frames`.
    pub max_process_frames: Option<usize>,
    pub fixed_length: bool,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("processor", &self.processor.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl Stage {
    pub fn new(name: impl Into<String>, processor: Arc<dyn FrameProcessor>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            processor,
            max_transfer_frames: None,
            max_process_frames: None,
            fixed_length: false,
        }
    }

    pub fn input(mut self, input: StageInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: StageOutput) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn max_frames(mut self, transfer: usize, process: usize) -> Self {
        self.max_transfer_frames = Some(transfer);
        self.max_process_frames = Some(process);
        self
    }

    pub fn fixed_length(mut self, fixed: bool) -> Self {
        self.fixed_length = fixed;
        self
    }

    fn frames(&self, config: &EngineConfig) -> (usize, usize) {
        (
            self.max_transfer_frames.unwrap_or(config.max_transfer_frames).max(1),
            self.max_process_frames.unwrap_or(config.max_process_frames).max(1),
        )
    }

    fn tag(&self, phase: &str) -> String {
        format!("{}:{}", self.name, phase)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed {
        stages_run: usize,
        frames: usize,
    },
    /// Stopped for a checkpoint; the fields are what was persisted.
    Killed {
        completed_plugins: usize,
        transfer_idx: usize,
        process_idx: usize,
    },
}

impl RunOutcome {
    pub fn is_killed(&self) -> bool {
        matches!(self, Self::Killed { .. })
    }
}

struct StageReport {
    outcome: LoopOutcome,
    n_transfers: usize,
}

/// An ordered list of stages.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage not yet recorded as completed by the checkpointer.
    pub fn run(&self, ctx: &mut PipelineContext) -> Result<RunOutcome> {
        let state = ctx.checkpointer.read_checkpoint()?;
        if state.completed_plugins > 0 || state.is_mid_stage(0) {
            for meta in state.datasets.iter().cloned() {
                let desc = meta.into_descriptor()?;
                ctx.add_dataset(desc);
            }
            info!(
                rank = ctx.rank(),
                completed = state.completed_plugins,
                transfer = state.transfer_idx,
                process = state.process_idx,
                "Resuming from checkpoint"
            );
        }

        self.validate(ctx)?;

        for (idx, stage) in self.stages.iter().enumerate() {
            if idx < state.completed_plugins {
                debug!(stage = %stage.name, "Skipping completed stage");
                self.register_outputs(ctx, stage, false)?;
                continue;
            }

            let resume = state
                .is_mid_stage(idx)
                .then(|| ResumePoint::new(state.transfer_idx, state.process_idx));

            let report = match self.run_stage(ctx, idx, stage, resume) {
                Ok(report) => report,
                Err(e) => {
                    warn!(stage = %stage.name, error = %e, "Stage failed, flushing checkpoint");
                    if let Err(flush) = ctx.checkpointer.write_completed(idx) {
                        warn!(error = %flush, "Failed to flush checkpoint");
                    }
                    return Err(e);
                }
            };

            let killed_here = report.outcome.is_killed();
            let partial = ctx.comm.any(&stage.tag("partial"), killed_here)?;
            let kill = ctx.comm.any(
                &stage.tag("kill"),
                killed_here || ctx.checkpointer.is_time_to_checkpoint(),
            )?;

            ctx.stages_run += 1;
            if let LoopOutcome::Completed { frames } = report.outcome {
                ctx.frames_processed += frames;
            }

            if partial {
                self.record_datasets(ctx);
                let (transfer_idx, process_idx) = match report.outcome {
                    LoopOutcome::Killed {
                        transfer_idx,
                        process_idx,
                    } => (transfer_idx, process_idx),
                    LoopOutcome::Completed { .. } => {
                        ctx.checkpointer.write_checkpoint(report.n_transfers, 0)?;
                        (report.n_transfers, 0)
                    }
                };
                info!(stage = %stage.name, rank = ctx.rank(), "Run stopped part-way through stage");
                return Ok(RunOutcome::Killed {
                    completed_plugins: idx,
                    transfer_idx,
                    process_idx,
                });
            }

            for input in &stage.inputs {
                let desc = ctx.dataset_mut(&input.dataset)?;
                if desc.revert_preview {
                    desc.revert_preview();
                }
            }
            self.record_datasets(ctx);
            ctx.checkpointer.write_completed(idx + 1)?;

            if kill {
                info!(stage = %stage.name, rank = ctx.rank(), "Run stopped after stage");
                return Ok(RunOutcome::Killed {
                    completed_plugins: idx + 1,
                    transfer_idx: 0,
                    process_idx: 0,
                });
            }
        }

        info!(
            rank = ctx.rank(),
            stages = ctx.stages_run,
            frames = ctx.frames_processed,
            "Pipeline complete"
        );
        Ok(RunOutcome::Completed {
            stages_run: ctx.stages_run,
            frames: ctx.frames_processed,
        })
    }

    /// Check every stage's datasets, patterns and padding without touching
    /// storage or other ranks.
    pub fn validate(&self, ctx: &PipelineContext) -> Result<()> {
        let mut known = ctx.datasets.clone();
        for stage in &self.stages {
            if stage.inputs.is_empty() {
                return Err(SlabError::pattern_mismatch(format!(
                    "stage '{}' has no inputs",
                    stage.name
                )));
            }
            for input in &stage.inputs {
                let desc = known
                    .get(&input.dataset)
                    .ok_or_else(|| SlabError::DatasetNotFound(input.dataset.clone()))?;
                let pattern = desc.pattern(input.pattern)?;
                pattern.validate_rank(desc.rank())?;
                input.padding.validate(pattern, desc.preview.as_ref())?;
            }
            for output in &stage.outputs {
                if stage.inputs.iter().any(|i| i.dataset == output.dataset) {
                    return Err(SlabError::Config(format!(
                        "stage '{}' writes '{}' which it also reads",
                        stage.name, output.dataset
                    )));
                }
                let desc = output_descriptor(stage, output, &known)?;
                desc.pattern(output.pattern)?.validate_rank(desc.rank())?;
                known.insert(output.dataset.clone(), desc);
            }
        }
        Ok(())
    }

    fn register_outputs(&self, ctx: &mut PipelineContext, stage: &Stage, replace: bool) -> Result<()> {
        for output in &stage.outputs {
            if !replace && ctx.datasets.contains_key(&output.dataset) {
                continue;
            }
            let desc = output_descriptor(stage, output, &ctx.datasets)?;
            ctx.add_dataset(desc);
        }
        Ok(())
    }

    fn record_datasets(&self, ctx: &PipelineContext) {
        let metas = ctx.datasets.values().map(DatasetMeta::from).collect();
        ctx.checkpointer.record_datasets(metas);
    }

    /// Pattern and max frames of the first later stage reading `dataset`.
    fn next_reader(&self, after: usize, dataset: &str, config: &EngineConfig) -> Option<(PatternName, usize)> {
        self.stages.iter().skip(after + 1).find_map(|stage| {
            stage
                .inputs
                .iter()
                .find(|i| i.dataset == dataset)
                .map(|i| (i.pattern, stage.frames(config).0))
        })
    }

    fn run_stage(
        &self,
        ctx: &mut PipelineContext,
        idx: usize,
        stage: &Stage,
        resume: Option<ResumePoint>,
    ) -> Result<StageReport> {
        let comm = ctx.comm.clone();
        let backend = ctx.backend.clone();
        let (rank, n_ranks) = (comm.rank(), comm.size());
        let (mft, mfp) = stage.frames(&ctx.config);

        comm.barrier(&stage.tag("start"))?;
        let resuming = comm.any(&stage.tag("resume"), resume.is_some())?;
        info!(
            stage = %stage.name,
            processor = stage.processor.name(),
            rank = rank,
            resuming = resuming,
            "Starting stage"
        );

        self.register_outputs(ctx, stage, !resuming)?;

        if rank == 0 && !resuming {
            let planner = ChunkPlanner::new(&ctx.config, n_ranks);
            for output in &stage.outputs {
                let desc = ctx.dataset(&output.dataset)?;
                let current = physical_pattern(desc, output.pattern)?;
                let next = self
                    .next_reader(idx, &output.dataset, &ctx.config)
                    .map(|(name, frames)| physical_pattern(desc, name).map(|p| (p, frames)))
                    .transpose()?;
                let shape = desc.physical_shape();
                let plan = planner.plan(
                    PatternAccess::new(&current, mft),
                    next.as_ref().map(|(p, frames)| PatternAccess::new(p, *frames)),
                    &shape,
                    desc.dtype,
                )?;
                backend.create_dataset(&output.dataset, &shape, desc.dtype, &plan)?;
            }
        }
        comm.barrier(&stage.tag("create"))?;

        let mut inputs = Vec::with_capacity(stage.inputs.len());
        for input in &stage.inputs {
            let desc = ctx.dataset(&input.dataset)?;
            check_stored_shape(backend.as_ref(), desc)?;
            let lists = SliceListBuilder::for_dataset(desc, input.pattern)?
                .ranks(rank, n_ranks)
                .max_frames(mft, mfp)
                .fixed_length(stage.fixed_length)
                .build()?;
            inputs.push(TransferInput {
                dataset: input.dataset.clone(),
                lists,
                pattern: physical_pattern(desc, input.pattern)?,
                padding: input.padding.physical(desc.var_dim),
            });
        }

        let mut outputs = Vec::with_capacity(stage.outputs.len());
        for output in &stage.outputs {
            let desc = ctx.dataset(&output.dataset)?;
            check_stored_shape(backend.as_ref(), desc)?;
            let lists = SliceListBuilder::for_dataset(desc, output.pattern)?
                .ranks(rank, n_ranks)
                .max_frames(mft, mfp)
                .fixed_length(stage.fixed_length)
                .build()?;
            outputs.push(TransferOutput {
                dataset: output.dataset.clone(),
                lists,
                pattern: physical_pattern(desc, output.pattern)?,
                unpad: output.unpad,
            });
        }

        let n_transfers = inputs.first().map_or(0, |i| i.lists.n_transfers());
        let transfer = inputs
            .into_iter()
            .fold(
                TransferLoop::new(&stage.name, stage.processor.as_ref(), backend.as_ref()),
                |acc, input| acc.input(input),
            );
        let transfer = outputs
            .into_iter()
            .fold(transfer, |acc, output| acc.output(output))
            .max_process_frames(mfp)
            .checkpointer(ctx.checkpointer.as_ref())
            .progress(ctx.progress.as_ref());

        let outcome = transfer.run(resume)?;
        comm.barrier(&stage.tag("done"))?;

        info!(stage = %stage.name, rank = rank, outcome = ?outcome, "Stage finished");
        Ok(StageReport {
            outcome,
            n_transfers,
        })
    }
}

/// Descriptor for a stage output.
fn output_descriptor(
    stage: &Stage,
    output: &StageOutput,
    datasets: &BTreeMap<String, DatasetDescriptor>,
) -> Result<DatasetDescriptor> {
    if let Some(desc) = &output.descriptor {
        let mut desc = desc.clone();
        desc.name = output.dataset.clone();
        return Ok(desc);
    }
    let source_name = stage
        .inputs
        .first()
        .map(|i| i.dataset.as_str())
        .ok_or_else(|| SlabError::pattern_mismatch(format!("stage '{}' has no inputs", stage.name)))?;
    let source = datasets
        .get(source_name)
        .ok_or_else(|| SlabError::DatasetNotFound(source_name.to_string()))?;

    let mut desc = DatasetDescriptor::new(output.dataset.clone(), &source.shape, source.dtype);
    desc.axis_labels = source.axis_labels.clone();
    desc.patterns = source.patterns.clone();
    desc.var_dim = source.var_dim;
    desc.metadata = source.metadata.clone();
    Ok(desc)
}

fn physical_pattern(desc: &DatasetDescriptor, name: PatternName) -> Result<Pattern> {
    let pattern = desc.pattern(name)?;
    Ok(match desc.var_dim {
        Some(var) => pattern.without_dim(var),
        None => pattern.clone(),
    })
}

fn check_stored_shape(backend: &dyn StorageBackend, desc: &DatasetDescriptor) -> Result<()> {
    let stored = backend.open_dataset(&desc.name)?;
    let expected: Vec<usize> = match desc.var_dim {
        Some(var) => desc
            .storage_shape()
            .iter()
            .enumerate()
            .filter(|(d, _)| *d != var)
            .map(|(_, &s)| s)
            .collect(),
        None => desc.storage_shape().to_vec(),
    };
    if stored != expected {
        return Err(SlabError::shape_mismatch(format!(
            "dataset '{}' is stored with shape {:?}, descriptor expects {:?}",
            desc.name, stored, expected
        )));
    }
    Ok(())
}
