//! The transfer loop.
//!
//! For each transfer batch of a stage:
//!
//! ```text
//!   FETCH      read every input's padded hyperslab, edge-fill what lies
//!              outside the data, gather chunked-preview frames
//!   INVOKE     per process sub-batch: squeeze, call the processor
//!   SCATTER    expand each result, strip padding, place it in the
//!              output's batch buffer
//!   TRIM       drop frames appended for fixed-length batches
//!   WRITE      store the buffer, report progress
//! ```
//!
//! Every input and output of a stage must produce the same number of
//! transfer batches and process sub-batches; they advance in lock step.

pub mod processor;
pub mod reshape;

pub use processor::{FnProcessor, FrameContext, FrameOutput, FrameProcessor};
pub use reshape::{ExpandRule, SqueezeRule};

use ndarray::{ArrayD, Axis, IxDyn};
use tracing::{debug, info};

use crate::backend::StorageBackend;
use crate::checkpoint::Checkpointer;
use crate::error::{Result, SlabError};
use crate::padding::{apply_pad, pad_process_slice, pad_read, strip_pad, trim_excess, Pad, PaddingDirective};
use crate::pattern::Pattern;
use crate::progress::ProgressReporter;
use crate::slicing::{SliceLists, TransferBatch};
use crate::types::{tuple_shape, DimSlice, SliceTuple};

/// Position to resume a stage from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResumePoint {
    pub transfer_idx: usize,
    pub process_idx: usize,
}

impl ResumePoint {
    pub fn new(transfer_idx: usize, process_idx: usize) -> Self {
        Self {
            transfer_idx,
            process_idx,
        }
    }
}

/// How a run of the transfer loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// Every batch was written. `frames` counts frames processed by this call.
    Completed { frames: usize },
    /// Stopped for a checkpoint before `transfer_idx`.
    Killed {
        transfer_idx: usize,
        process_idx: usize,
    },
}

impl LoopOutcome {
    pub fn is_killed(&self) -> bool {
        matches!(self, Self::Killed { .. })
    }
}

/// A dataset read by the stage. Pattern, padding and slice lists are all in
/// physical (var-free) dimensions.
#[derive(Debug, Clone)]
pub struct TransferInput {
    pub dataset: String,
    pub lists: SliceLists,
    pub pattern: Pattern,
    pub padding: PaddingDirective,
}

/// A dataset written by the stage.
#[derive(Debug, Clone)]
pub struct TransferOutput {
    pub dataset: String,
    pub lists: SliceLists,
    pub pattern: Pattern,
    /// Strip the first input's padding from results that still carry it.
    pub unpad: bool,
}

/// Drives one stage's batches for one rank.
pub struct TransferLoop<'a> {
    stage: &'a str,
    processor: &'a dyn FrameProcessor,
    backend: &'a dyn StorageBackend,
    checkpointer: Option<&'a dyn Checkpointer>,
    progress: Option<&'a dyn ProgressReporter>,
    max_process_frames: usize,
    inputs: Vec<TransferInput>,
    outputs: Vec<TransferOutput>,
}

impl<'a> TransferLoop<'a> {
    pub fn new(
        stage: &'a str,
        processor: &'a dyn FrameProcessor,
        backend: &'a dyn StorageBackend,
    ) -> Self {
        Self {
            stage,
            processor,
            backend,
            checkpointer: None,
            progress: None,
            max_process_frames: 1,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, input: TransferInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn output(mut self, output: TransferOutput) -> Self {
        self.outputs.push(output);
        self
    }

    pub fn max_process_frames(mut self, frames: usize) -> Self {
        self.max_process_frames = frames.max(1);
        self
    }

    pub fn checkpointer(mut self, checkpointer: &'a dyn Checkpointer) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    pub fn progress(mut self, progress: &'a dyn ProgressReporter) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run every batch from `resume` (or the start) to the end.
    ///
    /// `resume.process_idx` applies only to the first batch run; the output
    /// buffer of that batch is pre-filled from the store so sub-batches
    /// written before the checkpoint survive.
    pub fn run(&self, resume: Option<ResumePoint>) -> Result<LoopOutcome> {
        let n_transfers = self.check_alignment()?;
        let resume = resume.unwrap_or_default();
        let squeeze: Vec<SqueezeRule> = self
            .inputs
            .iter()
            .map(|i| SqueezeRule::new(&i.pattern, self.max_process_frames, &i.padding))
            .collect();

        info!(
            stage = self.stage,
            processor = self.processor.name(),
            transfers = n_transfers,
            resume_transfer = resume.transfer_idx,
            resume_process = resume.process_idx,
            "Starting transfer loop"
        );

        let mut frames = 0;
        for t in resume.transfer_idx..n_transfers {
            let first = t == resume.transfer_idx;
            if !first {
                if let Some(checkpointer) = self.checkpointer {
                    if checkpointer.is_time_to_checkpoint() {
                        checkpointer.write_checkpoint(t, 0)?;
                        info!(stage = self.stage, transfer = t, "Stopping for checkpoint");
                        return Ok(LoopOutcome::Killed {
                            transfer_idx: t,
                            process_idx: 0,
                        });
                    }
                }
            }

            let start_p = if first { resume.process_idx } else { 0 };
            frames += self.run_transfer(t, start_p, &squeeze)?;

            if let Some(progress) = self.progress {
                progress.report_progress(self.stage, (t + 1) as f32 * 100.0 / n_transfers as f32);
            }
        }

        Ok(LoopOutcome::Completed { frames })
    }

    /// Number of transfer batches, after checking every dataset agrees.
    fn check_alignment(&self) -> Result<usize> {
        let driver = self.inputs.first().ok_or_else(|| {
            SlabError::pattern_mismatch(format!("stage '{}' has no inputs", self.stage))
        })?;
        let n_transfers = driver.lists.n_transfers();

        let others = self
            .inputs
            .iter()
            .skip(1)
            .map(|i| (&i.dataset, &i.lists))
            .chain(self.outputs.iter().map(|o| (&o.dataset, &o.lists)));
        for (dataset, lists) in others {
            if lists.n_transfers() != n_transfers {
                return Err(SlabError::pattern_mismatch(format!(
                    "stage '{}': '{}' has {} transfer batches, '{}' has {}",
                    self.stage,
                    dataset,
                    lists.n_transfers(),
                    driver.dataset,
                    n_transfers
                )));
            }
            let aligned = lists
                .transfers
                .iter()
                .zip(&driver.lists.transfers)
                .all(|(a, b)| a.process.len() == b.process.len());
            if !aligned {
                return Err(SlabError::pattern_mismatch(format!(
                    "stage '{}': '{}' and '{}' split batches into different process counts",
                    self.stage, dataset, driver.dataset
                )));
            }
        }

        for output in &self.outputs {
            if output.lists.transfers.iter().any(|t| t.gather.is_some()) {
                return Err(SlabError::pattern_mismatch(format!(
                    "stage '{}': output '{}' cannot be written through a chunked preview",
                    self.stage, output.dataset
                )));
            }
        }
        Ok(n_transfers)
    }

    fn run_transfer(&self, t: usize, start_p: usize, squeeze: &[SqueezeRule]) -> Result<usize> {
        let blocks = self
            .inputs
            .iter()
            .map(|input| self.fetch(input, t))
            .collect::<Result<Vec<_>>>()?;
        let mut buffers = self
            .outputs
            .iter()
            .map(|output| self.output_buffer(output, t, start_p > 0))
            .collect::<Result<Vec<_>>>()?;

        let driver = &self.inputs[0];
        let batch = &driver.lists.transfers[t];
        let mut frames = 0;

        for p in start_p..batch.process.len() {
            let mut args = Vec::with_capacity(self.inputs.len());
            for ((input, block), rule) in self.inputs.iter().zip(&blocks).zip(squeeze) {
                let local = pad_process_slice(&input.lists.transfers[t].process[p], &input.padding);
                let view = block
                    .slice_each_axis(|ax| local[ax.axis.index()].as_ndarray())
                    .to_owned();
                args.push(rule.apply(view)?);
            }

            let range = batch.process_frames(p);
            let ctx = FrameContext {
                stage: self.stage,
                transfer_idx: t,
                process_idx: p,
                frames: &driver.lists.frames[range.clone()],
            };
            let results = self
                .processor
                .process_frames(&ctx, args)
                .map_err(|source| SlabError::FrameProcessing {
                    stage: self.stage.to_string(),
                    source,
                })?
                .into_vec();
            if results.len() != self.outputs.len() {
                return Err(SlabError::shape_mismatch(format!(
                    "processor '{}' returned {} blocks for {} outputs",
                    self.processor.name(),
                    results.len(),
                    self.outputs.len()
                )));
            }

            for ((output, buffer), result) in self.outputs.iter().zip(buffers.iter_mut()).zip(results) {
                let local = &output.lists.transfers[t].process[p];
                let block = self.restore(output, result, local)?;
                buffer
                    .slice_each_axis_mut(|ax| local[ax.axis.index()].as_ndarray())
                    .assign(&block);
            }
            frames += range.len();
        }

        for (output, buffer) in self.outputs.iter().zip(buffers) {
            self.write_back(output, t, buffer)?;
        }

        debug!(stage = self.stage, transfer = t, frames = frames, "Transfer batch complete");
        Ok(frames)
    }

    /// Read an input's block for batch `t`, padded and at nominal length.
    fn fetch(&self, input: &TransferInput, t: usize) -> Result<ArrayD<f32>> {
        let batch = &input.lists.transfers[t];
        let mut slices = batch.slices.clone();
        let excess = batch.excess();
        let mut gathered_excess = 0;

        if let Some(fast) = batch.fast_dim.filter(|_| excess > 0) {
            if batch.gather.is_some() {
                gathered_excess = excess;
            } else {
                let s = slices[fast];
                let stop = s.start + (batch.nominal_frames - 1) * s.step + 1;
                slices[fast] = DimSlice::new(s.start, stop, s.step);
            }
        }

        let read = pad_read(&slices, &input.padding, &input.lists.shape)?;
        let raw = self.backend.read(&input.dataset, &read.slices)?;
        let mut block = apply_pad(raw, &read.fill)?;

        if let (Some(fast), Some(gather)) = (batch.fast_dim, &batch.gather) {
            block = block.select(Axis(fast), gather);
            if gathered_excess > 0 {
                block = apply_pad(block, &fast_fill(batch, fast, gathered_excess))?;
            }
        }
        Ok(block)
    }

    /// Accumulation buffer for an output's batch `t`.
    fn output_buffer(&self, output: &TransferOutput, t: usize, prefill: bool) -> Result<ArrayD<f32>> {
        let batch = &output.lists.transfers[t];
        if !prefill {
            return Ok(ArrayD::zeros(IxDyn(&batch.block_shape())));
        }
        let stored = self.backend.read(&output.dataset, &batch.slices)?;
        match batch.fast_dim {
            Some(fast) if batch.excess() > 0 => apply_pad(stored, &fast_fill(batch, fast, batch.excess())),
            _ => Ok(stored),
        }
    }

    /// Bring a processed block back to the shape of its process slice.
    fn restore(&self, output: &TransferOutput, result: ArrayD<f32>, local: &SliceTuple) -> Result<ArrayD<f32>> {
        let expand = ExpandRule::for_block(&output.pattern, result.ndim())?;
        let mut block = expand.apply(result);
        let expected = tuple_shape(local);

        if block.shape() != expected.as_slice() && output.unpad {
            block = strip_pad(block, &self.inputs[0].padding)?;
        }
        if block.shape() != expected.as_slice() {
            return Err(SlabError::shape_mismatch(format!(
                "processor '{}' produced {:?} for output '{}', expected {:?}",
                self.processor.name(),
                block.shape(),
                output.dataset,
                expected
            )));
        }
        Ok(block)
    }

    fn write_back(&self, output: &TransferOutput, t: usize, buffer: ArrayD<f32>) -> Result<()> {
        let batch = &output.lists.transfers[t];
        let block = match batch.fast_dim {
            Some(fast) if batch.excess() > 0 => trim_excess(buffer, fast, batch.frames)?,
            _ => buffer,
        };
        self.backend.write(&output.dataset, &batch.slices, block.view())
    }
}

/// Edge fill of `excess` trailing frames along the fast dimension.
fn fast_fill(batch: &TransferBatch, fast: usize, excess: usize) -> Vec<Pad> {
    let mut fill = vec![Pad::default(); batch.slices.len()];
    fill[fast] = Pad::new(0, excess);
    fill
}
