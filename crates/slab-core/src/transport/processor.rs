//! The per-frame processing seam.

use ndarray::ArrayD;

use crate::types::SliceTuple;

/// Where a processing call sits in the stage.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub stage: &'a str,
    pub transfer_idx: usize,
    pub process_idx: usize,
    /// Global slices of the frames in this call, from the first input.
    pub frames: &'a [SliceTuple],
}

/// Result of one processing call.
#[derive(Debug, Clone)]
pub enum FrameOutput {
    Single(ArrayD<f32>),
    Many(Vec<ArrayD<f32>>),
}

impl FrameOutput {
    pub fn into_vec(self) -> Vec<ArrayD<f32>> {
        match self {
            Self::Single(block) => vec![block],
            Self::Many(blocks) => blocks,
        }
    }
}

impl From<ArrayD<f32>> for FrameOutput {
    fn from(block: ArrayD<f32>) -> Self {
        Self::Single(block)
    }
}

impl From<Vec<ArrayD<f32>>> for FrameOutput {
    fn from(blocks: Vec<ArrayD<f32>>) -> Self {
        Self::Many(blocks)
    }
}

/// Function applied to each process sub-batch of a stage.
///
/// Receives one squeezed block per input and returns one block per output.
/// Errors abort the stage.
pub trait FrameProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn process_frames(
        &self,
        ctx: &FrameContext<'_>,
        inputs: Vec<ArrayD<f32>>,
    ) -> anyhow::Result<FrameOutput>;
}

/// Adapts a closure into a [`FrameProcessor`].
pub struct FnProcessor<F> {
    name: String,
    f: F,
}

impl<F> FnProcessor<F>
where
    F: Fn(&FrameContext<'_>, Vec<ArrayD<f32>>) -> anyhow::Result<FrameOutput> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> FrameProcessor for FnProcessor<F>
where
    F: Fn(&FrameContext<'_>, Vec<ArrayD<f32>>) -> anyhow::Result<FrameOutput> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn process_frames(
        &self,
        ctx: &FrameContext<'_>,
        inputs: Vec<ArrayD<f32>>,
    ) -> anyhow::Result<FrameOutput> {
        (self.f)(ctx, inputs)
    }
}
