//! Builtin frame processors selectable from a pipeline config.

use std::sync::Arc;

use anyhow::{ensure, Result};
use ndarray::{ArrayD, Axis};
use slab_core::{FrameContext, FrameOutput, FrameProcessor};

use crate::config::ProcessorConfig;

/// Build the processor for a stage writing `outputs` datasets.
pub fn build_processor(config: &ProcessorConfig, outputs: usize) -> Arc<dyn FrameProcessor> {
    let outputs = outputs.max(1);
    match config {
        ProcessorConfig::Passthrough => Arc::new(Passthrough { outputs }),
        ProcessorConfig::Scale { factor } => Arc::new(Scale {
            factor: *factor,
            outputs,
        }),
        ProcessorConfig::BoxMean { radius } => Arc::new(BoxMean {
            radius: *radius,
            outputs,
        }),
    }
}

/// Same block once per output.
fn fan_out(block: ArrayD<f32>, outputs: usize) -> FrameOutput {
    if outputs == 1 {
        FrameOutput::Single(block)
    } else {
        FrameOutput::Many(vec![block; outputs])
    }
}

fn first_input(name: &str, inputs: Vec<ArrayD<f32>>) -> Result<ArrayD<f32>> {
    inputs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("{} received no input blocks", name))
}

/// Copies the first input.
pub struct Passthrough {
    outputs: usize,
}

impl FrameProcessor for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn process_frames(&self, _ctx: &FrameContext<'_>, inputs: Vec<ArrayD<f32>>) -> Result<FrameOutput> {
        Ok(fan_out(first_input(self.name(), inputs)?, self.outputs))
    }
}

/// Multiplies the first input by a constant.
pub struct Scale {
    factor: f32,
    outputs: usize,
}

impl FrameProcessor for Scale {
    fn name(&self) -> &str {
        "scale"
    }

    fn process_frames(&self, _ctx: &FrameContext<'_>, inputs: Vec<ArrayD<f32>>) -> Result<FrameOutput> {
        let block = first_input(self.name(), inputs)?;
        Ok(fan_out(block.mapv(|v| v * self.factor), self.outputs))
    }
}

/// Separable moving average over every axis of a frame.
///
/// Inputs arrive with a halo of `radius` on each core dimension, so the
/// interior that survives unpadding averages full windows. Windows at the
/// block boundary shrink to the available elements.
pub struct BoxMean {
    radius: usize,
    outputs: usize,
}

impl BoxMean {
    fn smooth(&self, block: &ArrayD<f32>) -> ArrayD<f32> {
        let mut current = block.clone();
        for axis in 0..block.ndim() {
            let mut next = current.clone();
            for (src, mut dst) in current
                .lanes(Axis(axis))
                .into_iter()
                .zip(next.lanes_mut(Axis(axis)))
            {
                let len = src.len();
                for i in 0..len {
                    let lo = i.saturating_sub(self.radius);
                    let hi = (i + self.radius).min(len - 1);
                    let sum: f32 = (lo..=hi).map(|j| src[j]).sum();
                    dst[i] = sum / (hi - lo + 1) as f32;
                }
            }
            current = next;
        }
        current
    }
}

impl FrameProcessor for BoxMean {
    fn name(&self) -> &str {
        "box-mean"
    }

    fn process_frames(&self, ctx: &FrameContext<'_>, inputs: Vec<ArrayD<f32>>) -> Result<FrameOutput> {
        let block = first_input(self.name(), inputs)?;
        ensure!(
            block.shape().iter().all(|&len| len > 2 * self.radius),
            "stage '{}': frame {:?} is too small for a box of radius {}",
            ctx.stage,
            block.shape(),
            self.radius
        );
        Ok(fan_out(self.smooth(&block), self.outputs))
    }
}
