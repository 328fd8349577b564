//! Squeezing blocks for processing and restoring their rank afterwards.
//!
//! Processing functions see frames without the singleton slice axes of the
//! transfer block. With one frame per call every slice axis is dropped; with
//! several frames (or padded neighbours) the fast axis stays so frames can
//! be told apart. Output blocks get the dropped axes back before scatter.

use ndarray::{ArrayD, Axis};

use crate::error::{Result, SlabError};
use crate::padding::PaddingDirective;
use crate::pattern::Pattern;

/// Axes removed from a block before it is handed to processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqueezeRule {
    axes: Vec<usize>,
}

impl SqueezeRule {
    /// Rule for an input read under `pattern` (physical dimensions).
    pub fn new(
        pattern: &Pattern,
        max_process_frames: usize,
        padding: &PaddingDirective,
    ) -> Self {
        let keep_fast = pattern
            .fast_dim()
            .filter(|&fast| max_process_frames > 1 || padding.pads(fast));
        let mut axes: Vec<usize> = pattern
            .slice_dims
            .iter()
            .copied()
            .filter(|&d| Some(d) != keep_fast)
            .collect();
        axes.sort_unstable();
        Self { axes }
    }

    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    pub fn apply(&self, block: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let mut block = block;
        for &axis in self.axes.iter().rev() {
            let len = block.shape().get(axis).copied().unwrap_or(0);
            if len != 1 {
                return Err(SlabError::shape_mismatch(format!(
                    "cannot squeeze axis {} of length {} from block {:?}",
                    axis,
                    len,
                    block.shape()
                )));
            }
            block = block.index_axis_move(Axis(axis), 0);
        }
        Ok(block)
    }
}

/// Axes re-inserted into a processed block before it is scattered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandRule {
    axes: Vec<usize>,
}

impl ExpandRule {
    /// Choose the axes to restore for a block of rank `block_ndim` written
    /// under `pattern` (physical dimensions).
    ///
    /// A block with only the core axes gets every slice axis back; one with a
    /// single extra axis is taken to hold the fast dimension.
    pub fn for_block(pattern: &Pattern, block_ndim: usize) -> Result<Self> {
        let ndim = pattern.ndims();
        let n_core = pattern.core_dims.len();
        let mut axes: Vec<usize> = if block_ndim == ndim {
            Vec::new()
        } else if block_ndim == n_core {
            pattern.slice_dims.clone()
        } else if block_ndim == n_core + 1 {
            pattern.slice_dims.iter().skip(1).copied().collect()
        } else {
            return Err(SlabError::shape_mismatch(format!(
                "processed block of rank {} cannot be written under {} (rank {}, {} core dimensions)",
                block_ndim, pattern.name, ndim, n_core
            )));
        };
        axes.sort_unstable();
        Ok(Self { axes })
    }

    pub fn axes(&self) -> &[usize] {
        &self.axes
    }

    pub fn apply(&self, block: ArrayD<f32>) -> ArrayD<f32> {
        self.axes
            .iter()
            .fold(block, |acc, &axis| acc.insert_axis(Axis(axis)))
    }
}
