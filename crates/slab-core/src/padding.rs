//! Halo padding around frames.
//!
//! Padding widens the region read for a frame so that processing near frame
//! edges sees real neighbours. Where the widened region runs off the data
//! the border value is repeated (edge mode). Results are cut back to the
//! unpadded extent before they are written.

use std::collections::BTreeMap;

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SlabError};
use crate::pattern::Pattern;
use crate::preview::PreviewSpec;
use crate::types::{DimSlice, SliceTuple};

/// Elements added before and after a dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pad {
    pub before: usize,
    pub after: usize,
}

impl Pad {
    pub fn new(before: usize, after: usize) -> Self {
        Self { before, after }
    }

    pub fn symmetric(n: usize) -> Self {
        Self::new(n, n)
    }

    pub fn total(&self) -> usize {
        self.before + self.after
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

/// Per-dimension padding requested by a stage for one input.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaddingDirective {
    dims: BTreeMap<usize, Pad>,
}

impl PaddingDirective {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add padding to a dimension; padding the same dimension twice
    /// accumulates.
    pub fn pad(mut self, dim: usize, pad: Pad) -> Self {
        let entry = self.dims.entry(dim).or_default();
        entry.before += pad.before;
        entry.after += pad.after;
        self
    }

    /// Pad every core dimension by `n` on both sides.
    pub fn pad_frame_edges(self, pattern: &Pattern, n: usize) -> Self {
        pattern
            .core_dims
            .iter()
            .fold(self, |acc, &dim| acc.pad(dim, Pad::symmetric(n)))
    }

    /// Add `n` neighbouring frames on both sides along the main direction,
    /// or the fast slice dimension when the pattern has none.
    pub fn pad_multi_frames(self, pattern: &Pattern, n: usize) -> Result<Self> {
        let dim = pattern.main_dir.or_else(|| pattern.fast_dim()).ok_or_else(|| {
            SlabError::invalid_padding(0, pattern.name.as_str(), "pattern has no slice dimension")
        })?;
        Ok(self.pad(dim, Pad::symmetric(n)))
    }

    pub fn get(&self, dim: usize) -> Pad {
        self.dims.get(&dim).copied().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, Pad)> + '_ {
        self.dims.iter().map(|(&d, &p)| (d, p))
    }

    pub fn is_empty(&self) -> bool {
        self.dims.values().all(Pad::is_zero)
    }

    /// Whether `dim` carries any padding.
    pub fn pads(&self, dim: usize) -> bool {
        !self.get(dim).is_zero()
    }

    /// Check that only core dimensions and the fast slice dimension are
    /// padded, and that none of them carries a chunked preview.
    pub fn validate(&self, pattern: &Pattern, preview: Option<&PreviewSpec>) -> Result<()> {
        for (dim, pad) in self.iter() {
            if pad.is_zero() {
                continue;
            }
            if !pattern.is_core(dim) && pattern.fast_dim() != Some(dim) {
                return Err(SlabError::invalid_padding(
                    dim,
                    pattern.name.as_str(),
                    "only core dimensions and the fast slice dimension can be padded",
                ));
            }
            if let Some(p) = preview.and_then(|p| p.dims.get(dim)) {
                if p.chunk > 1 {
                    return Err(SlabError::invalid_padding(
                        dim,
                        pattern.name.as_str(),
                        "dimension has a chunked preview",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Re-index for physical storage that omits the var dimension.
    pub fn physical(&self, var_dim: Option<usize>) -> Self {
        let Some(var) = var_dim else {
            return self.clone();
        };
        let dims = self
            .dims
            .iter()
            .filter(|(d, _)| **d != var)
            .map(|(&d, &p)| (if d > var { d - 1 } else { d }, p))
            .collect();
        Self { dims }
    }
}

/// Region to read plus the edge replication to apply to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedRead {
    /// In-bounds region to fetch.
    pub slices: SliceTuple,
    /// Elements to replicate on each side of the fetched block.
    pub fill: Vec<Pad>,
}

impl PaddedRead {
    pub fn needs_fill(&self) -> bool {
        self.fill.iter().any(|p| !p.is_zero())
    }
}

/// Widen `slices` by `directive` and clamp the result to `shape`.
///
/// Elements that fall outside the data, whether from padding or from a
/// slice that already runs past the end, are reported in `fill` so the
/// fetched block can be edge-padded to the full requested size.
pub fn pad_read(
    slices: &[DimSlice],
    directive: &PaddingDirective,
    shape: &[usize],
) -> Result<PaddedRead> {
    if slices.len() != shape.len() {
        return Err(SlabError::shape_mismatch(format!(
            "slice tuple of rank {} for data of rank {}",
            slices.len(),
            shape.len()
        )));
    }

    let mut out = Vec::with_capacity(slices.len());
    let mut fill = Vec::with_capacity(slices.len());

    for (dim, (s, &extent)) in slices.iter().zip(shape).enumerate() {
        let step = s.step.max(1);
        let requested = s.len();
        let valid = if s.start >= extent {
            0
        } else {
            requested.min((extent - 1 - s.start) / step + 1)
        };
        if valid == 0 {
            return Err(SlabError::shape_mismatch(format!(
                "slice {} on dimension {} selects nothing inside extent {}",
                s, dim, extent
            )));
        }
        let overrun = requested - valid;
        let last = s.start + (valid - 1) * step;

        let pad = directive.get(dim);
        let avail_before = pad.before.min(s.start / step);
        let avail_after = pad.after.min((extent - 1 - last) / step);

        out.push(DimSlice::new(
            s.start - avail_before * step,
            last + avail_after * step + 1,
            step,
        ));
        fill.push(Pad::new(
            pad.before - avail_before,
            pad.after - avail_after + overrun,
        ));
    }

    let read = PaddedRead { slices: out, fill };
    if read.needs_fill() {
        debug!(fill = ?read.fill, "Padded read extends beyond the data");
    }
    Ok(read)
}

/// Edge-pad a block by `fill` on each dimension.
pub fn apply_pad(block: ArrayD<f32>, fill: &[Pad]) -> Result<ArrayD<f32>> {
    if fill.iter().all(Pad::is_zero) {
        return Ok(block);
    }
    if fill.len() != block.ndim() {
        return Err(SlabError::shape_mismatch(format!(
            "padding for {} dimensions applied to a block of rank {}",
            fill.len(),
            block.ndim()
        )));
    }
    let src_shape = block.shape().to_vec();
    if src_shape
        .iter()
        .zip(fill)
        .any(|(&len, pad)| len == 0 && !pad.is_zero())
    {
        return Err(SlabError::shape_mismatch("cannot edge-pad an empty dimension"));
    }

    let new_shape: Vec<usize> = src_shape
        .iter()
        .zip(fill)
        .map(|(&len, pad)| len + pad.total())
        .collect();

    Ok(ArrayD::from_shape_fn(IxDyn(&new_shape), |idx| {
        let src: Vec<usize> = (0..src_shape.len())
            .map(|d| {
                idx[d]
                    .saturating_sub(fill[d].before)
                    .min(src_shape[d] - 1)
            })
            .collect();
        block[src.as_slice()]
    }))
}

/// Remove the halo added by `directive` from a block whose axes match the
/// directive's dimensions.
pub fn strip_pad(block: ArrayD<f32>, directive: &PaddingDirective) -> Result<ArrayD<f32>> {
    if directive.is_empty() {
        return Ok(block);
    }
    for (dim, pad) in directive.iter() {
        let len = block.shape().get(dim).copied().ok_or_else(|| {
            SlabError::shape_mismatch(format!(
                "padded dimension {} outside block of rank {}",
                dim,
                block.ndim()
            ))
        })?;
        if len < pad.total() {
            return Err(SlabError::shape_mismatch(format!(
                "dimension {} has length {}, smaller than its padding {}",
                dim,
                len,
                pad.total()
            )));
        }
    }

    let stripped = block.slice_each_axis(|ax| {
        let pad = directive.get(ax.axis.index());
        Slice::from(pad.before..ax.len - pad.after)
    });
    Ok(stripped.to_owned())
}

/// Drop trailing elements along `dim` appended to reach a fixed transfer
/// length, leaving `expected`.
pub fn trim_excess(block: ArrayD<f32>, dim: usize, expected: usize) -> Result<ArrayD<f32>> {
    let len = block.len_of(Axis(dim));
    if len == expected {
        return Ok(block);
    }
    if len < expected {
        return Err(SlabError::shape_mismatch(format!(
            "dimension {} has length {}, expected at least {}",
            dim, len, expected
        )));
    }
    Ok(block
        .slice_axis(Axis(dim), Slice::from(0..expected))
        .to_owned())
}

/// Widen a process slice (local to a transfer block) to cover the padding
/// of the padded block.
pub fn pad_process_slice(slices: &[DimSlice], directive: &PaddingDirective) -> SliceTuple {
    slices
        .iter()
        .enumerate()
        .map(|(dim, s)| {
            let pad = directive.get(dim);
            DimSlice::new(s.start, s.stop + pad.total(), s.step)
        })
        .collect()
}
