//! Slice-list construction.
//!
//! For one dataset read under one pattern, the builder enumerates every frame
//! (one index per slice dimension, whole core dimensions), keeps the frames
//! owned by this rank, and groups them into transfer batches and process
//! sub-batches:
//!
//! ```text
//!   fast dim positions   0 1 2 3 | 4 5 6 7        (rank 0 | rank 1)
//!   transfer batches     [0 1] [2 3]               max_transfer_frames = 2
//!   process batches      [0] [1] [2] [3]           max_process_frames  = 1
//! ```
//!
//! Ranks split the fast slice dimension; every combination of the remaining
//! slice dimensions is visited by every rank. Transfer batches therefore only
//! ever extend along the fast dimension and are always a single hyperslab.

pub mod partition;

use std::collections::BTreeMap;

use tracing::debug;

use crate::dataset::DatasetDescriptor;
use crate::error::{Result, SlabError};
use crate::pattern::{Pattern, PatternName};
use crate::preview::{DimPreview, PreviewSpec};
use crate::types::{tuple_shape, DimSlice, SliceTuple};

use partition::balanced_split;

/// One read from the backing store and the processing calls it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferBatch {
    /// Global bounding hyperslab, in storage coordinates.
    pub slices: SliceTuple,
    /// Positions to select along the fast dimension of the bounding block,
    /// present when a chunked preview repeats indices.
    pub gather: Option<Vec<usize>>,
    /// Physical index of the fast dimension.
    pub fast_dim: Option<usize>,
    /// Offset of this batch's first frame in the rank's frame list.
    pub first_frame: usize,
    /// Frames actually covered.
    pub frames: usize,
    /// Frames handed to processing; exceeds `frames` for a short final
    /// batch when fixed-length transfers are requested.
    pub nominal_frames: usize,
    /// Process sub-batches, in coordinates local to the nominal block.
    pub process: Vec<SliceTuple>,
}

impl TransferBatch {
    /// Shape of the block handed to processing, before squeezing.
    pub fn block_shape(&self) -> Vec<usize> {
        let mut shape = tuple_shape(&self.slices);
        if let Some(fast) = self.fast_dim {
            shape[fast] = self.nominal_frames;
        }
        shape
    }

    /// Frames beyond the data appended to reach the nominal length.
    pub fn excess(&self) -> usize {
        self.nominal_frames - self.frames
    }

    /// Global frame range covered by process sub-batch `idx`, clipped to the
    /// frames that exist.
    pub fn process_frames(&self, idx: usize) -> std::ops::Range<usize> {
        let Some(fast) = self.fast_dim else {
            return self.first_frame..self.first_frame + self.frames;
        };
        let local = &self.process[idx][fast];
        let start = local.start.min(self.frames);
        let stop = local.stop.min(self.frames);
        self.first_frame + start..self.first_frame + stop
    }
}

/// The three levels of slicing for one rank.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SliceLists {
    /// This rank's frames in processing order.
    pub frames: Vec<SliceTuple>,
    pub transfers: Vec<TransferBatch>,
    /// Physical index of the fast dimension.
    pub fast_dim: Option<usize>,
    /// Physical storage shape.
    pub shape: Vec<usize>,
}

impl SliceLists {
    pub fn transfer_list(&self) -> Vec<SliceTuple> {
        self.transfers.iter().map(|t| t.slices.clone()).collect()
    }

    /// Process slices of every transfer, flattened in order.
    pub fn process_list(&self) -> Vec<SliceTuple> {
        self.transfers
            .iter()
            .flat_map(|t| t.process.iter().cloned())
            .collect()
    }

    pub fn frame_list(&self) -> &[SliceTuple] {
        &self.frames
    }

    pub fn n_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Whether this rank has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

/// Builds [`SliceLists`] for one dataset, pattern and rank.
#[derive(Debug, Clone)]
pub struct SliceListBuilder<'a> {
    pattern: &'a Pattern,
    shape: &'a [usize],
    preview: Option<&'a PreviewSpec>,
    fixed_dims: BTreeMap<usize, usize>,
    var_dim: Option<usize>,
    rank: usize,
    n_ranks: usize,
    max_transfer_frames: usize,
    max_process_frames: usize,
    fixed_length: bool,
}

impl<'a> SliceListBuilder<'a> {
    /// Builder over the stored `shape` (var dimension included).
    pub fn new(pattern: &'a Pattern, shape: &'a [usize]) -> Self {
        Self {
            pattern,
            shape,
            preview: None,
            fixed_dims: BTreeMap::new(),
            var_dim: None,
            rank: 0,
            n_ranks: 1,
            max_transfer_frames: 1,
            max_process_frames: 1,
            fixed_length: false,
        }
    }

    /// Builder for a dataset read under pattern `name`.
    pub fn for_dataset(dataset: &'a DatasetDescriptor, name: PatternName) -> Result<Self> {
        let mut builder = Self::new(dataset.pattern(name)?, dataset.storage_shape());
        builder.preview = dataset.preview.as_ref();
        builder.var_dim = dataset.var_dim;
        Ok(builder)
    }

    pub fn preview(mut self, preview: &'a PreviewSpec) -> Self {
        self.preview = Some(preview);
        self
    }

    /// Hold `dim` at a single index instead of iterating it.
    pub fn fixed_dim(mut self, dim: usize, value: usize) -> Self {
        self.fixed_dims.insert(dim, value);
        self
    }

    pub fn var_dim(mut self, dim: Option<usize>) -> Self {
        self.var_dim = dim;
        self
    }

    pub fn ranks(mut self, rank: usize, n_ranks: usize) -> Self {
        self.rank = rank;
        self.n_ranks = n_ranks.max(1);
        self
    }

    pub fn max_frames(mut self, transfer: usize, process: usize) -> Self {
        self.max_transfer_frames = transfer.max(1);
        self.max_process_frames = process.max(1);
        self
    }

    /// Extend a short final transfer to `max_transfer_frames`.
    pub fn fixed_length(mut self, fixed: bool) -> Self {
        self.fixed_length = fixed;
        self
    }

    pub fn build(&self) -> Result<SliceLists> {
        let rank = self.shape.len();
        self.pattern.validate_rank(rank)?;

        let identity;
        let preview = match self.preview {
            Some(p) => p,
            None => {
                identity = PreviewSpec::identity(self.shape);
                &identity
            }
        };
        if preview.dims.len() != rank {
            return Err(SlabError::preview(
                preview.dims.len().min(rank),
                format!("preview has {} dimensions, data has {}", preview.dims.len(), rank),
            ));
        }
        for (&dim, &value) in &self.fixed_dims {
            if dim >= rank || value >= self.shape[dim] {
                return Err(SlabError::shape_mismatch(format!(
                    "fixed index {} on dimension {} is outside shape {:?}",
                    value, dim, self.shape
                )));
            }
        }

        let iter_dims: Vec<usize> = self
            .pattern
            .slice_dims
            .iter()
            .copied()
            .filter(|d| !self.fixed_dims.contains_key(d))
            .collect();
        if let (Some(var), Some(&fast)) = (self.var_dim, iter_dims.first()) {
            if var == fast {
                return Err(SlabError::pattern_mismatch(format!(
                    "pattern {} iterates the var dimension {} fastest",
                    self.pattern.name, var
                )));
            }
        }

        let mut base: SliceTuple = (0..rank).map(|d| DimSlice::full(self.shape[d])).collect();
        for &dim in &self.pattern.core_dims {
            base[dim] = core_slice(dim, &preview.dims[dim])?;
        }
        for (&dim, &value) in &self.fixed_dims {
            base[dim] = DimSlice::index(value);
        }

        let indices: Vec<Vec<usize>> = iter_dims
            .iter()
            .map(|&d| preview.dims[d].indices())
            .collect();
        let fast_len = indices.first().map_or(1, Vec::len);
        let owned = balanced_split(fast_len, self.n_ranks, self.rank);
        let other_lens: Vec<usize> = indices.iter().skip(1).map(Vec::len).collect();

        let fast_dim = iter_dims
            .first()
            .map(|&d| physical_dim(d, self.var_dim));
        let fast_step = iter_dims.first().map_or(1, |&d| preview.dims[d].step);
        let fast_chunked = iter_dims.first().is_some_and(|&d| preview.dims[d].chunk > 1);

        let mut frames = Vec::new();
        let mut transfers = Vec::new();
        let positions: Vec<usize> = owned.collect();

        for combo in combinations(&other_lens) {
            let mut outer = base.clone();
            for (j, &p) in combo.iter().enumerate() {
                let dim = iter_dims[j + 1];
                outer[dim] = DimSlice::index(indices[j + 1][p]);
            }

            for group in positions.chunks(self.max_transfer_frames) {
                let first_frame = frames.len();
                let mut slices = outer.clone();
                let mut gather = None;

                if let Some(&fast) = iter_dims.first() {
                    let idx: Vec<usize> = group.iter().map(|&p| indices[0][p]).collect();
                    for &i in &idx {
                        let mut frame = outer.clone();
                        frame[fast] = DimSlice::index(i);
                        frames.push(drop_var(frame, self.var_dim));
                    }

                    if fast_chunked {
                        let lo = idx.iter().copied().min().unwrap_or(0);
                        let hi = idx.iter().copied().max().unwrap_or(0);
                        slices[fast] = DimSlice::new(lo, hi + 1, 1);
                        gather = Some(idx.iter().map(|&i| i - lo).collect());
                    } else {
                        let lo = idx[0];
                        let hi = idx[idx.len() - 1];
                        slices[fast] = DimSlice::new(lo, hi + 1, fast_step);
                    }
                } else {
                    frames.push(drop_var(outer.clone(), self.var_dim));
                }

                let n = group.len();
                let nominal = if self.fixed_length {
                    self.max_transfer_frames.max(n)
                } else {
                    n
                };

                let mut batch = TransferBatch {
                    slices: drop_var(slices, self.var_dim),
                    gather,
                    fast_dim,
                    first_frame,
                    frames: n,
                    nominal_frames: nominal,
                    process: Vec::new(),
                };
                batch.process = self.process_slices(&batch);
                transfers.push(batch);
            }
        }

        let lists = SliceLists {
            frames,
            transfers,
            fast_dim,
            shape: drop_var_shape(self.shape, self.var_dim),
        };

        debug!(
            pattern = %self.pattern.name,
            rank = self.rank,
            n_ranks = self.n_ranks,
            frames = lists.frames.len(),
            transfers = lists.transfers.len(),
            processes = lists.transfers.iter().map(|t| t.process.len()).sum::<usize>(),
            "Built slice lists"
        );

        Ok(lists)
    }

    /// Split a batch's nominal block along the fast dim into process slices.
    fn process_slices(&self, batch: &TransferBatch) -> Vec<SliceTuple> {
        let block = batch.block_shape();
        let full: SliceTuple = block.iter().map(|&len| DimSlice::full(len)).collect();
        let Some(fast) = batch.fast_dim else {
            return vec![full];
        };

        (0..batch.nominal_frames)
            .step_by(self.max_process_frames)
            .map(|start| {
                let stop = (start + self.max_process_frames).min(batch.nominal_frames);
                let mut slices = full.clone();
                slices[fast] = DimSlice::new(start, stop, 1);
                slices
            })
            .collect()
    }
}

/// Slice for a core dimension. A chunked preview on a core dimension must
/// select a single index, which is widened into a centred window.
fn core_slice(dim: usize, preview: &DimPreview) -> Result<DimSlice> {
    if preview.chunk <= 1 {
        return Ok(DimSlice::new(preview.start, preview.stop, preview.step));
    }
    if preview.stop - preview.start != 1 {
        return Err(SlabError::preview(
            dim,
            "a core dimension does not support multiple chunks",
        ));
    }
    let half = preview.chunk / 2;
    let start = preview.start.checked_sub(half).ok_or_else(|| {
        SlabError::preview(dim, "cannot have a negative value in the slice list")
    })?;
    Ok(DimSlice::new(start, preview.start + preview.chunk - half, 1))
}

/// Every combination of positions for dimensions of the given lengths, the
/// first dimension varying fastest.
fn combinations(lens: &[usize]) -> Vec<Vec<usize>> {
    let total: usize = lens.iter().product();
    (0..total)
        .map(|mut flat| {
            lens.iter()
                .map(|&len| {
                    let p = flat % len;
                    flat /= len;
                    p
                })
                .collect()
        })
        .collect()
}

fn physical_dim(dim: usize, var_dim: Option<usize>) -> usize {
    match var_dim {
        Some(var) if var < dim => dim - 1,
        _ => dim,
    }
}

fn drop_var(mut tuple: SliceTuple, var_dim: Option<usize>) -> SliceTuple {
    if let Some(var) = var_dim {
        tuple.remove(var);
    }
    tuple
}

fn drop_var_shape(shape: &[usize], var_dim: Option<usize>) -> Vec<usize> {
    shape
        .iter()
        .enumerate()
        .filter(|(d, _)| Some(*d) != var_dim)
        .map(|(_, &s)| s)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preview;

    fn sinogram() -> Pattern {
        Pattern::new(PatternName::Sinogram, &[0, 2], &[1]).unwrap()
    }

    #[test]
    fn test_two_rank_split() {
        let sino = sinogram();
        let shape = [16, 4, 4];
        let lists: Vec<SliceLists> = (0..2)
            .map(|r| {
                SliceListBuilder::new(&sino, &shape)
                    .ranks(r, 2)
                    .max_frames(2, 1)
                    .build()
                    .unwrap()
            })
            .collect();

        assert_eq!(lists[0].frames[0][1], DimSlice::index(0));
        assert_eq!(lists[0].frames[1][1], DimSlice::index(1));
        assert_eq!(lists[1].frames[0][1], DimSlice::index(2));

        for l in &lists {
            assert_eq!(l.n_transfers(), 1);
            assert_eq!(l.transfers[0].frames, 2);
            assert_eq!(l.transfers[0].process.len(), 2);
            assert_eq!(l.transfers[0].slices[0], DimSlice::full(16));
        }
        assert_eq!(lists[1].transfers[0].slices[1], DimSlice::new(2, 4, 1));
        assert_eq!(lists[1].transfers[0].process[1][1], DimSlice::new(1, 2, 1));
    }

    #[test]
    fn test_more_ranks_than_frames() {
        let sino = sinogram();
        let shape = [4, 2, 4];
        let lists = SliceListBuilder::new(&sino, &shape)
            .ranks(3, 4)
            .build()
            .unwrap();
        assert!(lists.is_empty());
        assert!(lists.frames.is_empty());
    }

    #[test]
    fn test_second_slice_dim_is_outer_loop() {
        let p = Pattern::new(PatternName::Projection, &[2], &[0, 1]).unwrap();
        let shape = [3, 2, 5];
        let lists = SliceListBuilder::new(&p, &shape)
            .max_frames(2, 2)
            .build()
            .unwrap();

        let fast: Vec<usize> = lists.frames.iter().map(|f| f[0].start).collect();
        let slow: Vec<usize> = lists.frames.iter().map(|f| f[1].start).collect();
        assert_eq!(fast, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(slow, vec![0, 0, 0, 1, 1, 1]);

        let sizes: Vec<usize> = lists.transfers.iter().map(|t| t.frames).collect();
        assert_eq!(sizes, vec![2, 1, 2, 1]);
    }

    #[test]
    fn test_fixed_length_final_batch() {
        let sino = sinogram();
        let shape = [8, 5, 8];
        let lists = SliceListBuilder::new(&sino, &shape)
            .max_frames(2, 1)
            .fixed_length(true)
            .build()
            .unwrap();
        let last = lists.transfers.last().unwrap();
        assert_eq!(last.frames, 1);
        assert_eq!(last.nominal_frames, 2);
        assert_eq!(last.excess(), 1);
        assert_eq!(last.block_shape(), vec![8, 2, 8]);
        assert_eq!(last.process.len(), 2);
        assert_eq!(last.process_frames(1), 5..5);
    }

    #[test]
    fn test_previewed_slice_dim_with_step() {
        let sino = sinogram();
        let shape = [10, 20, 10];
        let spec = preview::resolve(&[":", "2:12:2", ":"], &shape).unwrap();
        let lists = SliceListBuilder::new(&sino, &shape)
            .preview(&spec)
            .max_frames(5, 1)
            .build()
            .unwrap();
        assert_eq!(lists.frames.len(), 5);
        assert_eq!(lists.transfers[0].slices[1], DimSlice::new(2, 11, 2));
        assert_eq!(lists.transfers[0].slices[1].len(), 5);
    }

    #[test]
    fn test_chunked_fast_dim_gathers() {
        let sino = sinogram();
        let shape = [4, 10, 4];
        let spec = preview::resolve(&[":", "2:4:1:3", ":"], &shape).unwrap();
        let lists = SliceListBuilder::new(&sino, &shape)
            .preview(&spec)
            .max_frames(6, 3)
            .build()
            .unwrap();
        let batch = &lists.transfers[0];
        assert_eq!(batch.slices[1], DimSlice::new(1, 5, 1));
        assert_eq!(batch.gather, Some(vec![0, 1, 2, 1, 2, 3]));
        assert_eq!(batch.process.len(), 2);
    }

    #[test]
    fn test_chunked_core_dim() {
        let sino = sinogram();
        let shape = [10, 4, 10];
        let spec = preview::resolve(&["5:6:1:3", ":", ":"], &shape).unwrap();
        let lists = SliceListBuilder::new(&sino, &shape).preview(&spec).build().unwrap();
        assert_eq!(lists.frames[0][0], DimSlice::new(4, 7, 1));

        let bad = preview::resolve(&["4:6:1:3", ":", ":"], &shape).unwrap();
        assert!(SliceListBuilder::new(&sino, &shape).preview(&bad).build().is_err());
    }

    #[test]
    fn test_var_dim_dropped() {
        let p = Pattern::new(PatternName::Sinogram, &[0, 2], &[1, 3]).unwrap();
        let shape = [6, 3, 6, 1];
        let lists = SliceListBuilder::new(&p, &shape)
            .var_dim(Some(3))
            .build()
            .unwrap();
        assert_eq!(lists.shape, vec![6, 3, 6]);
        assert!(lists.frames.iter().all(|f| f.len() == 3));
        assert_eq!(lists.fast_dim, Some(1));
    }

    #[test]
    fn test_fixed_dim() {
        let p = Pattern::new(PatternName::Projection, &[2], &[0, 1]).unwrap();
        let shape = [3, 4, 5];
        let lists = SliceListBuilder::new(&p, &shape)
            .fixed_dim(1, 2)
            .build()
            .unwrap();
        assert_eq!(lists.frames.len(), 3);
        assert!(lists.frames.iter().all(|f| f[1] == DimSlice::index(2)));
        assert!(SliceListBuilder::new(&p, &shape).fixed_dim(1, 9).build().is_err());
    }
}
