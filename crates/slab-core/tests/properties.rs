//! Property tests for partitioning, chunk planning and padding.

use std::collections::BTreeSet;

use ndarray::ArrayD;
use proptest::prelude::*;
use slab_core::{
    apply_pad, pad_read, strip_pad, ChunkPlan, ChunkPlanner, DimSlice, Dtype, EngineConfig, Pad,
    PaddingDirective, Pattern, PatternAccess, PatternName, SliceListBuilder,
};
use test_utils::ramp;

fn sinogram() -> Pattern {
    Pattern::new(PatternName::Sinogram, &[0, 2], &[1]).unwrap()
}

fn projection() -> Pattern {
    Pattern::new(PatternName::Projection, &[1, 2], &[0]).unwrap()
}

/// Frame tuple as comparable triples.
type FrameKey = Vec<(usize, usize, usize)>;

fn key(frame: &[DimSlice]) -> FrameKey {
    frame.iter().map(|s| (s.start, s.stop, s.step)).collect()
}

/// Frame keys owned by each of `n_ranks` ranks.
fn rank_frames(
    pattern: &Pattern,
    shape: &[usize],
    fixed: Option<(usize, usize)>,
    var_dim: Option<usize>,
    n_ranks: usize,
    mft: usize,
) -> Vec<Vec<FrameKey>> {
    (0..n_ranks)
        .map(|rank| {
            let mut builder = SliceListBuilder::new(pattern, shape)
                .ranks(rank, n_ranks)
                .max_frames(mft, 1)
                .var_dim(var_dim);
            if let Some((dim, value)) = fixed {
                builder = builder.fixed_dim(dim, value);
            }
            builder
                .build()
                .unwrap()
                .frame_list()
                .iter()
                .map(|f| key(f))
                .collect()
        })
        .collect()
}

/// Sorted union of every rank's frames, or `None` if a frame is owned twice.
fn union_of(per_rank: &[Vec<FrameKey>]) -> Option<Vec<FrameKey>> {
    let all: Vec<FrameKey> = per_rank.iter().flatten().cloned().collect();
    let distinct: BTreeSet<FrameKey> = all.iter().cloned().collect();
    (distinct.len() == all.len()).then(|| distinct.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_ranks_partition_frames(
        shape in prop::collection::vec(1usize..12, 3),
        n_ranks in 1usize..6,
        mft in 1usize..5,
        mfp in 1usize..3,
    ) {
        let pattern = sinogram();
        let single = SliceListBuilder::new(&pattern, &shape)
            .max_frames(mft, mfp)
            .build()
            .unwrap();
        let expected: BTreeSet<FrameKey> = single.frame_list().iter().map(|f| key(f)).collect();

        let per_rank = rank_frames(&pattern, &shape, None, None, n_ranks, mft);
        let union = union_of(&per_rank);
        prop_assert!(union.is_some(), "a frame is owned by more than one rank");
        prop_assert_eq!(union.unwrap(), expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_ranks_split_fast_dim_only(
        shape in prop::collection::vec(1usize..6, 4),
        n_ranks in 1usize..5,
        mft in 1usize..4,
        fix in prop::option::of(0usize..6),
        with_var in any::<bool>(),
    ) {
        let mut shape = shape;
        let (pattern, var_dim) = if with_var {
            shape.push(1);
            (Pattern::new(PatternName::Sinogram, &[0, 2], &[1, 3, 4]).unwrap(), Some(4))
        } else {
            (Pattern::new(PatternName::Sinogram, &[0, 2], &[1, 3]).unwrap(), None)
        };
        let fixed = fix.map(|v| (3, v % shape[3]));

        let single = rank_frames(&pattern, &shape, fixed, var_dim, 1, mft).remove(0);
        let per_rank = rank_frames(&pattern, &shape, fixed, var_dim, n_ranks, mft);

        let union = union_of(&per_rank);
        prop_assert!(union.is_some(), "a frame is owned by more than one rank");
        let mut expected = single.clone();
        expected.sort();
        prop_assert_eq!(union.unwrap(), expected);

        let outer: BTreeSet<(usize, usize, usize)> = single.iter().map(|f| f[3]).collect();
        let mut seen_fast = BTreeSet::new();
        for frames in per_rank.iter().filter(|f| !f.is_empty()) {
            prop_assert!(frames.iter().all(|f| f.len() == 4));
            // the fast dimension is split between ranks, the other slice dim is not
            let fast: BTreeSet<usize> = frames.iter().map(|f| f[1].0).collect();
            prop_assert!(fast.is_disjoint(&seen_fast));
            seen_fast.extend(fast);
            let rank_outer: BTreeSet<(usize, usize, usize)> = frames.iter().map(|f| f[3]).collect();
            prop_assert_eq!(&rank_outer, &outer);
        }

        if let Some((_, v)) = fixed {
            prop_assert!(per_rank.iter().flatten().all(|f| f[3] == (v, v + 1, 1)));
        }
    }

    #[test]
    fn prop_transfers_cover_frames(
        shape in prop::collection::vec(1usize..10, 3),
        mft in 1usize..6,
        mfp in 1usize..4,
        fixed in any::<bool>(),
    ) {
        let pattern = projection();
        let lists = SliceListBuilder::new(&pattern, &shape)
            .max_frames(mft, mfp)
            .fixed_length(fixed)
            .build()
            .unwrap();

        let mut next = 0;
        for batch in &lists.transfers {
            prop_assert_eq!(batch.first_frame, next);
            prop_assert!(batch.frames <= mft);
            prop_assert!(batch.nominal_frames >= batch.frames);
            let covered: usize = batch.process.iter().map(|p| p[0].len()).sum();
            prop_assert_eq!(covered, batch.nominal_frames);
            next += batch.frames;
        }
        prop_assert_eq!(next, lists.frame_list().len());
    }

    #[test]
    fn prop_chunks_respect_budget(
        shape in prop::collection::vec(1usize..400, 3),
        mft in 1usize..8,
        budget in 1_000usize..2_000_000,
        n_ranks in 1usize..4,
    ) {
        let config = EngineConfig {
            byte_budget: budget,
            ..EngineConfig::default()
        };
        let pattern = projection();
        let next = sinogram();
        let plan = ChunkPlanner::new(&config, n_ranks)
            .plan(
                PatternAccess::new(&pattern, mft),
                Some(PatternAccess::new(&next, 1)),
                &shape,
                Dtype::Float32,
            )
            .unwrap();

        let ChunkPlan::Chunks { shape: chunks, converged } = plan else {
            return Err(TestCaseError::fail("expected explicit chunks"));
        };
        prop_assert_eq!(chunks.len(), shape.len());
        for (c, extent) in chunks.iter().zip(&shape) {
            prop_assert!(*c >= 1 && c <= extent, "chunk {:?} for shape {:?}", chunks, shape);
        }
        let bytes = chunks.iter().product::<usize>() * Dtype::Float32.itemsize();
        prop_assert!(!converged || bytes * 2 <= budget * 3, "{} bytes for budget {}", bytes, budget);
    }

    #[test]
    fn prop_pad_strip_roundtrip(
        len in 4usize..40,
        start_frac in 0.0f64..1.0,
        width in 1usize..6,
        before in 0usize..6,
        after in 0usize..6,
    ) {
        let data = ramp(&[len, 3]);
        let start = ((len - 1) as f64 * start_frac) as usize;
        let stop = (start + width).min(len);
        let slices = [DimSlice::new(start, stop, 1), DimSlice::full(3)];
        let directive = PaddingDirective::new().pad(0, Pad::new(before, after));

        let padded = pad_read(&slices, &directive, &[len, 3]).unwrap();
        let raw: ArrayD<f32> = data
            .slice_each_axis(|ax| padded.slices[ax.axis.index()].as_ndarray())
            .to_owned();
        let block = apply_pad(raw, &padded.fill).unwrap();
        prop_assert_eq!(block.shape(), &[stop - start + before + after, 3][..]);

        let expected = data
            .slice_each_axis(|ax| slices[ax.axis.index()].as_ndarray())
            .to_owned();
        prop_assert_eq!(strip_pad(block, &directive).unwrap(), expected);
    }
}
