//! Storage chunk planning.
//!
//! The planner picks a chunk shape for a dataset that is about to be written
//! under one pattern and read back under the next. Every core dimension and
//! the fast slice dimension of either pattern is adjustable; the other slice
//! dimensions stay at one. Starting from a per-dimension initial guess the
//! chunk is grown or shrunk one step at a time until it sits just under the
//! byte budget.
//!
//! ```text
//!              current: core / fast slice / other slice
//!  next:  core      CoreCore   CoreSlice   CoreOther
//!         fast      CoreSlice  SliceSlice  SliceOther
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::pattern::Pattern;
use crate::slicing::partition::balanced_sizes;
use crate::types::Dtype;

/// Chunk edge used for dimensions of an `Auto` plan.
const AUTO_CHUNK_EDGE: usize = 256;

/// A planned storage layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkPlan {
    /// Let the store choose.
    Auto,
    /// Explicit chunk shape. `converged` is false when the shape still
    /// exceeds the byte budget after every dimension was exhausted.
    Chunks { shape: Vec<usize>, converged: bool },
}

impl ChunkPlan {
    pub fn shape(&self) -> Option<&[usize]> {
        match self {
            Self::Auto => None,
            Self::Chunks { shape, .. } => Some(shape),
        }
    }

    /// Concrete chunk shape for a dataset of `shape`.
    pub fn chunk_shape_for(&self, shape: &[usize]) -> Vec<usize> {
        match self {
            Self::Chunks { shape: chunks, .. } if chunks.len() == shape.len() => chunks
                .iter()
                .zip(shape)
                .map(|(&c, &s)| c.clamp(1, s.max(1)))
                .collect(),
            _ => shape.iter().map(|&s| s.clamp(1, AUTO_CHUNK_EDGE)).collect(),
        }
    }
}

/// A pattern together with the number of frames read per transfer under it.
#[derive(Debug, Clone, Copy)]
pub struct PatternAccess<'a> {
    pub pattern: &'a Pattern,
    pub max_frames: usize,
}

impl<'a> PatternAccess<'a> {
    pub fn new(pattern: &'a Pattern, max_frames: usize) -> Self {
        Self {
            pattern,
            max_frames: max_frames.max(1),
        }
    }
}

/// How one step changes a chunk dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustStep {
    Add(usize),
    Sub(usize),
    Halve,
}

impl AdjustStep {
    fn apply(self, value: usize) -> usize {
        match self {
            Self::Add(n) => value + n,
            Self::Sub(n) => value.saturating_sub(n),
            Self::Halve => value.div_ceil(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    CoreCore,
    CoreSlice,
    CoreOther,
    SliceSlice,
    SliceOther,
}

#[derive(Debug, Clone, Copy)]
struct Adjustable {
    dim: usize,
    fast: bool,
    up: AdjustStep,
    down: AdjustStep,
    min: usize,
    max: usize,
}

/// Plans chunk shapes for a run with `n_ranks` participants.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    byte_budget: usize,
    volume_chunk_edge: Option<usize>,
    lustre_workaround: bool,
    n_ranks: usize,
}

impl ChunkPlanner {
    pub fn new(config: &EngineConfig, n_ranks: usize) -> Self {
        Self {
            byte_budget: config.byte_budget,
            volume_chunk_edge: config.volume_chunk_edge,
            lustre_workaround: config.lustre_workaround,
            n_ranks: n_ranks.max(1),
        }
    }

    /// Plan the chunk shape for `shape`, written under `current` and next
    /// read under `next` (or `current` again when there is no next reader).
    pub fn plan(
        &self,
        current: PatternAccess<'_>,
        next: Option<PatternAccess<'_>>,
        shape: &[usize],
        dtype: Dtype,
    ) -> Result<ChunkPlan> {
        if shape.len() < 3 || shape.contains(&0) {
            debug!(shape = ?shape, "Using store-chosen chunking");
            return Ok(ChunkPlan::Auto);
        }

        let next = next.unwrap_or(current);
        current.pattern.validate_rank(shape.len())?;
        next.pattern.validate_rank(shape.len())?;

        let mut chunks = vec![1; shape.len()];
        let mut adjust = self.adjustable_dims(current, next, shape, &mut chunks);

        let itemsize = dtype.itemsize();
        let nbytes = |c: &[usize]| c.iter().product::<usize>().saturating_mul(itemsize);
        let mut converged = true;

        if nbytes(&chunks) > self.byte_budget {
            while nbytes(&chunks) > self.byte_budget {
                prune(&mut adjust, &chunks, false);
                let Some(a) = pick(&adjust, &chunks, false) else {
                    converged = false;
                    warn!(
                        shape = ?shape,
                        chunks = ?chunks,
                        bytes = nbytes(&chunks),
                        budget = self.byte_budget,
                        "Chunk shape exceeds the byte budget with every dimension exhausted"
                    );
                    break;
                };
                chunks[a.dim] = a.down.apply(chunks[a.dim]);
            }
        } else {
            let mut candidate = chunks.clone();
            while nbytes(&candidate) <= self.byte_budget {
                chunks.clone_from(&candidate);
                prune(&mut adjust, &chunks, true);
                let Some(a) = pick(&adjust, &chunks, true) else {
                    break;
                };
                candidate[a.dim] = a.up.apply(candidate[a.dim]);
            }
        }

        if self.lustre_workaround {
            self.apply_lustre_workaround(&mut chunks, shape);
        }

        debug!(
            shape = ?shape,
            chunks = ?chunks,
            bytes = nbytes(&chunks),
            current = %current.pattern.name,
            next = %next.pattern.name,
            "Planned chunk shape"
        );

        Ok(ChunkPlan::Chunks {
            shape: chunks,
            converged,
        })
    }

    /// Initial chunk values and step parameters for every adjustable dim.
    fn adjustable_dims(
        &self,
        current: PatternAccess<'_>,
        next: PatternAccess<'_>,
        shape: &[usize],
        chunks: &mut [usize],
    ) -> Vec<Adjustable> {
        let core: BTreeSet<usize> = current
            .pattern
            .core_dims
            .iter()
            .chain(&next.pattern.core_dims)
            .copied()
            .collect();
        let fast: BTreeSet<usize> = [current.pattern.fast_dim(), next.pattern.fast_dim()]
            .into_iter()
            .flatten()
            .collect();
        let other: BTreeSet<usize> = current
            .pattern
            .slice_dims
            .iter()
            .skip(1)
            .chain(next.pattern.slice_dims.iter().skip(1))
            .copied()
            .collect();

        let volume_edge = if next.pattern.name.is_volume() {
            self.volume_chunk_edge
        } else {
            None
        };

        let mut adjust = Vec::new();
        for &dim in core.union(&fast) {
            let extent = shape[dim];
            let category = match (core.contains(&dim), fast.contains(&dim), other.contains(&dim)) {
                (true, true, _) => Category::CoreSlice,
                (true, false, true) => Category::CoreOther,
                (true, false, false) => Category::CoreCore,
                (false, _, true) => Category::SliceOther,
                (false, _, false) => Category::SliceSlice,
            };

            let (initial, up, down, max) = match category {
                Category::CoreCore => (extent, AdjustStep::Add(1), AdjustStep::Halve, extent),
                Category::CoreOther | Category::SliceOther => {
                    (1, AdjustStep::Add(1), AdjustStep::Sub(1), extent)
                }
                Category::CoreSlice | Category::SliceSlice => {
                    let frames = frames_for(dim, current, next);
                    let owner = if category == Category::CoreSlice {
                        if current.pattern.is_slice(dim) {
                            current.pattern
                        } else {
                            next.pattern
                        }
                    } else {
                        let slices = |p: &Pattern| -> usize {
                            p.slice_dims.iter().map(|&d| shape[d]).product()
                        };
                        if slices(current.pattern) < slices(next.pattern) {
                            current.pattern
                        } else {
                            next.pattern
                        }
                    };
                    let max = self.per_process_bound(owner, shape, frames).min(extent);
                    (
                        frames.min(extent),
                        AdjustStep::Add(frames),
                        AdjustStep::Halve,
                        max,
                    )
                }
            };

            let (initial, max) = match volume_edge {
                Some(edge) => (extent.min(edge), extent.min(edge)),
                None => (initial, max),
            };

            debug!(dim, ?category, initial, max, "Adjustable chunk dimension");
            chunks[dim] = initial;
            adjust.push(Adjustable {
                dim,
                fast: fast.contains(&dim),
                up,
                down,
                min: 1,
                max,
            });
        }
        adjust
    }

    /// Largest frame count a single rank reads along `pattern`'s fast dim:
    /// the median number of transfers per rank times the frames per transfer.
    fn per_process_bound(&self, pattern: &Pattern, shape: &[usize], frames: usize) -> usize {
        let Some(fast) = pattern.fast_dim() else {
            return frames;
        };
        let all_slices: usize = pattern.slice_dims.iter().map(|&d| shape[d]).product();
        let runs = all_slices.div_ceil(frames);

        let mut per_rank: Vec<usize> = balanced_sizes(runs, self.n_ranks)
            .into_iter()
            .filter(|&n| n > 0)
            .collect();
        if per_rank.is_empty() {
            return 1;
        }
        per_rank.sort_unstable();
        let mid = per_rank.len() / 2;
        let median = if per_rank.len() % 2 == 0 {
            (per_rank[mid - 1] + per_rank[mid]) / 2
        } else {
            per_rank[mid]
        };

        (median * frames).min(shape[fast]).max(1)
    }

    /// Parallel file creation on lustre needs at least one chunk per rank.
    fn apply_lustre_workaround(&self, chunks: &mut [usize], shape: &[usize]) {
        let n_chunks: usize = shape
            .iter()
            .zip(chunks.iter())
            .map(|(&s, &c)| s.div_ceil(c))
            .product();
        if n_chunks >= self.n_ranks {
            return;
        }

        let dims = 0..shape.len();
        let target = dims
            .clone()
            .find(|&d| shape[d] > chunks[d] && chunks[d] > 1)
            .or_else(|| dims.clone().find(|&d| chunks[d] > 1));

        match target {
            Some(dim) => {
                chunks[dim] = chunks[dim].div_ceil(2);
                debug!(dim, chunks = ?chunks, "Applied lustre chunk workaround");
            }
            None => warn!(
                chunks = ?chunks,
                n_ranks = self.n_ranks,
                "Lustre workaround found no splittable chunk dimension"
            ),
        }
    }
}

/// Frames per transfer along `dim`. When both patterns share the fast
/// dimension the least common multiple keeps both access sizes aligned.
fn frames_for(dim: usize, current: PatternAccess<'_>, next: PatternAccess<'_>) -> usize {
    match (current.pattern.fast_dim(), next.pattern.fast_dim()) {
        (Some(c), Some(n)) if c == n => lcm(current.max_frames, next.max_frames),
        (Some(c), _) if c == dim => current.max_frames,
        _ => next.max_frames,
    }
}

/// Drop dimensions whose next step would leave their bounds or change nothing.
fn prune(adjust: &mut Vec<Adjustable>, chunks: &[usize], grow: bool) {
    adjust.retain(|a| {
        let value = chunks[a.dim];
        if grow {
            let stepped = a.up.apply(value);
            stepped != value && stepped <= a.max
        } else {
            let stepped = a.down.apply(value);
            stepped != value && stepped >= a.min
        }
    });
}

/// Next dimension to step: fast slice dims before core dims; the smallest
/// chunk when growing, the largest when shrinking.
fn pick(adjust: &[Adjustable], chunks: &[usize], grow: bool) -> Option<Adjustable> {
    let choose = |fast: bool| {
        let group = adjust.iter().copied().filter(|a| a.fast == fast);
        if grow {
            group.min_by_key(|a| chunks[a.dim])
        } else {
            group.max_by_key(|a| chunks[a.dim])
        }
    };
    choose(true).or_else(|| choose(false))
}

pub fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return 0;
    }
    a / gcd(a, b) * b
}
