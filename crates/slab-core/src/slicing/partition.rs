//! Balanced partitioning of an index range.

use std::ops::Range;

/// Sizes of `parts` near-equal pieces of `n` items.
///
/// Sizes differ by at most one and the earlier pieces take the larger share.
pub fn balanced_sizes(n: usize, parts: usize) -> Vec<usize> {
    if parts == 0 {
        return Vec::new();
    }
    let base = n / parts;
    let extra = n % parts;
    (0..parts)
        .map(|p| if p < extra { base + 1 } else { base })
        .collect()
}

/// The range of `0..n` owned by piece `part` of `parts`.
///
/// Out-of-range parts and surplus parts (more parts than items) get an empty
/// range.
pub fn balanced_split(n: usize, parts: usize, part: usize) -> Range<usize> {
    if parts == 0 || part >= parts {
        return n..n;
    }
    let base = n / parts;
    let extra = n % parts;
    let start = part * base + part.min(extra);
    let len = if part < extra { base + 1 } else { base };
    start..start + len
}
