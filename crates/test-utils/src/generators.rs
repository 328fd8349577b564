//! Test data generators for creating synthetic N-dimensional datasets.
//!
//! These generators create predictable, verifiable arrays so that tests can
//! tell from a value alone where in the source dataset it was read from.

use ndarray::{ArrayD, Dimension, IxDyn};

/// Base used by [`encode_index`]; every index must be below it.
pub const INDEX_BASE: usize = 100;

/// Creates an array whose values are their row-major flat index.
///
/// # Example
///
/// ```
/// use test_utils::ramp;
///
/// let a = ramp(&[2, 3]);
/// assert_eq!(a[[0, 0]], 0.0);
/// assert_eq!(a[[1, 2]], 5.0);
/// ```
pub fn ramp(shape: &[usize]) -> ArrayD<f32> {
    let strides = row_major_strides(shape);
    ArrayD::from_shape_fn(IxDyn(shape), |idx| {
        idx.slice()
            .iter()
            .zip(&strides)
            .map(|(i, s)| i * s)
            .sum::<usize>() as f32
    })
}

/// Encodes an index tuple as `i0 * 100^(n-1) + ... + i_{n-1}`.
///
/// Exact in `f32` for up to three dimensions.
///
/// # Example
///
/// ```
/// use test_utils::encode_index;
///
/// assert_eq!(encode_index(&[1, 2, 3]), 10203.0);
/// ```
pub fn encode_index(index: &[usize]) -> f32 {
    index
        .iter()
        .fold(0usize, |acc, &i| acc * INDEX_BASE + i) as f32
}

/// Inverse of [`encode_index`] for an `ndim`-dimensional index.
pub fn decode_index(value: f32, ndim: usize) -> Vec<usize> {
    let mut flat = value.round() as usize;
    let mut index = vec![0; ndim];
    for slot in index.iter_mut().rev() {
        *slot = flat % INDEX_BASE;
        flat /= INDEX_BASE;
    }
    index
}

/// Creates an array whose values encode their own index (see
/// [`encode_index`]).
///
/// # Panics
///
/// Panics if any extent exceeds [`INDEX_BASE`].
pub fn index_encoded(shape: &[usize]) -> ArrayD<f32> {
    assert!(
        shape.iter().all(|&s| s <= INDEX_BASE),
        "index_encoded supports extents up to {}",
        INDEX_BASE
    );
    ArrayD::from_shape_fn(IxDyn(shape), |idx| encode_index(idx.slice()))
}

/// Creates an array filled with one value.
pub fn constant(shape: &[usize], value: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(shape), value)
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for d in (0..shape.len().saturating_sub(1)).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }
    strides
}
