//! Shared test utilities for the nd-slab workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Array generators with values that encode their own position
//! - Common dataset shapes, pattern layouts and preview strings
//! - Scratch directories for on-disk stores
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{index_encoded, fixtures::shapes};
//! ```

pub mod fixtures;
pub mod generators;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use generators::*;

/// Macro for approximate floating-point equality assertions.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(1.0001_f64, 1.0_f64, 0.001_f64); // passes
/// assert_approx_eq!(1.1_f32, 1.0_f32, 0.001_f32);    // fails
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Macro asserting two arrays have the same shape and element-wise
/// approximately equal values.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_arrays_approx_eq;
///
/// assert_arrays_approx_eq!(result, expected, 1e-6);
/// ```
#[macro_export]
macro_rules! assert_arrays_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left = &$left;
        let right = &$right;
        assert_eq!(left.shape(), right.shape(), "array shapes differ");
        for (a, b) in left.iter().zip(right.iter()) {
            $crate::assert_approx_eq!(*a, *b, $epsilon);
        }
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assert_approx_eq_passes() {
        assert_approx_eq!(1.0001, 1.0, 0.001);
        assert_approx_eq!(0.0, 0.0, 0.0001);
        assert_approx_eq!(-5.5, -5.500001, 0.0001);
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn test_assert_approx_eq_fails() {
        assert_approx_eq!(1.1, 1.0, 0.001);
    }

    #[test]
    fn test_assert_arrays_approx_eq_passes() {
        let a = ramp(&[2, 3]);
        let b = a.mapv(|v| v + 1e-7);
        assert_arrays_approx_eq!(a, b, 1e-5);
    }
}
