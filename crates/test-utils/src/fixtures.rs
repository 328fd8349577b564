//! Common test fixtures for nd-slab tests.
//!
//! This module provides pre-defined shapes, pattern layouts and preview
//! strings that represent common tomography scenarios.

use std::path::PathBuf;

/// Common dataset shapes, ordered (angle, detector y, detector x) for
/// projection data.
pub mod shapes {
    /// Two ranks splitting four sinograms
    pub const SMALL_TOMO: [usize; 3] = [16, 4, 4];

    /// Degenerate small stack whose single frames fit the budget many times
    pub const SHORT_STACK: [usize; 3] = [180, 10, 10];

    /// Typical detector crop
    pub const TOMO_91: [usize; 3] = [91, 135, 160];

    /// Reconstructed volume edge
    pub const CUBE_1000: [usize; 3] = [1000, 1000, 1000];

    /// One-dimensional line for padding checks
    pub const LINE_100: [usize; 1] = [100];
}

/// Core and slice dimensions of the standard tomography patterns.
pub mod layouts {
    /// (core, slice) of SINOGRAM for (angle, y, x) data
    pub const SINOGRAM: (&[usize], &[usize]) = (&[0, 2], &[1]);

    /// (core, slice) of PROJECTION for (angle, y, x) data
    pub const PROJECTION: (&[usize], &[usize]) = (&[1, 2], &[0]);

    /// Axis labels for (angle, y, x) data
    pub const TOMO_LABELS: [&str; 3] = ["rotation_angle.degrees", "detector_y.pixel", "detector_x.pixel"];
}

/// Common preview strings.
pub mod previews {
    /// Keep everything
    pub const FULL_3D: [&str; 3] = [":", ":", ":"];

    /// Four rows around the centre of the second dimension
    pub const CENTRE_ROWS: [&str; 3] = [":", "mid-2:mid+2", ":"];

    /// Every second angle, skipping the last
    pub const EVEN_ANGLES: [&str; 3] = ["0:end-1:2", ":", ":"];

    /// Three-wide windows centred on 2..8 of a ten-element line
    pub const WINDOWED_LINE: [&str; 1] = ["2:8:1:3"];
}

/// Fresh scratch directory, removed when dropped.
pub fn scratch_dir() -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix("nd-slab-test")
        .tempdir()
        .unwrap_or_else(|e| panic!("failed to create scratch dir: {}", e))
}

/// Path of a store inside a scratch directory.
pub fn store_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layouts_cover_rank() {
        for (core, slice) in [layouts::SINOGRAM, layouts::PROJECTION] {
            let mut dims: Vec<usize> = core.iter().chain(slice.iter()).copied().collect();
            dims.sort_unstable();
            assert_eq!(dims, vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_scratch_dir() {
        let dir = scratch_dir();
        assert!(dir.path().exists());
        assert!(store_path(&dir, "data.zarr").starts_with(dir.path()));
    }
}
