//! Access pattern registry.
//!
//! A pattern declares which dimensions of a dataset are processed together
//! (core) and which are iterated frame by frame (slice). The first slice
//! dimension is the fast dimension: transfers and rank partitions run along it.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SlabError};

/// The closed set of pattern names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatternName {
    Sinogram,
    Projection,
    #[serde(rename = "VOLUME_YZ")]
    VolumeYz,
    #[serde(rename = "VOLUME_XZ")]
    VolumeXz,
    #[serde(rename = "VOLUME_XY")]
    VolumeXy,
    #[serde(rename = "VOLUME_3D")]
    Volume3d,
    Spectrum,
    Diffraction,
    Channel,
    SpectrumStack,
    ProjectionStack,
    Tangentogram,
    Metadata,
}

impl PatternName {
    /// Every registered pattern.
    pub const ALL: [PatternName; 13] = [
        Self::Sinogram,
        Self::Projection,
        Self::VolumeYz,
        Self::VolumeXz,
        Self::VolumeXy,
        Self::Volume3d,
        Self::Spectrum,
        Self::Diffraction,
        Self::Channel,
        Self::SpectrumStack,
        Self::ProjectionStack,
        Self::Tangentogram,
        Self::Metadata,
    ];

    /// Get the registry name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sinogram => "SINOGRAM",
            Self::Projection => "PROJECTION",
            Self::VolumeYz => "VOLUME_YZ",
            Self::VolumeXz => "VOLUME_XZ",
            Self::VolumeXy => "VOLUME_XY",
            Self::Volume3d => "VOLUME_3D",
            Self::Spectrum => "SPECTRUM",
            Self::Diffraction => "DIFFRACTION",
            Self::Channel => "CHANNEL",
            Self::SpectrumStack => "SPECTRUM_STACK",
            Self::ProjectionStack => "PROJECTION_STACK",
            Self::Tangentogram => "TANGENTOGRAM",
            Self::Metadata => "METADATA",
        }
    }

    /// Volume patterns get the fixed volume chunk edge when planning storage.
    pub fn is_volume(&self) -> bool {
        self.as_str().contains("VOLUME")
    }
}

impl FromStr for PatternName {
    type Err = SlabError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == upper)
            .ok_or_else(|| SlabError::UnknownPattern(s.to_string()))
    }
}

impl fmt::Display for PatternName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A pattern instance bound to one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub name: PatternName,
    pub core_dims: Vec<usize>,
    pub slice_dims: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_dir: Option<usize>,
}

impl Pattern {
    /// Create a pattern, rejecting repeated or overlapping dimensions.
    pub fn new(name: PatternName, core_dims: &[usize], slice_dims: &[usize]) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for &dim in core_dims.iter().chain(slice_dims) {
            if !seen.insert(dim) {
                return Err(SlabError::pattern_mismatch(format!(
                    "pattern {} lists dimension {} more than once",
                    name, dim
                )));
            }
        }

        Ok(Self {
            name,
            core_dims: core_dims.to_vec(),
            slice_dims: slice_dims.to_vec(),
            main_dir: None,
        })
    }

    /// Set the tomography main direction.
    pub fn with_main_dir(mut self, dim: usize) -> Self {
        self.main_dir = Some(dim);
        self
    }

    /// The fastest-changing slice dimension, if any.
    pub fn fast_dim(&self) -> Option<usize> {
        self.slice_dims.first().copied()
    }

    /// Number of dimensions the pattern describes.
    pub fn ndims(&self) -> usize {
        self.core_dims.len() + self.slice_dims.len()
    }

    pub fn is_core(&self, dim: usize) -> bool {
        self.core_dims.contains(&dim)
    }

    pub fn is_slice(&self, dim: usize) -> bool {
        self.slice_dims.contains(&dim)
    }

    /// Check that core and slice dimensions cover `0..rank` exactly once.
    pub fn validate_rank(&self, rank: usize) -> Result<()> {
        let covered: BTreeSet<usize> = self
            .core_dims
            .iter()
            .chain(&self.slice_dims)
            .copied()
            .collect();
        let expected: BTreeSet<usize> = (0..rank).collect();
        if covered != expected || self.ndims() != rank {
            return Err(SlabError::pattern_mismatch(format!(
                "pattern {} covers dimensions {:?} but the dataset has rank {}",
                self.name, covered, rank
            )));
        }
        Ok(())
    }

    /// Append dimensions beyond the pattern's coverage as slice dimensions.
    ///
    /// Used when a dataset gains trailing dimensions (parameter tuning).
    pub fn extend_to_rank(&mut self, rank: usize) {
        for dim in 0..rank {
            if !self.is_core(dim) && !self.is_slice(dim) {
                self.slice_dims.push(dim);
            }
        }
    }

    /// Re-index the pattern for storage that omits `removed` (the var dimension).
    pub fn without_dim(&self, removed: usize) -> Pattern {
        let remap = |dims: &[usize]| -> Vec<usize> {
            dims.iter()
                .filter(|&&d| d != removed)
                .map(|&d| if d > removed { d - 1 } else { d })
                .collect()
        };
        Pattern {
            name: self.name,
            core_dims: remap(&self.core_dims),
            slice_dims: remap(&self.slice_dims),
            main_dir: self
                .main_dir
                .filter(|&d| d != removed)
                .map(|d| if d > removed { d - 1 } else { d }),
        }
    }
}
