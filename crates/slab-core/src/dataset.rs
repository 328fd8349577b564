//! Dataset descriptors.
//!
//! A descriptor is pure metadata: shape, element type, axis labels, the
//! patterns the dataset can be read under and the preview applied to it.
//! Storage lives behind a [`StorageBackend`](crate::backend::StorageBackend).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SlabError};
use crate::pattern::{Pattern, PatternName};
use crate::preview::{self, PreviewSpec};
use crate::types::{AxisLabel, Dtype};

/// Metadata for one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    pub name: String,
    /// Shape seen by processing, after any preview.
    pub shape: Vec<usize>,
    /// Shape before the preview was applied.
    pub orig_shape: Option<Vec<usize>>,
    pub dtype: Dtype,
    pub axis_labels: Vec<AxisLabel>,
    pub patterns: BTreeMap<PatternName, Pattern>,
    pub preview: Option<PreviewSpec>,
    /// Restore the original shape once the current stage completes.
    pub revert_preview: bool,
    /// Marker dimension with extent 1 and no storage.
    pub var_dim: Option<usize>,
    /// Free-form plugin metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl DatasetDescriptor {
    pub fn new(name: impl Into<String>, shape: &[usize], dtype: Dtype) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
            orig_shape: None,
            dtype,
            axis_labels: Vec::new(),
            patterns: BTreeMap::new(),
            preview: None,
            revert_preview: false,
            var_dim: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Set axis labels from `name.unit` strings, one per dimension.
    pub fn set_axis_labels<S: AsRef<str>>(&mut self, labels: &[S]) -> Result<()> {
        if labels.len() != self.rank() {
            return Err(SlabError::Config(format!(
                "dataset '{}': {} axis labels for {} dimensions",
                self.name,
                labels.len(),
                self.rank()
            )));
        }
        self.axis_labels = labels
            .iter()
            .map(|l| l.as_ref().parse::<AxisLabel>())
            .collect::<std::result::Result<_, _>>()
            .map_err(SlabError::Config)?;
        Ok(())
    }

    /// Dimension carrying the named axis label.
    pub fn find_axis_label(&self, name: &str) -> Option<usize> {
        self.axis_labels.iter().position(|l| l.name == name)
    }

    /// Register a pattern. Patterns describing fewer dimensions than the
    /// dataset gain the trailing dimensions as slice dimensions.
    pub fn add_pattern(
        &mut self,
        name: PatternName,
        core_dims: &[usize],
        slice_dims: &[usize],
    ) -> Result<()> {
        let mut pattern = Pattern::new(name, core_dims, slice_dims)?;
        if pattern.ndims() < self.rank() {
            pattern.extend_to_rank(self.rank());
        }
        pattern.validate_rank(self.rank())?;
        self.patterns.insert(name, pattern);
        Ok(())
    }

    /// Register the three planar volume patterns for spatial dims `x, y, z`.
    pub fn add_volume_patterns(&mut self, x: usize, y: usize, z: usize) -> Result<()> {
        let rank = self.rank();
        let dirs = |a: usize, b: usize, slice: usize| -> (Vec<usize>, Vec<usize>) {
            let mut slice_dims = vec![slice];
            slice_dims.extend((0..rank).filter(|d| ![a, b, slice].contains(d)));
            (vec![a, b], slice_dims)
        };

        let (core, slice) = dirs(y, z, x);
        self.add_pattern(PatternName::VolumeYz, &core, &slice)?;
        let (core, slice) = dirs(x, z, y);
        self.add_pattern(PatternName::VolumeXz, &core, &slice)?;
        let (core, slice) = dirs(x, y, z);
        self.add_pattern(PatternName::VolumeXy, &core, &slice)
    }

    /// When both SINOGRAM and PROJECTION are present, set each one's main
    /// direction to the first of its slice dims that is core in the other.
    pub fn finalise_patterns(&mut self) {
        let (Some(sino), Some(proj)) = (
            self.patterns.get(&PatternName::Sinogram).cloned(),
            self.patterns.get(&PatternName::Projection).cloned(),
        ) else {
            return;
        };

        let main_dir = |this: &Pattern, other: &Pattern| {
            this.slice_dims
                .iter()
                .copied()
                .filter(|d| other.is_core(*d))
                .min()
        };

        if let Some(dim) = main_dir(&sino, &proj) {
            self.patterns
                .insert(PatternName::Sinogram, sino.clone().with_main_dir(dim));
        }
        if let Some(dim) = main_dir(&proj, &sino) {
            self.patterns
                .insert(PatternName::Projection, proj.with_main_dir(dim));
        }
    }

    /// Look up a registered pattern.
    pub fn pattern(&self, name: PatternName) -> Result<&Pattern> {
        self.patterns.get(&name).ok_or_else(|| {
            SlabError::pattern_mismatch(format!(
                "dataset '{}' has no pattern {}",
                self.name, name
            ))
        })
    }

    pub fn has_pattern(&self, name: PatternName) -> bool {
        self.patterns.contains_key(&name)
    }

    /// Mark dimension `dim` as the var dimension.
    pub fn set_var_dim(&mut self, dim: usize) -> Result<()> {
        match self.shape.get(dim) {
            Some(1) => {
                self.var_dim = Some(dim);
                Ok(())
            }
            Some(extent) => Err(SlabError::shape_mismatch(format!(
                "var dimension {} of '{}' has extent {}, expected 1",
                dim, self.name, extent
            ))),
            None => Err(SlabError::shape_mismatch(format!(
                "var dimension {} is outside the rank of '{}'",
                dim, self.name
            ))),
        }
    }

    /// Shape of the stored data, before any preview.
    pub fn storage_shape(&self) -> &[usize] {
        self.orig_shape.as_deref().unwrap_or(&self.shape)
    }

    /// Stored shape without the var dimension.
    pub fn physical_shape(&self) -> Vec<usize> {
        self.storage_shape()
            .iter()
            .enumerate()
            .filter(|(d, _)| Some(*d) != self.var_dim)
            .map(|(_, &extent)| extent)
            .collect()
    }

    /// Apply a preview. An empty list clears any previous preview.
    ///
    /// Entries are resolved against the stored shape, so applying a second
    /// preview replaces the first rather than composing with it.
    pub fn set_preview<S: AsRef<str>>(&mut self, raw: &[S], revert: bool) -> Result<()> {
        let storage = self.storage_shape().to_vec();
        let spec = preview::resolve(raw, &storage)?;
        self.revert_preview = revert;

        if spec.is_identity(&storage) {
            self.preview = None;
            self.shape = storage;
            self.orig_shape = None;
            return Ok(());
        }

        debug!(
            dataset = %self.name,
            orig_shape = ?storage,
            shape = ?spec.effective_shape(),
            "Applied preview"
        );
        self.shape = spec.effective_shape();
        self.orig_shape = Some(storage);
        self.preview = Some(spec);
        Ok(())
    }

    /// Resolved preview, or the identity when none is set.
    pub fn effective_preview(&self) -> PreviewSpec {
        self.preview
            .clone()
            .unwrap_or_else(|| PreviewSpec::identity(self.storage_shape()))
    }

    /// Restore the original shape and drop the preview.
    pub fn revert_preview(&mut self) {
        if let Some(orig) = self.orig_shape.take() {
            debug!(dataset = %self.name, shape = ?orig, "Reverted preview");
            self.shape = orig;
        }
        self.preview = None;
        self.revert_preview = false;
    }

    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }
}

/// Serialisable descriptor, persisted alongside checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub name: String,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig_shape: Option<Vec<usize>>,
    pub dtype: Dtype,
    #[serde(default)]
    pub axis_labels: Vec<AxisLabel>,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<PreviewSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub var_dim: Option<usize>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl From<&DatasetDescriptor> for DatasetMeta {
    fn from(desc: &DatasetDescriptor) -> Self {
        Self {
            name: desc.name.clone(),
            shape: desc.shape.clone(),
            orig_shape: desc.orig_shape.clone(),
            dtype: desc.dtype,
            axis_labels: desc.axis_labels.clone(),
            patterns: desc.patterns.values().cloned().collect(),
            preview: desc.preview.clone(),
            var_dim: desc.var_dim,
            metadata: desc.metadata.clone(),
        }
    }
}

impl DatasetMeta {
    /// Rebuild a descriptor, re-validating every pattern against the rank.
    pub fn into_descriptor(self) -> Result<DatasetDescriptor> {
        let rank = self.shape.len();
        let mut patterns = BTreeMap::new();
        for pattern in self.patterns {
            pattern.validate_rank(rank)?;
            patterns.insert(pattern.name, pattern);
        }
        Ok(DatasetDescriptor {
            name: self.name,
            shape: self.shape,
            orig_shape: self.orig_shape,
            dtype: self.dtype,
            axis_labels: self.axis_labels,
            patterns,
            preview: self.preview,
            revert_preview: false,
            var_dim: self.var_dim,
            metadata: self.metadata,
        })
    }
}
