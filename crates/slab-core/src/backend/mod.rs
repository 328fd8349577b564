//! Backing stores for datasets.
//!
//! A backend holds named N-d arrays addressed by hyperslabs. Every buffer is
//! `f32` in memory; the [`Dtype`] passed at creation is recorded for sizing
//! and for the on-disk description.

mod memory;
mod zarr;

pub use memory::InMemoryBackend;
pub use zarr::ZarrBackend;

use std::path::Path;
use std::sync::Arc;

use ndarray::{ArrayD, ArrayViewD};
use tracing::{debug, info};

use crate::chunking::ChunkPlan;
use crate::config::BackendKind;
use crate::error::{Result, SlabError};
use crate::types::{format_tuple, tuple_shape, DimSlice, Dtype};

/// Hyperslab-addressable array storage shared by every rank.
pub trait StorageBackend: Send + Sync {
    /// Which kind of backend this is.
    fn kind(&self) -> BackendKind;

    /// Create (or replace) a dataset filled with zeros.
    fn create_dataset(&self, name: &str, shape: &[usize], dtype: Dtype, plan: &ChunkPlan)
        -> Result<()>;

    /// Open an existing dataset and return its shape.
    fn open_dataset(&self, name: &str) -> Result<Vec<usize>>;

    /// Read the block selected by `slices`.
    fn read(&self, name: &str, slices: &[DimSlice]) -> Result<ArrayD<f32>>;

    /// Write `data` into the block selected by `slices`.
    fn write(&self, name: &str, slices: &[DimSlice], data: ArrayViewD<'_, f32>) -> Result<()>;

    /// Release cached handles. Datasets stay readable after reopening.
    fn close(&self) -> Result<()>;
}

/// Backend supplied by the caller, selected with [`BackendKind::External`].
pub struct ExternalBackend {
    label: String,
    inner: Box<dyn StorageBackend>,
}

impl ExternalBackend {
    pub fn new(label: impl Into<String>, inner: Box<dyn StorageBackend>) -> Self {
        Self {
            label: label.into(),
            inner,
        }
    }
}

impl StorageBackend for ExternalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    fn create_dataset(
        &self,
        name: &str,
        shape: &[usize],
        dtype: Dtype,
        plan: &ChunkPlan,
    ) -> Result<()> {
        debug!(backend = %self.label, dataset = name, shape = ?shape, "Creating dataset");
        self.inner.create_dataset(name, shape, dtype, plan)
    }

    fn open_dataset(&self, name: &str) -> Result<Vec<usize>> {
        self.inner.open_dataset(name)
    }

    fn read(&self, name: &str, slices: &[DimSlice]) -> Result<ArrayD<f32>> {
        self.inner.read(name, slices)
    }

    fn write(&self, name: &str, slices: &[DimSlice], data: ArrayViewD<'_, f32>) -> Result<()> {
        self.inner.write(name, slices, data)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

/// Construct the backend chosen by configuration.
///
/// `external` is required for [`BackendKind::External`] and ignored
/// otherwise.
pub fn build_backend(
    kind: BackendKind,
    out_path: &Path,
    external: Option<Box<dyn StorageBackend>>,
) -> Result<Arc<dyn StorageBackend>> {
    info!(backend = %kind, path = %out_path.display(), "Initializing storage backend");
    match kind {
        BackendKind::Zarr => Ok(Arc::new(ZarrBackend::create(out_path.join("data.zarr"))?)),
        BackendKind::InMemory => Ok(Arc::new(InMemoryBackend::new())),
        BackendKind::External => {
            let inner = external.ok_or_else(|| {
                SlabError::Config("external backend selected but none supplied".to_string())
            })?;
            Ok(Arc::new(ExternalBackend::new("external", inner)))
        }
    }
}

/// Check that `slices` selects an in-bounds region of `shape`.
pub(crate) fn check_region(name: &str, shape: &[usize], slices: &[DimSlice]) -> Result<()> {
    if slices.len() != shape.len() {
        return Err(SlabError::shape_mismatch(format!(
            "dataset '{}' has rank {}, slice {} has rank {}",
            name,
            shape.len(),
            format_tuple(slices),
            slices.len()
        )));
    }
    for (s, &extent) in slices.iter().zip(shape) {
        if let Some(last) = s.last() {
            if last >= extent {
                return Err(SlabError::shape_mismatch(format!(
                    "slice {} is outside dataset '{}' of shape {:?}",
                    format_tuple(slices),
                    name,
                    shape
                )));
            }
        }
    }
    Ok(())
}

/// Check that a block matches the region it is written to.
pub(crate) fn check_block(name: &str, slices: &[DimSlice], data: &ArrayViewD<'_, f32>) -> Result<()> {
    let expected = tuple_shape(slices);
    if data.shape() != expected.as_slice() {
        return Err(SlabError::shape_mismatch(format!(
            "block of shape {:?} written to {} of '{}' (expected {:?})",
            data.shape(),
            format_tuple(slices),
            name,
            expected
        )));
    }
    Ok(())
}
