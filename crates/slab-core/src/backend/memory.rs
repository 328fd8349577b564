//! In-process array store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use tracing::debug;

use super::{check_block, check_region, StorageBackend};
use crate::chunking::ChunkPlan;
use crate::config::BackendKind;
use crate::error::{Result, SlabError};
use crate::types::{DimSlice, Dtype};

/// Arrays held in memory. Clones share the same arrays, so one instance can
/// serve every rank of an in-process run.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    arrays: Arc<RwLock<HashMap<String, ArrayD<f32>>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a dataset.
    pub fn insert(&self, name: impl Into<String>, data: ArrayD<f32>) -> Result<()> {
        let mut arrays = self.arrays.write().map_err(|_| poisoned())?;
        arrays.insert(name.into(), data);
        Ok(())
    }

    /// Copy of a whole dataset.
    pub fn snapshot(&self, name: &str) -> Result<ArrayD<f32>> {
        let arrays = self.arrays.read().map_err(|_| poisoned())?;
        arrays
            .get(name)
            .cloned()
            .ok_or_else(|| SlabError::DatasetNotFound(name.to_string()))
    }
}

fn poisoned() -> SlabError {
    SlabError::storage("in-memory store lock poisoned")
}

impl StorageBackend for InMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InMemory
    }

    fn create_dataset(&self, name: &str, shape: &[usize], dtype: Dtype, _plan: &ChunkPlan) -> Result<()> {
        debug!(dataset = name, shape = ?shape, dtype = %dtype, "Creating in-memory dataset");
        self.insert(name, ArrayD::zeros(IxDyn(shape)))
    }

    fn open_dataset(&self, name: &str) -> Result<Vec<usize>> {
        let arrays = self.arrays.read().map_err(|_| poisoned())?;
        arrays
            .get(name)
            .map(|a| a.shape().to_vec())
            .ok_or_else(|| SlabError::DatasetNotFound(name.to_string()))
    }

    fn read(&self, name: &str, slices: &[DimSlice]) -> Result<ArrayD<f32>> {
        let arrays = self.arrays.read().map_err(|_| poisoned())?;
        let array = arrays
            .get(name)
            .ok_or_else(|| SlabError::DatasetNotFound(name.to_string()))?;
        check_region(name, array.shape(), slices)?;
        Ok(array
            .slice_each_axis(|ax| slices[ax.axis.index()].as_ndarray())
            .to_owned())
    }

    fn write(&self, name: &str, slices: &[DimSlice], data: ArrayViewD<'_, f32>) -> Result<()> {
        let mut arrays = self.arrays.write().map_err(|_| poisoned())?;
        let array = arrays
            .get_mut(name)
            .ok_or_else(|| SlabError::DatasetNotFound(name.to_string()))?;
        check_region(name, array.shape(), slices)?;
        check_block(name, slices, &data)?;
        array
            .slice_each_axis_mut(|ax| slices[ax.axis.index()].as_ndarray())
            .assign(&data);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_strided_write_and_read() {
        let backend = InMemoryBackend::new();
        backend
            .create_dataset("d", &[4, 6], Dtype::Float32, &ChunkPlan::Auto)
            .unwrap();

        let block = Array2::from_elem((2, 3), 7.0f32).into_dyn();
        let slices = [DimSlice::new(1, 4, 2), DimSlice::new(0, 6, 2)];
        backend.write("d", &slices, block.view()).unwrap();

        let all = backend.snapshot("d").unwrap();
        assert_eq!(all[[1, 0]], 7.0);
        assert_eq!(all[[3, 4]], 7.0);
        assert_eq!(all[[1, 1]], 0.0);
        assert_eq!(backend.read("d", &slices).unwrap(), block);
    }

    #[test]
    fn test_errors() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.open_dataset("missing"),
            Err(SlabError::DatasetNotFound(_))
        ));
        backend
            .create_dataset("d", &[2, 2], Dtype::Float32, &ChunkPlan::Auto)
            .unwrap();
        let wrong = Array2::<f32>::zeros((1, 1)).into_dyn();
        assert!(backend
            .write("d", &[DimSlice::full(2), DimSlice::full(2)], wrong.view())
            .is_err());
    }
}
