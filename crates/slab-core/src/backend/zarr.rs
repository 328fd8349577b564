//! Chunked on-disk arrays in a Zarr V3 hierarchy.
//!
//! Each dataset is one array node `/<name>` under the store root, chunked by
//! the dataset's [`ChunkPlan`] and stored in the dataset's own [`Dtype`].
//! Blocks cross the backend boundary as `f32`; integer types round and
//! saturate on write. Strided hyperslabs are served from their bounding box.
//! Writes take a store-wide lock since two ranks writing disjoint regions may
//! still share a chunk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use ndarray::{ArrayD, ArrayViewD, IxDyn, Slice};
use tracing::{debug, info};
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs_filesystem::FilesystemStore;

use super::{check_block, check_region, StorageBackend};
use crate::chunking::ChunkPlan;
use crate::config::BackendKind;
use crate::error::{Result, SlabError};
use crate::types::{tuple_shape, DimSlice, Dtype};

/// Retrieve a subset stored as `$ty`, widened to `f32`.
macro_rules! retrieve_as {
    ($array:expr, $subset:expr, $ty:ty) => {{
        let values: Vec<$ty> = $array
            .retrieve_array_subset_elements($subset)
            .map_err(|e| SlabError::storage(e.to_string()))?;
        values.into_iter().map(|v| v as f32).collect::<Vec<f32>>()
    }};
}

/// Store `f32` values converted by `$cast`.
macro_rules! store_as {
    ($array:expr, $subset:expr, $values:expr, $cast:expr) => {{
        let converted: Vec<_> = $values.map($cast).collect();
        $array.store_array_subset_elements($subset, converted.as_slice())
    }};
}

type ZarrArray = Array<FilesystemStore>;

/// Zarr store rooted at a directory.
#[derive(Clone)]
pub struct ZarrBackend {
    root: PathBuf,
    store: Arc<FilesystemStore>,
    arrays: Arc<RwLock<HashMap<String, Arc<ZarrArray>>>>,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for ZarrBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZarrBackend").field("root", &self.root).finish()
    }
}

impl ZarrBackend {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let store = FilesystemStore::new(&root)
            .map_err(|e| SlabError::storage(format!("failed to open store {}: {}", root.display(), e)))?;
        info!(path = %root.display(), "Opened zarr store");
        Ok(Self {
            root,
            store: Arc::new(store),
            arrays: Arc::new(RwLock::new(HashMap::new())),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_path(name: &str) -> String {
        format!("/{}", name.trim_start_matches('/'))
    }

    fn array(&self, name: &str) -> Result<Arc<ZarrArray>> {
        {
            let arrays = self.arrays.read().map_err(|_| poisoned())?;
            if let Some(array) = arrays.get(name) {
                return Ok(array.clone());
            }
        }

        let array = Array::open(self.store.clone(), &Self::node_path(name))
            .map_err(|e| SlabError::DatasetNotFound(format!("{}: {}", name, e)))?;
        let array = Arc::new(array);
        self.arrays
            .write()
            .map_err(|_| poisoned())?
            .insert(name.to_string(), array.clone());
        Ok(array)
    }

    fn retrieve_box(array: &ZarrArray, start: &[usize], shape: &[usize]) -> Result<ArrayD<f32>> {
        let subset = ArraySubset::new_with_start_shape(to_u64(start), to_u64(shape))
            .map_err(|e| SlabError::storage(e.to_string()))?;
        let elements = match stored_dtype(array.data_type())? {
            Dtype::UInt8 => retrieve_as!(array, &subset, u8),
            Dtype::UInt16 => retrieve_as!(array, &subset, u16),
            Dtype::Int16 => retrieve_as!(array, &subset, i16),
            Dtype::UInt32 => retrieve_as!(array, &subset, u32),
            Dtype::Int32 => retrieve_as!(array, &subset, i32),
            Dtype::Float32 => array
                .retrieve_array_subset_elements::<f32>(&subset)
                .map_err(|e| SlabError::storage(e.to_string()))?,
            Dtype::Float64 => retrieve_as!(array, &subset, f64),
        };
        ArrayD::from_shape_vec(IxDyn(shape), elements)
            .map_err(|e| SlabError::shape_mismatch(e.to_string()))
    }

    fn store_box(array: &ZarrArray, start: &[usize], block: ArrayViewD<'_, f32>) -> Result<()> {
        let subset = ArraySubset::new_with_start_shape(to_u64(start), to_u64(block.shape()))
            .map_err(|e| SlabError::storage(e.to_string()))?;
        let values = block.iter().copied();
        let stored = match stored_dtype(array.data_type())? {
            Dtype::UInt8 => store_as!(array, &subset, values, |v: f32| v.round() as u8),
            Dtype::UInt16 => store_as!(array, &subset, values, |v: f32| v.round() as u16),
            Dtype::Int16 => store_as!(array, &subset, values, |v: f32| v.round() as i16),
            Dtype::UInt32 => store_as!(array, &subset, values, |v: f32| v.round() as u32),
            Dtype::Int32 => store_as!(array, &subset, values, |v: f32| v.round() as i32),
            Dtype::Float32 => store_as!(array, &subset, values, |v: f32| v),
            Dtype::Float64 => store_as!(array, &subset, values, f64::from),
        };
        stored.map_err(|e| SlabError::storage(e.to_string()))
    }
}

/// Zarr data type and zero fill value holding `dtype`.
fn zarr_type(dtype: Dtype) -> (DataType, FillValue) {
    match dtype {
        Dtype::UInt8 => (DataType::UInt8, FillValue::from(0u8)),
        Dtype::UInt16 => (DataType::UInt16, FillValue::from(0u16)),
        Dtype::Int16 => (DataType::Int16, FillValue::from(0i16)),
        Dtype::UInt32 => (DataType::UInt32, FillValue::from(0u32)),
        Dtype::Int32 => (DataType::Int32, FillValue::from(0i32)),
        Dtype::Float32 => (DataType::Float32, FillValue::from(0.0f32)),
        Dtype::Float64 => (DataType::Float64, FillValue::from(0.0f64)),
    }
}

fn stored_dtype(data_type: &DataType) -> Result<Dtype> {
    match data_type {
        DataType::UInt8 => Ok(Dtype::UInt8),
        DataType::UInt16 => Ok(Dtype::UInt16),
        DataType::Int16 => Ok(Dtype::Int16),
        DataType::UInt32 => Ok(Dtype::UInt32),
        DataType::Int32 => Ok(Dtype::Int32),
        DataType::Float32 => Ok(Dtype::Float32),
        DataType::Float64 => Ok(Dtype::Float64),
        other => Err(SlabError::storage(format!("unsupported zarr data type {:?}", other))),
    }
}

fn poisoned() -> SlabError {
    SlabError::storage("zarr store lock poisoned")
}

fn to_u64(values: &[usize]) -> Vec<u64> {
    values.iter().map(|&v| v as u64).collect()
}

/// Start and extent of the box enclosing a strided slice tuple.
fn bounding_box(slices: &[DimSlice]) -> (Vec<usize>, Vec<usize>) {
    slices
        .iter()
        .map(|s| match s.last() {
            Some(last) => (s.start, last - s.start + 1),
            None => (s.start, 0),
        })
        .unzip()
}

fn strided(slices: &[DimSlice]) -> bool {
    slices.iter().any(|s| s.step > 1)
}

impl StorageBackend for ZarrBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Zarr
    }

    fn create_dataset(&self, name: &str, shape: &[usize], dtype: Dtype, plan: &ChunkPlan) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;

        let node_dir = self.root.join(name.trim_start_matches('/'));
        if node_dir.exists() {
            std::fs::remove_dir_all(&node_dir)?;
        }
        self.arrays.write().map_err(|_| poisoned())?.remove(name);

        let chunks = plan.chunk_shape_for(shape);
        let chunk_grid: zarrs::array::ChunkGrid = to_u64(&chunks)
            .try_into()
            .map_err(|e| SlabError::storage(format!("invalid chunk grid {:?}: {:?}", chunks, e)))?;

        let (data_type, fill_value) = zarr_type(dtype);
        let mut attrs = serde_json::Map::new();
        attrs.insert("dtype".to_string(), serde_json::json!(dtype.as_str()));
        attrs.insert(
            "chunk_plan".to_string(),
            serde_json::to_value(plan).map_err(|e| SlabError::storage(e.to_string()))?,
        );

        let array = ArrayBuilder::new(
            to_u64(shape),
            data_type,
            chunk_grid,
            fill_value,
        )
        .attributes(attrs)
        .build(self.store.clone(), &Self::node_path(name))
        .map_err(|e| SlabError::storage(e.to_string()))?;

        array
            .store_metadata()
            .map_err(|e| SlabError::storage(e.to_string()))?;

        debug!(dataset = name, shape = ?shape, chunks = ?chunks, dtype = %dtype, "Created zarr array");
        self.arrays
            .write()
            .map_err(|_| poisoned())?
            .insert(name.to_string(), Arc::new(array));
        Ok(())
    }

    fn open_dataset(&self, name: &str) -> Result<Vec<usize>> {
        let array = self.array(name)?;
        Ok(array.shape().iter().map(|&d| d as usize).collect())
    }

    fn read(&self, name: &str, slices: &[DimSlice]) -> Result<ArrayD<f32>> {
        let array = self.array(name)?;
        let shape: Vec<usize> = array.shape().iter().map(|&d| d as usize).collect();
        check_region(name, &shape, slices)?;

        if slices.iter().any(DimSlice::is_empty) {
            return Ok(ArrayD::zeros(IxDyn(&tuple_shape(slices))));
        }

        let (start, extent) = bounding_box(slices);
        let block = Self::retrieve_box(&array, &start, &extent)?;
        if !strided(slices) {
            return Ok(block);
        }
        Ok(block
            .slice_each_axis(|ax| Slice::new(0, None, slices[ax.axis.index()].step as isize))
            .to_owned())
    }

    fn write(&self, name: &str, slices: &[DimSlice], data: ArrayViewD<'_, f32>) -> Result<()> {
        let array = self.array(name)?;
        let shape: Vec<usize> = array.shape().iter().map(|&d| d as usize).collect();
        check_region(name, &shape, slices)?;
        check_block(name, slices, &data)?;
        if data.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().map_err(|_| poisoned())?;
        let (start, extent) = bounding_box(slices);
        if !strided(slices) {
            return Self::store_box(&array, &start, data);
        }

        let mut block = Self::retrieve_box(&array, &start, &extent)?;
        block
            .slice_each_axis_mut(|ax| Slice::new(0, None, slices[ax.axis.index()].step as isize))
            .assign(&data);
        Self::store_box(&array, &start, block.view())
    }

    fn close(&self) -> Result<()> {
        self.arrays.write().map_err(|_| poisoned())?.clear();
        debug!(path = %self.root.display(), "Closed zarr store");
        Ok(())
    }
}
