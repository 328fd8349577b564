//! Zarr backend tests against a scratch directory.

use ndarray::{Array2, ArrayD, Axis};
use slab_core::{BackendKind, ChunkPlan, DimSlice, Dtype, StorageBackend, ZarrBackend};
use test_utils::{assert_arrays_approx_eq, index_encoded, scratch_dir, store_path};

fn chunks(shape: &[usize]) -> ChunkPlan {
    ChunkPlan::Chunks {
        shape: shape.to_vec(),
        converged: true,
    }
}

fn full(shape: &[usize]) -> Vec<DimSlice> {
    shape.iter().map(|&s| DimSlice::full(s)).collect()
}

#[test]
fn test_create_write_read() {
    let dir = scratch_dir();
    let backend = ZarrBackend::create(store_path(&dir, "data.zarr")).unwrap();
    assert_eq!(backend.kind(), BackendKind::Zarr);

    let shape = [6, 5, 4];
    backend
        .create_dataset("tomo", &shape, Dtype::Float32, &chunks(&[2, 5, 4]))
        .unwrap();
    assert_eq!(backend.open_dataset("tomo").unwrap(), shape.to_vec());

    // unwritten chunks read back as the fill value
    let empty = backend.read("tomo", &full(&shape)).unwrap();
    assert!(empty.iter().all(|&v| v == 0.0));

    let data = index_encoded(&shape);
    backend.write("tomo", &full(&shape), data.view()).unwrap();
    let back = backend.read("tomo", &full(&shape)).unwrap();
    assert_arrays_approx_eq!(back, data, 0.0);

    let part = backend
        .read(
            "tomo",
            &[DimSlice::new(1, 4, 1), DimSlice::index(2), DimSlice::new(0, 4, 1)],
        )
        .unwrap();
    assert_eq!(part.shape(), &[3, 1, 4]);
    assert_eq!(part[[0, 0, 3]], 10203.0);
}

#[test]
fn test_strided_write_and_read() {
    let dir = scratch_dir();
    let backend = ZarrBackend::create(store_path(&dir, "data.zarr")).unwrap();
    backend
        .create_dataset("grid", &[8, 6], Dtype::Float32, &ChunkPlan::Auto)
        .unwrap();

    let slices = [DimSlice::new(1, 8, 3), DimSlice::new(0, 6, 2)];
    let block = Array2::from_shape_fn((3, 3), |(i, j)| (i * 10 + j + 1) as f32).into_dyn();
    backend.write("grid", &slices, block.view()).unwrap();

    let back = backend.read("grid", &slices).unwrap();
    assert_eq!(back, block);

    let all = backend.read("grid", &[DimSlice::full(8), DimSlice::full(6)]).unwrap();
    assert_eq!(all[[1, 0]], 1.0);
    assert_eq!(all[[4, 2]], 12.0);
    assert_eq!(all[[7, 4]], 23.0);
    // untouched neighbours of strided elements keep the fill value
    assert_eq!(all[[1, 1]], 0.0);
    assert_eq!(all[[2, 0]], 0.0);
    let written: f32 = all.iter().filter(|&&v| v != 0.0).count() as f32;
    assert_eq!(written, 9.0);
}

#[test]
fn test_recreate_replaces_dataset() {
    let dir = scratch_dir();
    let backend = ZarrBackend::create(store_path(&dir, "data.zarr")).unwrap();
    backend
        .create_dataset("out", &[4, 4], Dtype::Float32, &ChunkPlan::Auto)
        .unwrap();
    let ones = ArrayD::<f32>::ones(ndarray::IxDyn(&[4, 4]));
    backend.write("out", &full(&[4, 4]), ones.view()).unwrap();

    backend
        .create_dataset("out", &[2, 3, 5], Dtype::Float32, &chunks(&[1, 3, 5]))
        .unwrap();
    assert_eq!(backend.open_dataset("out").unwrap(), vec![2, 3, 5]);
    let fresh = backend.read("out", &full(&[2, 3, 5])).unwrap();
    assert!(fresh.iter().all(|&v| v == 0.0));
}

#[test]
fn test_reopen_after_close() {
    let dir = scratch_dir();
    let path = store_path(&dir, "data.zarr");
    let data = index_encoded(&[5, 7]);
    {
        let backend = ZarrBackend::create(&path).unwrap();
        backend
            .create_dataset("line", &[5, 7], Dtype::Float32, &chunks(&[1, 7]))
            .unwrap();
        backend.write("line", &full(&[5, 7]), data.view()).unwrap();
        backend.close().unwrap();
        assert_eq!(backend.open_dataset("line").unwrap(), vec![5, 7]);
    }

    let reopened = ZarrBackend::create(&path).unwrap();
    let back = reopened.read("line", &full(&[5, 7])).unwrap();
    assert_eq!(back.index_axis(Axis(0), 3), data.index_axis(Axis(0), 3));
}

#[test]
fn test_missing_dataset_and_bad_region() {
    let dir = scratch_dir();
    let backend = ZarrBackend::create(store_path(&dir, "data.zarr")).unwrap();
    assert!(backend.open_dataset("absent").is_err());

    backend
        .create_dataset("small", &[3, 3], Dtype::Float32, &ChunkPlan::Auto)
        .unwrap();
    let err = backend
        .read("small", &[DimSlice::new(0, 4, 1), DimSlice::full(3)])
        .unwrap_err();
    assert!(err.to_string().contains("outside"));
}

fn stored_data_type(root: &std::path::Path, name: &str) -> String {
    let text = std::fs::read_to_string(root.join(name).join("zarr.json")).unwrap();
    let meta: serde_json::Value = serde_json::from_str(&text).unwrap();
    meta["data_type"].as_str().unwrap().to_string()
}

#[test]
fn test_integer_dataset_stored_at_its_width() {
    let dir = scratch_dir();
    let root = store_path(&dir, "data.zarr");
    let backend = ZarrBackend::create(&root).unwrap();
    backend
        .create_dataset("mask", &[2, 4], Dtype::UInt8, &chunks(&[2, 4]))
        .unwrap();
    assert_eq!(stored_data_type(&root, "mask"), "uint8");

    let block = Array2::from_shape_vec((2, 4), vec![0.0, 1.0, 3.6, 254.5, -2.0, 300.0, 7.0, 12.2])
        .unwrap()
        .into_dyn();
    backend.write("mask", &full(&[2, 4]), block.view()).unwrap();

    // values round to the nearest integer and saturate at the type bounds
    let reopened = ZarrBackend::create(&root).unwrap();
    let back = reopened.read("mask", &full(&[2, 4])).unwrap();
    let expected = Array2::from_shape_vec((2, 4), vec![0.0, 1.0, 4.0, 255.0, 0.0, 255.0, 7.0, 12.0])
        .unwrap()
        .into_dyn();
    assert_eq!(back, expected);
}

#[test]
fn test_double_dataset_stored_as_float64() {
    let dir = scratch_dir();
    let root = store_path(&dir, "data.zarr");
    let backend = ZarrBackend::create(&root).unwrap();
    let shape = [3, 4, 5];
    backend
        .create_dataset("recon", &shape, Dtype::Float64, &ChunkPlan::Auto)
        .unwrap();
    assert_eq!(stored_data_type(&root, "recon"), "float64");

    let data = index_encoded(&shape);
    backend.write("recon", &full(&shape), data.view()).unwrap();
    assert_eq!(backend.read("recon", &full(&shape)).unwrap(), data);
}
