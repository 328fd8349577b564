//! End-to-end scenarios for slicing, padding, chunk planning and resumption.

use std::sync::{Arc, Mutex};

use ndarray::{ArrayD, Axis, IxDyn};
use slab_core::{
    apply_pad, pad_read, resolve_preview, strip_pad, CheckpointState, ChunkPlan, ChunkPlanner,
    DatasetDescriptor, DimSlice, Dtype, EngineConfig, FileCheckpointer, FnProcessor, FrameContext,
    FrameOutput, FrameProcessor, InMemoryBackend, Pad, PaddingDirective, Pattern, PatternAccess,
    PatternName, Pipeline, PipelineContext, RunOutcome, SingleProcess, SliceListBuilder, Stage,
    StageInput, StageOutput, StorageBackend, CancellationToken,
};
use test_utils::{decode_index, index_encoded, layouts, previews, ramp, shapes};

fn sinogram() -> Pattern {
    let (core, slice) = layouts::SINOGRAM;
    Pattern::new(PatternName::Sinogram, core, slice).unwrap()
}

fn read(data: &ArrayD<f32>, slices: &[DimSlice]) -> ArrayD<f32> {
    data.slice_each_axis(|ax| slices[ax.axis.index()].as_ndarray())
        .to_owned()
}

#[test]
fn test_two_ranks_split_sinograms() {
    let pattern = sinogram();
    let shape = shapes::SMALL_TOMO;
    let expected = [[0, 1], [2, 3]];

    for (rank, owned) in expected.iter().enumerate() {
        let lists = SliceListBuilder::new(&pattern, &shape)
            .ranks(rank, 2)
            .max_frames(2, 1)
            .build()
            .unwrap();

        let frames: Vec<usize> = lists.frame_list().iter().map(|f| f[1].start).collect();
        assert_eq!(frames, owned.to_vec());

        assert_eq!(lists.n_transfers(), 1);
        assert_eq!(lists.transfers[0].frames, 2);
        assert_eq!(
            lists.transfer_list()[0],
            vec![
                DimSlice::full(16),
                DimSlice::new(owned[0], owned[1] + 1, 1),
                DimSlice::full(4)
            ]
        );

        let process = lists.process_list();
        assert_eq!(process.len(), 2);
        assert_eq!(process[0][1], DimSlice::new(0, 1, 1));
        assert_eq!(process[1][1], DimSlice::new(1, 2, 1));
    }
}

#[test]
fn test_padding_inside_data() {
    let data = ramp(&shapes::LINE_100);
    let directive = PaddingDirective::new().pad(0, Pad::symmetric(5));

    let padded = pad_read(&[DimSlice::new(10, 20, 1)], &directive, &shapes::LINE_100).unwrap();
    assert_eq!(padded.slices, vec![DimSlice::new(5, 25, 1)]);
    assert!(!padded.needs_fill());

    let block = apply_pad(read(&data, &padded.slices), &padded.fill).unwrap();
    // five neighbours either side of the ten requested elements
    assert_eq!(block.len(), 20);
    assert_eq!(block[[0]], 5.0);
    assert_eq!(block[[4]], 9.0);
    assert_eq!(block[[15]], 20.0);
    assert_eq!(block[[19]], 24.0);
}

#[test]
fn test_padding_clamps_at_left_edge() {
    let data = ramp(&shapes::LINE_100);
    let directive = PaddingDirective::new().pad(0, Pad::symmetric(5));

    let padded = pad_read(&[DimSlice::new(0, 10, 1)], &directive, &shapes::LINE_100).unwrap();
    assert_eq!(padded.slices, vec![DimSlice::new(0, 15, 1)]);
    assert_eq!(padded.fill, vec![Pad::new(5, 0)]);

    let block = apply_pad(read(&data, &padded.slices), &padded.fill).unwrap();
    assert_eq!(block.len(), 20);
    assert!(block.iter().take(6).all(|&v| v == 0.0));
    assert_eq!(block[[6]], 1.0);
    assert_eq!(block[[19]], 14.0);
}

#[test]
fn test_pad_roundtrip_is_identity() {
    let data = index_encoded(&[12, 9, 7]);
    let pattern = sinogram();
    let directive = PaddingDirective::new()
        .pad_frame_edges(&pattern, 2)
        .pad(1, Pad::symmetric(1));
    let slices = [DimSlice::new(0, 12, 1), DimSlice::new(3, 5, 1), DimSlice::new(0, 7, 1)];

    let padded = pad_read(&slices, &directive, data.shape()).unwrap();
    let block = apply_pad(read(&data, &padded.slices), &padded.fill).unwrap();
    assert_eq!(block.shape(), &[16, 4, 11]);

    let stripped = strip_pad(block, &directive).unwrap();
    assert_eq!(stripped, read(&data, &slices));
}

#[test]
fn test_small_stack_chunks_within_budget() {
    let pattern = sinogram();
    let planner = ChunkPlanner::new(&EngineConfig::default(), 1);
    let plan = planner
        .plan(PatternAccess::new(&pattern, 1), None, &shapes::SHORT_STACK, Dtype::Float32)
        .unwrap();

    let ChunkPlan::Chunks { shape, converged } = plan else {
        panic!("expected explicit chunks, got {:?}", plan);
    };
    assert!(converged);
    let bytes = shape.iter().product::<usize>() * Dtype::Float32.itemsize();
    let frame_bytes = 180 * 10 * Dtype::Float32.itemsize();
    assert!(bytes <= 1_000_000);
    assert!(bytes >= frame_bytes);
}

#[test]
fn test_full_preview_is_identity() {
    let mut desc = DatasetDescriptor::new("tomo", &shapes::TOMO_91, Dtype::Float32);
    let (core, slice) = layouts::PROJECTION;
    desc.add_pattern(PatternName::Projection, core, slice).unwrap();

    let before = SliceListBuilder::for_dataset(&desc, PatternName::Projection)
        .unwrap()
        .build()
        .unwrap();
    desc.set_preview(&previews::FULL_3D, false).unwrap();
    assert_eq!(desc.shape, shapes::TOMO_91.to_vec());
    assert!(desc.preview.is_none());

    let after = SliceListBuilder::for_dataset(&desc, PatternName::Projection)
        .unwrap()
        .build()
        .unwrap();
    assert_eq!(before.frame_list(), after.frame_list());
}

#[test]
fn test_centre_and_edge_relative_previews() {
    let mut desc = DatasetDescriptor::new("tomo", &shapes::TOMO_91, Dtype::Float32);
    desc.set_axis_labels(&layouts::TOMO_LABELS).unwrap();
    let rows = desc.find_axis_label("detector_y").unwrap();
    assert_eq!(rows, 1);

    // mid of 135 rows is 66
    desc.set_preview(&previews::CENTRE_ROWS, true).unwrap();
    assert_eq!(desc.shape, vec![91, 4, 160]);
    assert_eq!(desc.effective_preview().dims[rows].indices(), vec![64, 65, 66, 67]);
    desc.revert_preview();
    assert_eq!(desc.shape, shapes::TOMO_91.to_vec());

    let angles = resolve_preview(&previews::EVEN_ANGLES, &shapes::TOMO_91).unwrap();
    let kept = angles.dims[0].indices();
    assert_eq!(kept.len(), 45);
    assert_eq!(kept.last(), Some(&88));
    assert_eq!(angles.effective_shape(), vec![45, 135, 160]);
}

#[test]
fn test_even_angle_preview_reads_even_angles() {
    let shape = shapes::SMALL_TOMO;
    let data = index_encoded(&shape);
    let pattern = sinogram();
    let preview = resolve_preview(&previews::EVEN_ANGLES, &shape).unwrap();

    let lists = SliceListBuilder::new(&pattern, &shape)
        .preview(&preview)
        .max_frames(4, 1)
        .build()
        .unwrap();
    assert_eq!(lists.n_transfers(), 1);

    let block = read(&data, &lists.transfer_list()[0]);
    assert_eq!(block.shape(), &[8, 4, 4]);
    for (pos, &value) in block.indexed_iter() {
        let index = decode_index(value, 3);
        assert_eq!(index[0], 2 * pos[0]);
        assert_eq!(&index[1..], &[pos[1], pos[2]]);
    }
}

#[test]
fn test_volume_chunks_clamped_to_edge() {
    let xy = Pattern::new(PatternName::VolumeXy, &[0, 1], &[2]).unwrap();
    let xz = Pattern::new(PatternName::VolumeXz, &[0, 2], &[1]).unwrap();
    let plan = ChunkPlanner::new(&EngineConfig::default(), 4)
        .plan(
            PatternAccess::new(&xy, 1),
            Some(PatternAccess::new(&xz, 1)),
            &shapes::CUBE_1000,
            Dtype::Float32,
        )
        .unwrap();
    assert_eq!(
        plan,
        ChunkPlan::Chunks {
            shape: vec![62, 62, 62],
            converged: true
        }
    );
}

#[test]
fn test_windowed_preview_triples_frames() {
    let windowed = resolve_preview(&previews::WINDOWED_LINE, &[10]).unwrap();
    let plain = resolve_preview(&["2:8:1:1"], &[10]).unwrap();

    let windowed_idx = windowed.dims[0].indices();
    let plain_idx = plain.dims[0].indices();
    assert_eq!(windowed_idx.len(), 3 * plain_idx.len());
    assert_eq!(plain_idx, vec![2, 3, 4, 5, 6, 7]);
    for (centre, window) in plain_idx.iter().zip(windowed_idx.chunks(3)) {
        assert_eq!(window, &[centre - 1, *centre, centre + 1]);
    }
}

#[test]
fn test_windowed_preview_through_pipeline() {
    let backend = InMemoryBackend::new();
    let data = index_encoded(&[10, 4]);
    backend.insert("line", data.clone()).unwrap();

    let mut desc = DatasetDescriptor::new("line", &[10, 4], Dtype::Float32);
    desc.add_pattern(PatternName::Spectrum, &[1], &[0]).unwrap();
    desc.set_preview(&["2:8:1:3", ":"], false).unwrap();
    assert_eq!(desc.shape, vec![18, 4]);

    let mut ctx = PipelineContext::new(
        EngineConfig::default(),
        Arc::new(SingleProcess),
        Arc::new(backend.clone()),
    );
    ctx.add_dataset(desc);

    let copy: Arc<dyn FrameProcessor> = Arc::new(FnProcessor::new(
        "copy",
        |_ctx: &FrameContext<'_>, inputs: Vec<ArrayD<f32>>| -> anyhow::Result<FrameOutput> {
            Ok(FrameOutput::Single(inputs[0].clone()))
        },
    ));
    let pipeline = Pipeline::new().stage(
        Stage::new("windows", copy)
            .input(StageInput::new("line", PatternName::Spectrum))
            .output(StageOutput::new("windows", PatternName::Spectrum))
            .max_frames(4, 1)
            .fixed_length(true),
    );
    pipeline.run(&mut ctx).unwrap();

    let out = backend.snapshot("windows").unwrap();
    assert_eq!(out.shape(), &[18, 4]);
    let expected_rows = [1, 2, 3, 2, 3, 4, 3, 4, 5, 4, 5, 6, 5, 6, 7, 6, 7, 8];
    for (r, &src) in expected_rows.iter().enumerate() {
        assert_eq!(out.index_axis(Axis(0), r), data.index_axis(Axis(0), src));
    }
}

#[test]
fn test_resume_mid_stage() {
    let dir = tempfile::tempdir().unwrap();
    let state = CheckpointState {
        completed_plugins: 2,
        transfer_idx: 1,
        process_idx: 0,
        ..CheckpointState::default()
    };
    std::fs::write(
        dir.path().join("checkpoint.0.json"),
        serde_json::to_string(&state).unwrap(),
    )
    .unwrap();

    let shape = [4, 3, 5];
    let backend = InMemoryBackend::new();
    let stored = ramp(&shape);
    backend.insert("raw", ArrayD::zeros(IxDyn(&shape))).unwrap();
    backend.insert("b", stored.clone()).unwrap();
    backend.insert("c", ArrayD::zeros(IxDyn(&shape))).unwrap();

    let mut raw = DatasetDescriptor::new("raw", &shape, Dtype::Float32);
    let (core, slice) = layouts::PROJECTION;
    raw.add_pattern(PatternName::Projection, core, slice).unwrap();

    let checkpointer = FileCheckpointer::new(dir.path(), 0, CancellationToken::default()).unwrap();
    let mut ctx = PipelineContext::new(
        EngineConfig::default(),
        Arc::new(SingleProcess),
        Arc::new(backend.clone()),
    )
    .with_checkpointer(Arc::new(checkpointer));
    ctx.add_dataset(raw);

    let skipped: Arc<dyn FrameProcessor> = Arc::new(FnProcessor::new(
        "skipped",
        |_ctx: &FrameContext<'_>, _inputs: Vec<ArrayD<f32>>| -> anyhow::Result<FrameOutput> {
            anyhow::bail!("completed stage was run again")
        },
    ));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder: Arc<dyn FrameProcessor> = Arc::new(FnProcessor::new("record", {
        let seen = seen.clone();
        move |ctx: &FrameContext<'_>, inputs: Vec<ArrayD<f32>>| -> anyhow::Result<FrameOutput> {
            seen.lock().unwrap().push((ctx.transfer_idx, ctx.process_idx));
            Ok(FrameOutput::Single(inputs[0].mapv(|v| v + 1.0)))
        }
    }));

    let stage = |name: &str, from: &str, to: &str, processor: &Arc<dyn FrameProcessor>| {
        Stage::new(name, processor.clone())
            .input(StageInput::new(from, PatternName::Projection))
            .output(StageOutput::new(to, PatternName::Projection))
    };
    let pipeline = Pipeline::new()
        .stage(stage("zero", "raw", "a", &skipped))
        .stage(stage("one", "a", "b", &skipped))
        .stage(stage("two", "b", "c", &recorder));

    let outcome = pipeline.run(&mut ctx).unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            stages_run: 1,
            frames: 3
        }
    );
    assert_eq!(*seen.lock().unwrap(), vec![(1, 0), (2, 0), (3, 0)]);

    let out = backend.snapshot("c").unwrap();
    assert!(out.index_axis(Axis(0), 0).iter().all(|&v| v == 0.0));
    for t in 1..4 {
        assert_eq!(
            out.index_axis(Axis(0), t),
            stored.index_axis(Axis(0), t).mapv(|v| v + 1.0)
        );
    }
    assert!(backend.open_dataset("a").is_err());
}
