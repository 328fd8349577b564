//! Pattern-driven slicing and transfer of N-dimensional datasets.
//!
//! Provides:
//! - Patterns and dataset descriptors (which dimensions form a frame)
//! - Preview resolution (cropping, striding and windowed sampling)
//! - Chunk planning for on-disk layouts under a byte budget
//! - Per-rank slice lists at frame, process and transfer granularity
//! - Halo padding with edge replication
//! - Storage backends (Zarr on disk, in memory, caller supplied)
//! - Barriers, checkpointing and the per-stage transfer loop
//!
//! ```text
//!   DatasetDescriptor + Pattern + PreviewSpec
//!          │
//!          ▼
//!   SliceListBuilder ──► SliceLists (frames / process / transfer)
//!          │                         │
//!   ChunkPlanner ──► StorageBackend ◄┤ pad_read / apply_pad
//!                                    ▼
//!                     TransferLoop ──► FrameProcessor ──► strip / trim ──► write
//! ```

pub mod backend;
pub mod checkpoint;
pub mod chunking;
pub mod comm;
pub mod config;
pub mod dataset;
pub mod error;
pub mod padding;
pub mod pattern;
pub mod pipeline;
pub mod preview;
pub mod progress;
pub mod slicing;
pub mod transport;
pub mod types;

pub use backend::{build_backend, ExternalBackend, InMemoryBackend, StorageBackend, ZarrBackend};
pub use checkpoint::{CancellationToken, CheckpointState, Checkpointer, FileCheckpointer, NoCheckpoint};
pub use chunking::{ChunkPlan, ChunkPlanner, PatternAccess};
pub use comm::{Communicator, SingleProcess, ThreadCommunicator, ThreadGroup};
pub use config::{BackendKind, EngineConfig};
pub use dataset::{DatasetDescriptor, DatasetMeta};
pub use error::{Result, SlabError};
pub use padding::{apply_pad, pad_read, strip_pad, trim_excess, Pad, PaddedRead, PaddingDirective};
pub use pattern::{Pattern, PatternName};
pub use pipeline::{Pipeline, PipelineContext, RunOutcome, Stage, StageInput, StageOutput};
pub use preview::{resolve as resolve_preview, DimPreview, PreviewSpec};
pub use progress::{ProgressReporter, RecordingProgress, TracingProgress};
pub use slicing::{SliceListBuilder, SliceLists, TransferBatch};
pub use transport::{
    FnProcessor, FrameContext, FrameOutput, FrameProcessor, LoopOutcome, ResumePoint,
    TransferInput, TransferLoop, TransferOutput,
};
pub use types::{AxisLabel, DimSlice, Dtype, SliceTuple};
