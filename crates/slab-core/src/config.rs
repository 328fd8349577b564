//! Configuration for the slicing and transfer engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration shared by every rank of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target size of one storage chunk in bytes.
    pub byte_budget: usize,

    /// Default frames per transfer batch.
    pub max_transfer_frames: usize,

    /// Default frames per processing call.
    pub max_process_frames: usize,

    /// Chunk edge used when the next reader is a volume pattern.
    /// `None` plans volume outputs like any other pattern.
    pub volume_chunk_edge: Option<usize>,

    /// Halve a chunk dimension when the dataset has fewer chunks than ranks.
    pub lustre_workaround: bool,

    /// Seconds a rank waits at a barrier before giving up.
    pub barrier_timeout_secs: u64,

    /// Storage backend for stage outputs.
    pub backend: BackendKind,

    /// Root directory for on-disk stores and checkpoint files.
    pub out_path: PathBuf,

    /// Interval after which the run checkpoints and stops.
    pub checkpoint_interval_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            byte_budget: 1_000_000,
            max_transfer_frames: 1,
            max_process_frames: 1,
            volume_chunk_edge: Some(62),
            lustre_workaround: false,
            barrier_timeout_secs: 300,
            backend: BackendKind::Zarr,
            out_path: PathBuf::from("./slab-out"),
            checkpoint_interval_secs: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `SLAB_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SLAB_BYTE_BUDGET") {
            if let Ok(size) = val.parse() {
                self.byte_budget = size;
            }
        }

        if let Ok(val) = std::env::var("SLAB_MAX_TRANSFER_FRAMES") {
            if let Ok(frames) = val.parse() {
                self.max_transfer_frames = frames;
            }
        }

        if let Ok(val) = std::env::var("SLAB_MAX_PROCESS_FRAMES") {
            if let Ok(frames) = val.parse() {
                self.max_process_frames = frames;
            }
        }

        if let Ok(val) = std::env::var("SLAB_VOLUME_CHUNK_EDGE") {
            if val.eq_ignore_ascii_case("none") {
                self.volume_chunk_edge = None;
            } else if let Ok(edge) = val.parse() {
                self.volume_chunk_edge = Some(edge);
            }
        }

        if let Ok(val) = std::env::var("SLAB_LUSTRE_WORKAROUND") {
            self.lustre_workaround = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("SLAB_BARRIER_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                self.barrier_timeout_secs = secs;
            }
        }

        if let Ok(val) = std::env::var("SLAB_BACKEND") {
            self.backend = BackendKind::from_str(&val);
        }

        if let Ok(val) = std::env::var("SLAB_OUT_PATH") {
            self.out_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("SLAB_CHECKPOINT_INTERVAL_SECS") {
            if let Ok(secs) = val.parse() {
                self.checkpoint_interval_secs = Some(secs);
            }
        }

        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.byte_budget == 0 {
            return Err("byte_budget must be > 0".to_string());
        }

        if self.max_transfer_frames == 0 {
            return Err("max_transfer_frames must be > 0".to_string());
        }

        if self.max_process_frames == 0 {
            return Err("max_process_frames must be > 0".to_string());
        }

        if self.volume_chunk_edge == Some(0) {
            return Err("volume_chunk_edge must be > 0".to_string());
        }

        if self.barrier_timeout_secs == 0 {
            return Err("barrier_timeout_secs must be > 0".to_string());
        }

        Ok(())
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_secs(self.barrier_timeout_secs)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_secs.map(Duration::from_secs)
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Chunked on-disk arrays.
    #[default]
    Zarr,
    /// Process-local arrays shared between in-process ranks.
    InMemory,
    /// Backend supplied by the caller.
    External,
}

impl BackendKind {
    /// Parse from string (case-insensitive), falling back to Zarr.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "in_memory" | "inmemory" | "memory" => Self::InMemory,
            "external" => Self::External,
            _ => Self::Zarr,
        }
    }

    /// Get the backend name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zarr => "zarr",
            Self::InMemory => "in_memory",
            Self::External => "external",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
