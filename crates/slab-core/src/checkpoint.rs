//! Cooperative checkpoint-and-kill.
//!
//! A [`CancellationToken`] is polled at stage boundaries and between transfer
//! batches. When it fires, the current position is persisted through a
//! [`Checkpointer`] and the run stops; a later invocation resumes from the
//! saved `(completed_plugins, transfer_idx, process_idx)` triple.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dataset::DatasetMeta;
use crate::error::{Result, SlabError};

/// Shared kill flag with an optional checkpoint interval.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    started: Instant,
    interval: Option<Duration>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CancellationToken {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            interval,
        }
    }

    /// Request a checkpoint at the next yield point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True once cancelled or once the interval has elapsed.
    pub fn is_time_to_checkpoint(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        match self.interval {
            Some(interval) => self.started.elapsed() >= interval,
            None => false,
        }
    }
}

/// Persisted progress of one rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub completed_plugins: usize,
    pub transfer_idx: usize,
    pub process_idx: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub written_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub datasets: Vec<DatasetMeta>,
}

impl CheckpointState {
    /// Whether the checkpoint was taken part-way through stage `stage`.
    pub fn is_mid_stage(&self, stage: usize) -> bool {
        self.completed_plugins == stage && (self.transfer_idx > 0 || self.process_idx > 0)
    }
}

/// Persists and restores run progress.
pub trait Checkpointer: Send + Sync {
    /// Whether the run should checkpoint and stop at the next yield point.
    fn is_time_to_checkpoint(&self) -> bool;

    /// Record a position inside the current stage.
    fn write_checkpoint(&self, transfer_idx: usize, process_idx: usize) -> Result<()>;

    /// Record that `completed_plugins` stages have finished.
    fn write_completed(&self, completed_plugins: usize) -> Result<()>;

    /// Dataset metadata stored with the next write.
    fn record_datasets(&self, _datasets: Vec<DatasetMeta>) {}

    /// Last persisted state, or the default when none exists.
    fn read_checkpoint(&self) -> Result<CheckpointState>;
}

/// Checkpointing disabled.
#[derive(Debug, Clone, Default)]
pub struct NoCheckpoint {
    token: CancellationToken,
}

impl NoCheckpoint {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Checkpointer for NoCheckpoint {
    fn is_time_to_checkpoint(&self) -> bool {
        self.token.is_cancelled()
    }

    fn write_checkpoint(&self, _transfer_idx: usize, _process_idx: usize) -> Result<()> {
        Ok(())
    }

    fn write_completed(&self, _completed_plugins: usize) -> Result<()> {
        Ok(())
    }

    fn read_checkpoint(&self) -> Result<CheckpointState> {
        Ok(CheckpointState::default())
    }
}

/// One JSON file per rank, `checkpoint.<rank>.json` under a directory.
#[derive(Debug)]
pub struct FileCheckpointer {
    path: PathBuf,
    token: CancellationToken,
    state: Mutex<CheckpointState>,
}

impl FileCheckpointer {
    /// Checkpointer for `rank`, loading any state already on disk.
    pub fn new(dir: impl AsRef<Path>, rank: usize, token: CancellationToken) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| SlabError::checkpoint(format!("cannot create {}: {}", dir.display(), e)))?;
        let path = dir.join(format!("checkpoint.{}.json", rank));
        let state = Self::load(&path)?;
        Ok(Self {
            path,
            token,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> Result<CheckpointState> {
        if !path.exists() {
            return Ok(CheckpointState::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| SlabError::checkpoint(format!("cannot read {}: {}", path.display(), e)))?;
        let state: CheckpointState = serde_json::from_str(&content)?;
        debug!(
            path = %path.display(),
            completed = state.completed_plugins,
            transfer = state.transfer_idx,
            process = state.process_idx,
            "Loaded checkpoint"
        );
        Ok(state)
    }

    fn persist(&self, update: impl FnOnce(&mut CheckpointState)) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SlabError::checkpoint("checkpoint state lock poisoned"))?;
        update(&mut state);
        state.written_at = Some(Utc::now());

        let json = serde_json::to_string_pretty(&*state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, &self.path))
            .map_err(|e| SlabError::checkpoint(format!("cannot write {}: {}", self.path.display(), e)))?;

        info!(
            path = %self.path.display(),
            completed = state.completed_plugins,
            transfer = state.transfer_idx,
            process = state.process_idx,
            "Checkpoint written"
        );
        Ok(())
    }
}

impl Checkpointer for FileCheckpointer {
    fn is_time_to_checkpoint(&self) -> bool {
        self.token.is_time_to_checkpoint()
    }

    fn write_checkpoint(&self, transfer_idx: usize, process_idx: usize) -> Result<()> {
        self.persist(|state| {
            state.transfer_idx = transfer_idx;
            state.process_idx = process_idx;
        })
    }

    fn write_completed(&self, completed_plugins: usize) -> Result<()> {
        self.persist(|state| {
            state.completed_plugins = completed_plugins;
            state.transfer_idx = 0;
            state.process_idx = 0;
        })
    }

    fn record_datasets(&self, datasets: Vec<DatasetMeta>) {
        if let Ok(mut state) = self.state.lock() {
            state.datasets = datasets;
        }
    }

    fn read_checkpoint(&self) -> Result<CheckpointState> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| SlabError::checkpoint("checkpoint state lock poisoned"))
    }
}
