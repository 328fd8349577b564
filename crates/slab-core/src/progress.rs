//! Progress reporting.

use std::sync::Mutex;

use tracing::info;

/// Receives percent-complete updates as batches are written back.
pub trait ProgressReporter: Send + Sync {
    fn report_progress(&self, stage: &str, percent: f32);
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgress {
    rank: usize,
}

impl TracingProgress {
    pub fn new(rank: usize) -> Self {
        Self { rank }
    }
}

impl ProgressReporter for TracingProgress {
    fn report_progress(&self, stage: &str, percent: f32) {
        info!(rank = self.rank, stage = stage, percent = percent, "Stage progress");
    }
}

/// Keeps every update, for inspection in tests and by embedding callers.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<(String, f32)>>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<(String, f32)> {
        self.updates.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

impl ProgressReporter for RecordingProgress {
    fn report_progress(&self, stage: &str, percent: f32) {
        if let Ok(mut updates) = self.updates.lock() {
            updates.push((stage.to_string(), percent));
        }
    }
}
