//! Collective synchronisation between ranks.
//!
//! Ranks compute their own slice lists independently, so the only
//! coordination needed is a tagged barrier before shared datasets are
//! created, opened or closed, and a collective OR for kill agreement.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Result, SlabError};

/// Group of ranks taking part in a run.
pub trait Communicator: Send + Sync {
    /// This rank's index in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Block until every rank reaches a barrier with the same tag.
    fn barrier(&self, tag: &str) -> Result<()>;

    /// Barrier that also returns the OR of every rank's `flag`.
    fn any(&self, tag: &str, flag: bool) -> Result<bool>;
}

/// A group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self, _tag: &str) -> Result<()> {
        Ok(())
    }

    fn any(&self, _tag: &str, flag: bool) -> Result<bool> {
        Ok(flag)
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    generation: u64,
    arrived: usize,
    tag: String,
    flag: bool,
    mismatch: Option<String>,
    last_flag: bool,
    last_mismatch: Option<String>,
    broken: bool,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

/// Ranks running as threads of one process.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Create a group of `size` ranks whose barriers give up after `timeout`.
    pub fn new(size: usize, timeout: Duration) -> Result<Self> {
        if size == 0 {
            return Err(SlabError::Config("thread group needs at least one rank".to_string()));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                size,
                timeout,
                state: Mutex::new(BarrierState::default()),
                cvar: Condvar::new(),
            }),
        })
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<ThreadCommunicator> {
        (0..self.shared.size)
            .map(|rank| ThreadCommunicator {
                rank,
                shared: self.shared.clone(),
            })
            .collect()
    }
}

/// One rank's handle on a [`ThreadGroup`].
#[derive(Debug, Clone)]
pub struct ThreadCommunicator {
    rank: usize,
    shared: Arc<Shared>,
}

fn poisoned() -> SlabError {
    SlabError::communication("barrier lock poisoned")
}

impl ThreadCommunicator {
    fn collective(&self, tag: &str, flag: bool) -> Result<bool> {
        let shared = &self.shared;
        let mut state = shared.state.lock().map_err(|_| poisoned())?;
        if state.broken {
            return Err(SlabError::communication(format!(
                "rank {} entered barrier '{}' after the group was broken by a timeout",
                self.rank, tag
            )));
        }

        if state.arrived == 0 {
            state.tag = tag.to_string();
            state.flag = false;
            state.mismatch = None;
        } else if state.tag != tag && state.mismatch.is_none() {
            state.mismatch = Some(format!(
                "rank {} reached '{}' while others wait on '{}'",
                self.rank, tag, state.tag
            ));
        }
        state.flag |= flag;
        state.arrived += 1;
        let generation = state.generation;

        if state.arrived == shared.size {
            state.arrived = 0;
            state.generation += 1;
            state.last_flag = state.flag;
            state.last_mismatch = state.mismatch.take();
            shared.cvar.notify_all();
            debug!(rank = self.rank, tag = tag, "Barrier released");
        } else {
            let deadline = Instant::now() + shared.timeout;
            while state.generation == generation {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    state.broken = true;
                    shared.cvar.notify_all();
                    warn!(rank = self.rank, tag = tag, "Barrier timed out");
                    return Err(SlabError::BarrierTimeout {
                        tag: tag.to_string(),
                        rank: self.rank,
                    });
                }
                let (guard, _) = shared
                    .cvar
                    .wait_timeout(state, remaining)
                    .map_err(|_| poisoned())?;
                state = guard;
                if state.broken && state.generation == generation {
                    return Err(SlabError::BarrierTimeout {
                        tag: tag.to_string(),
                        rank: self.rank,
                    });
                }
            }
        }

        match &state.last_mismatch {
            Some(message) => Err(SlabError::BarrierMismatch(message.clone())),
            None => Ok(state.last_flag),
        }
    }
}

impl Communicator for ThreadCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn barrier(&self, tag: &str) -> Result<()> {
        self.collective(tag, false).map(|_| ())
    }

    fn any(&self, tag: &str, flag: bool) -> Result<bool> {
        self.collective(tag, flag)
    }
}
