//! Bounded pool of virtual users for one scenario.
//!
//! `pre_allocated` VUs are created up front; more are created on demand up to
//! `max`. Acquisition never blocks: when every VU is busy and the pool is at
//! its ceiling the caller gets [`AcquireError::Exhausted`] and decides what to
//! do (the arrival-rate scheduler records a dropped iteration).
//!
//! A leased VU is returned to the pool when its [`PooledVu`] guard is dropped,
//! including when the task holding it is aborted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::debug;

use crate::metrics::{MetricsAggregator, Recorder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    Idle,
    Running,
    Stopped,
}

/// One simulated user. Carries its own iteration counter and a metrics
/// recorder pinned to a single shard.
pub struct VirtualUser {
    id: u64,
    state: VuState,
    iterations: u64,
    recorder: Recorder,
}

impl VirtualUser {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> VuState {
        self.state
    }

    /// Iterations this VU has started so far.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Claims the next per-VU iteration number, starting at 0.
    pub fn next_iteration(&mut self) -> u64 {
        let n = self.iterations;
        self.iterations += 1;
        n
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("all {max} virtual users are busy")]
    Exhausted { max: u64 },

    #[error("virtual user pool is closed")]
    Closed,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub spawned: u64,
    pub idle: u64,
    pub in_use: u64,
    pub peak_in_use: u64,
    pub max: u64,
}

struct PoolState {
    idle: Vec<VirtualUser>,
    spawned: u64,
    in_use: u64,
    peak_in_use: u64,
    closed: bool,
}

pub struct VuPool {
    scenario: String,
    max: u64,
    metrics: Arc<MetricsAggregator>,
    ids: Arc<AtomicU64>,
    state: Mutex<PoolState>,
}

impl VuPool {
    /// `ids` is shared by every pool of a run so VU ids are unique run-wide.
    pub fn new(
        scenario: impl Into<String>,
        pre_allocated: u64,
        max: u64,
        metrics: Arc<MetricsAggregator>,
        ids: Arc<AtomicU64>,
    ) -> Arc<Self> {
        let pool = Self {
            scenario: scenario.into(),
            max: max.max(pre_allocated),
            metrics,
            ids,
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(pre_allocated as usize),
                spawned: 0,
                in_use: 0,
                peak_in_use: 0,
                closed: false,
            }),
        };

        {
            let mut state = pool.lock();
            for _ in 0..pre_allocated {
                let vu = pool.spawn_vu();
                state.idle.push(vu);
                state.spawned += 1;
            }
        }

        debug!(
            scenario = %pool.scenario,
            pre_allocated,
            max = pool.max,
            "Virtual user pool created"
        );
        Arc::new(pool)
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_vu(&self) -> VirtualUser {
        VirtualUser {
            id: self.ids.fetch_add(1, Ordering::Relaxed) + 1,
            state: VuState::Idle,
            iterations: 0,
            recorder: self.metrics.recorder(),
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Leases an idle VU, creating one if the pool is below its ceiling.
    pub fn acquire(self: &Arc<Self>) -> Result<PooledVu, AcquireError> {
        let mut state = self.lock();
        if state.closed {
            return Err(AcquireError::Closed);
        }

        let mut vu = match state.idle.pop() {
            Some(vu) => vu,
            None if state.spawned < self.max => {
                state.spawned += 1;
                let vu = self.spawn_vu();
                debug!(scenario = %self.scenario, vu_id = vu.id, spawned = state.spawned, "Spawned virtual user");
                vu
            }
            None => return Err(AcquireError::Exhausted { max: self.max }),
        };

        state.in_use += 1;
        state.peak_in_use = state.peak_in_use.max(state.in_use);
        vu.state = VuState::Running;

        Ok(PooledVu {
            vu: Some(vu),
            pool: Arc::clone(self),
        })
    }

    fn release(&self, mut vu: VirtualUser) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        if state.closed {
            vu.state = VuState::Stopped;
            return;
        }
        vu.state = VuState::Idle;
        state.idle.push(vu);
    }

    /// Stops every idle VU and refuses further leases. VUs still leased are
    /// stopped as they come back.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for vu in state.idle.iter_mut() {
            vu.state = VuState::Stopped;
        }
        let stopped = state.idle.len();
        state.idle.clear();
        debug!(scenario = %self.scenario, stopped, in_use = state.in_use, "Virtual user pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            spawned: state.spawned,
            idle: state.idle.len() as u64,
            in_use: state.in_use,
            peak_in_use: state.peak_in_use,
            max: self.max,
        }
    }
}

/// A leased VU. Dropping it returns the VU to its pool.
pub struct PooledVu {
    vu: Option<VirtualUser>,
    pool: Arc<VuPool>,
}

impl std::fmt::Debug for PooledVu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledVu")
            .field("vu_id", &self.vu.as_ref().map(|vu| vu.id))
            .finish_non_exhaustive()
    }
}

impl PooledVu {
    pub fn vu(&self) -> &VirtualUser {
        self.vu.as_ref().unwrap_or_else(|| unreachable!("VU taken before drop"))
    }

    pub fn vu_mut(&mut self) -> &mut VirtualUser {
        self.vu.as_mut().unwrap_or_else(|| unreachable!("VU taken before drop"))
    }
}

impl Drop for PooledVu {
    fn drop(&mut self) {
        if let Some(vu) = self.vu.take() {
            self.pool.release(vu);
        }
    }
}
