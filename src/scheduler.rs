//! Per-scenario dispatch.
//!
//! Every scenario gets one [`ScenarioRunner`] driving a fixed-interval tick
//! loop. Arrival-rate executors start `floor(integral of the rate curve)`
//! iterations by each tick, so the cumulative count tracks the curve with no
//! rounding drift. VU-driven executors instead keep the number of looping VUs
//! at the curve's current target.
//!
//! Iterations run as tasks in a [`JoinSet`]. When dispatching ends, tasks get
//! the scenario's graceful stop to finish; whatever is left is aborted and
//! recorded as dropped.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::load_models::{LoadModel, RampSchedule};
use crate::metrics::Recorder;
use crate::vu_pool::{PooledVu, VuPool};
use crate::worker::IterationExecutor;

/// Default scheduling granularity.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(50);

// Absorbs float error when the integral lands exactly on a whole iteration.
const ARRIVAL_EPSILON: f64 = 1e-9;

/// What one scenario did, for the run report.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub name: String,
    pub executor: String,
    pub start_offset_ms: u64,
    /// Offset from run start of the first dispatched iteration.
    pub first_dispatch_ms: Option<u64>,
    /// Time from scenario start until the pool was torn down.
    pub active_ms: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub aborted: u64,
    pub peak_vus: u64,
    pub max_vus: u64,
    pub vus_spawned: u64,
    /// Completed iterations per second of active time.
    pub achieved_rate: f64,
    /// Longest delay between an iteration falling due and starting.
    pub max_start_lag_ms: f64,
    pub interrupted: bool,
    pub skipped: bool,
    /// The hard run deadline cut this scenario off before it drained.
    pub deadline_aborted: bool,
}

impl ScenarioSummary {
    /// Summary of a scenario that never started because the run was stopped first.
    pub fn skipped(name: &str, load_model: &LoadModel, start_offset: Duration) -> Self {
        Self {
            name: name.to_string(),
            executor: load_model.kind().to_string(),
            start_offset_ms: start_offset.as_millis() as u64,
            first_dispatch_ms: None,
            active_ms: 0,
            dispatched: 0,
            completed: 0,
            failed: 0,
            dropped: 0,
            aborted: 0,
            peak_vus: 0,
            max_vus: load_model.pool_bounds().1,
            vus_spawned: 0,
            achieved_rate: 0.0,
            max_start_lag_ms: 0.0,
            interrupted: true,
            skipped: true,
            deadline_aborted: false,
        }
    }

    /// How the scenario ended, as shown in the summary table.
    pub fn state(&self) -> &'static str {
        if self.deadline_aborted {
            "deadline-aborted"
        } else if self.skipped {
            "skipped"
        } else if self.interrupted {
            "interrupted"
        } else {
            "complete"
        }
    }

    /// Summary of a scenario whose task was aborted at the hard run deadline.
    ///
    /// Must be called after that task has been joined. Iterations still in
    /// flight are recorded as dropped and the pool is closed.
    pub fn deadline_aborted(
        executor: &IterationExecutor,
        pool: &VuPool,
        recorder: &Recorder,
        run_start: Instant,
    ) -> Self {
        let aborted = executor.record_aborted(recorder);
        pool.close();
        let began = run_start + executor.scenario().start_time;
        let mut summary = Self::collect(
            executor,
            pool,
            recorder,
            run_start,
            Instant::now().saturating_duration_since(began),
            aborted,
            true,
        );
        summary.deadline_aborted = true;
        summary
    }

    /// Reads the final counters of a scenario whose pool is closed and adds
    /// its peak occupancy to `vus_max`.
    fn collect(
        executor: &IterationExecutor,
        pool: &VuPool,
        recorder: &Recorder,
        run_start: Instant,
        active: Duration,
        aborted: u64,
        interrupted: bool,
    ) -> Self {
        let scenario = executor.scenario();
        let stats = pool.stats();
        recorder.add(executor.builtins().vus_max, stats.peak_in_use);

        let progress = executor.progress();
        Self {
            name: scenario.name.clone(),
            executor: scenario.load_model.kind().to_string(),
            start_offset_ms: scenario.start_time.as_millis() as u64,
            first_dispatch_ms: progress
                .first_dispatch()
                .map(|at| at.duration_since(run_start).as_millis() as u64),
            active_ms: active.as_millis() as u64,
            dispatched: progress.dispatched(),
            completed: progress.completed(),
            failed: progress.failed(),
            dropped: progress.dropped(),
            aborted,
            peak_vus: stats.peak_in_use,
            max_vus: stats.max,
            vus_spawned: stats.spawned,
            achieved_rate: if active.is_zero() {
                0.0
            } else {
                progress.completed() as f64 / active.as_secs_f64()
            },
            max_start_lag_ms: progress.max_start_lag().as_secs_f64() * 1000.0,
            interrupted,
            skipped: false,
            deadline_aborted: false,
        }
    }
}

#[derive(Default)]
struct VuLoop {
    stop: AtomicBool,
    exited: AtomicBool,
}

/// Drives one scenario from its first tick until its pool is torn down.
pub struct ScenarioRunner {
    executor: Arc<IterationExecutor>,
    pool: Arc<VuPool>,
    recorder: Recorder,
    tick: Duration,
    shutdown: watch::Receiver<bool>,
    run_start: Instant,
    tasks: JoinSet<()>,
    drop_warned: bool,
}

impl ScenarioRunner {
    pub fn new(
        executor: Arc<IterationExecutor>,
        pool: Arc<VuPool>,
        recorder: Recorder,
        tick: Duration,
        shutdown: watch::Receiver<bool>,
        run_start: Instant,
    ) -> Self {
        Self {
            executor,
            pool,
            recorder,
            tick: tick.max(Duration::from_millis(1)),
            shutdown,
            run_start,
            tasks: JoinSet::new(),
            drop_warned: false,
        }
    }

    pub async fn run(mut self) -> ScenarioSummary {
        let scenario = Arc::clone(self.executor.scenario());
        let started = Instant::now();
        info!(
            scenario = %scenario.name,
            executor = %scenario.load_model.kind(),
            max_vus = self.pool.max(),
            duration = ?scenario.load_model.duration(),
            "Scenario starting"
        );

        let interrupted = match &scenario.load_model {
            LoadModel::ConstantArrivalRate { .. } | LoadModel::RampingArrivalRate { .. } => {
                match scenario.load_model.rate_schedule() {
                    Some(schedule) => self.dispatch_arrivals(&schedule).await,
                    None => false,
                }
            }
            LoadModel::SharedIterations { iterations, .. } => {
                let budget = Arc::new(AtomicU64::new(*iterations));
                match scenario.load_model.vu_schedule() {
                    Some(schedule) => self.drive_vus(&schedule, Some(budget)).await,
                    None => false,
                }
            }
            LoadModel::RampingVus { .. } | LoadModel::ConstantVus { .. } => {
                match scenario.load_model.vu_schedule() {
                    Some(schedule) => self.drive_vus(&schedule, None).await,
                    None => false,
                }
            }
        };

        let aborted = self.drain(scenario.graceful_stop).await;
        self.pool.close();

        let summary = ScenarioSummary::collect(
            &self.executor,
            &self.pool,
            &self.recorder,
            self.run_start,
            started.elapsed(),
            aborted,
            interrupted,
        );

        info!(
            scenario = %summary.name,
            dispatched = summary.dispatched,
            completed = summary.completed,
            failed = summary.failed,
            dropped = summary.dropped,
            aborted = summary.aborted,
            peak_vus = summary.peak_vus,
            "Scenario finished"
        );
        summary
    }

    /// Waits for the next tick. Returns `true` if the run was asked to stop.
    async fn wait_tick(&mut self, at: Instant) -> bool {
        if *self.shutdown.borrow() {
            return true;
        }
        tokio::select! {
            _ = time::sleep_until(at) => *self.shutdown.borrow(),
            changed = self.shutdown.changed() => match changed {
                Ok(()) if *self.shutdown.borrow() => true,
                // Sender gone or flag cleared: nobody can stop us any more.
                _ => {
                    time::sleep_until(at).await;
                    false
                }
            },
        }
    }

    /// Rate-based dispatch. Returns `true` if interrupted.
    async fn dispatch_arrivals(&mut self, schedule: &RampSchedule) -> bool {
        let start = Instant::now();
        let total = schedule.total_duration();
        let mut handled: u64 = 0;
        let mut next_tick = start;

        loop {
            if self.wait_tick(next_tick).await {
                return true;
            }

            let elapsed = start.elapsed().min(total);
            let due_total = (schedule.integral_to(elapsed) + ARRIVAL_EPSILON).floor() as u64;
            let now = Instant::now();

            while handled < due_total {
                handled += 1;
                let due = schedule
                    .time_for_integral(handled as f64)
                    .map(|offset| (start + offset).min(now))
                    .unwrap_or(now);
                let iteration = self.executor.schedule(due);
                match self.pool.acquire() {
                    Ok(lease) => {
                        self.executor.mark_dispatched();
                        let executor = Arc::clone(&self.executor);
                        self.tasks.spawn(async move {
                            let mut lease = lease;
                            executor.run(lease.vu_mut(), iteration).await;
                        });
                    }
                    Err(e) => {
                        self.executor.record_dropped(&self.recorder, iteration);
                        if !self.drop_warned {
                            self.drop_warned = true;
                            warn!(
                                scenario = %self.executor.scenario_name(),
                                error = %e,
                                "Dropping iterations: no free virtual user"
                            );
                        } else {
                            debug!(scenario = %self.executor.scenario_name(), "Dropped iteration");
                        }
                    }
                }
            }

            self.reap();

            if elapsed >= total {
                return false;
            }
            next_tick += self.tick;
        }
    }

    /// VU-driven dispatch: keeps `target_at(elapsed)` VUs looping. With a
    /// budget, loops stop once it is spent. Returns `true` if interrupted.
    async fn drive_vus(&mut self, schedule: &RampSchedule, budget: Option<Arc<AtomicU64>>) -> bool {
        let start = Instant::now();
        let mut loops: Vec<Arc<VuLoop>> = Vec::new();
        let mut next_tick = start;
        let mut interrupted = false;

        loop {
            if self.wait_tick(next_tick).await {
                interrupted = true;
                break;
            }

            let elapsed = start.elapsed();
            if schedule.is_done(elapsed) {
                break;
            }

            self.reap();
            loops.retain(|l| !l.exited.load(Ordering::Relaxed));

            let budget_spent = budget
                .as_ref()
                .is_some_and(|b| b.load(Ordering::Relaxed) == 0);
            if budget_spent && loops.is_empty() {
                debug!(scenario = %self.executor.scenario_name(), "Iteration budget spent");
                break;
            }

            let target = if budget_spent {
                loops.len()
            } else {
                schedule.target_at(elapsed).round().max(0.0) as usize
            };

            while loops.len() < target {
                match self.pool.acquire() {
                    Ok(lease) => loops.push(self.spawn_loop(lease, budget.clone())),
                    Err(e) => {
                        debug!(scenario = %self.executor.scenario_name(), error = %e, "Cannot add virtual user");
                        break;
                    }
                }
            }
            while loops.len() > target {
                if let Some(l) = loops.pop() {
                    // Finishes its current iteration, then returns the VU.
                    l.stop.store(true, Ordering::Relaxed);
                }
            }

            next_tick += self.tick;
        }

        for l in &loops {
            l.stop.store(true, Ordering::Relaxed);
        }
        interrupted
    }

    fn spawn_loop(&mut self, lease: PooledVu, budget: Option<Arc<AtomicU64>>) -> Arc<VuLoop> {
        let handle = Arc::new(VuLoop::default());
        let control = Arc::clone(&handle);
        let executor = Arc::clone(&self.executor);

        self.tasks.spawn(async move {
            let mut lease = lease;
            while !control.stop.load(Ordering::Relaxed) {
                if let Some(budget) = &budget {
                    let claimed = budget
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                        .is_ok();
                    if !claimed {
                        break;
                    }
                }
                executor.mark_dispatched();
                let iteration = executor.schedule(Instant::now());
                executor.run(lease.vu_mut(), iteration).await;
                tokio::task::yield_now().await;
            }
            control.exited.store(true, Ordering::Relaxed);
        });

        handle
    }

    fn reap(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.check_join(joined);
        }
    }

    fn check_join(&self, joined: Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(scenario = %self.executor.scenario_name(), error = %e, "Iteration task panicked");
            }
        }
    }

    /// Waits up to `grace` for in-flight tasks, then aborts the rest.
    /// Returns the number of iterations aborted.
    async fn drain(&mut self, grace: Duration) -> u64 {
        if self.tasks.is_empty() {
            return 0;
        }

        debug!(
            scenario = %self.executor.scenario_name(),
            in_flight = self.tasks.len(),
            grace = ?grace,
            "Draining in-flight iterations"
        );

        let deadline = Instant::now() + grace;
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    Some(joined) => self.check_join(joined),
                    None => return 0,
                },
                _ = time::sleep_until(deadline) => break,
            }
        }

        let tasks = self.tasks.len();
        self.tasks.abort_all();
        while let Some(joined) = self.tasks.join_next().await {
            self.check_join(joined);
        }

        let aborted = self.executor.record_aborted(&self.recorder);
        warn!(
            scenario = %self.executor.scenario_name(),
            tasks,
            aborted,
            "Grace period expired; aborted in-flight iterations"
        );
        aborted
    }
}
