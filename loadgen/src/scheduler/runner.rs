//! Virtual user scheduler
//!
//! Spawns one tokio task per virtual-user slot and keeps the number of running
//! slots in line with the ramp profile. Each slot loops over its workload with a
//! think-time pause between iterations until it is told to stop.

use super::ramp::RampProfile;
use super::signal::{StopHandle, StopListener, StopMode};
use async_trait::async_trait;
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// What a slot runs on every iteration
#[async_trait]
pub trait Workload: Send + Sync + 'static {
    /// Run one iteration for `slot`. Implementations must return promptly once
    /// `stop` reaches [`StopMode::Abort`].
    async fn iteration(&self, slot: usize, stop: &mut StopListener) -> IterationOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    /// Cut short by an abort
    Interrupted,
}

/// Lifecycle of one virtual-user slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SlotState::Idle,
            1 => SlotState::Running,
            _ => SlotState::Stopped,
        }
    }
}

/// Global scheduler lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Ramping(usize),
    SteadyOrDone,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub profile: RampProfile,
    /// Pause between iterations of one slot
    pub think_time: Duration,
    /// How long a stopped slot may keep running its current iteration.
    /// Zero stops slots mid-iteration.
    pub graceful_ramp_down: Duration,
    /// After an abort, how long to wait before killing the task outright
    pub abort_grace: Duration,
    /// Hard bound on the whole run, including shutdown
    pub run_timeout: Option<Duration>,
    /// Control loop resolution
    pub tick: Duration,
    /// Retire a slot after this many iterations
    pub iterations_per_vu: Option<u64>,
    /// Number of distinct slot indices the workload maps to. New slots reuse
    /// indices below this bound before going past it.
    pub pool_size: Option<usize>,
}

impl SchedulerConfig {
    pub fn new(profile: RampProfile) -> Self {
        Self {
            profile,
            think_time: Duration::from_secs(1),
            graceful_ramp_down: Duration::from_secs(30),
            abort_grace: Duration::from_secs(5),
            run_timeout: None,
            tick: Duration::from_millis(100),
            iterations_per_vu: None,
            pool_size: None,
        }
    }
}

/// Counters shared between the control loop and the slots
#[derive(Debug, Default)]
pub struct SchedulerStats {
    running: AtomicUsize,
    completed: AtomicU64,
    interrupted: AtomicU64,
}

impl SchedulerStats {
    /// Slots currently inside their run loop
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn iterations_completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn iterations_interrupted(&self) -> u64 {
        self.interrupted.load(Ordering::SeqCst)
    }
}

/// Read-only view of a scheduler while it runs
#[derive(Debug, Clone)]
pub struct SchedulerProbe {
    state: watch::Receiver<SchedulerState>,
    stats: Arc<SchedulerStats>,
}

impl SchedulerProbe {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn running(&self) -> usize {
        self.stats.running()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerReport {
    pub outcome: RunOutcome,
    pub slots_started: usize,
    pub peak_running: usize,
    pub iterations_completed: u64,
    pub iterations_interrupted: u64,
    /// Slots that ignored an abort and had to be killed
    pub slots_killed: usize,
    pub elapsed_ms: u64,
}

enum SlotExit {
    Stopped,
    /// Reached its iteration cap; keeps its place in the population
    Retired,
}

struct Slot {
    index: usize,
    stop: StopHandle,
    state: Arc<AtomicU8>,
    handle: JoinHandle<SlotExit>,
}

struct Draining {
    slot: Slot,
    /// Drain -> abort at this instant; abort -> kill at this instant
    escalate_at: Instant,
}

pub struct Scheduler {
    config: SchedulerConfig,
    state: watch::Sender<SchedulerState>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let (state, _) = watch::channel(SchedulerState::NotStarted);
        Self {
            config,
            state,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn probe(&self) -> SchedulerProbe {
        SchedulerProbe {
            state: self.state.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Drive the ramp to completion. `shutdown` carries external stop requests:
    /// drain stops the ramp gracefully, abort interrupts everything in flight.
    pub async fn run<W: Workload>(
        self,
        workload: Arc<W>,
        mut shutdown: StopListener,
    ) -> SchedulerReport {
        let start = Instant::now();
        let total = self.config.profile.total_duration();
        let deadline = self.config.run_timeout.map(|t| start + t);

        let mut active: BTreeMap<usize, Slot> = BTreeMap::new();
        let mut draining: Vec<Draining> = Vec::new();
        let mut retired: BTreeSet<usize> = BTreeSet::new();
        let mut slots_started = 0usize;
        let mut slots_killed = 0usize;
        let mut peak_running = 0usize;

        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            stages = self.config.profile.stages().len(),
            total_secs = total.as_secs_f64(),
            peak = self.config.profile.peak_target(),
            "Starting ramp"
        );

        let outcome = loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.stopping() => {
                    info!("External stop requested, ending ramp");
                    break RunOutcome::Cancelled;
                }
            }

            let now = Instant::now();
            let elapsed = now - start;

            self.reap_active(&mut active, &mut retired).await;
            slots_killed += self.service_draining(&mut draining, now).await;

            if deadline.is_some_and(|d| now >= d) {
                warn!("Run timeout reached during ramp");
                break RunOutcome::TimedOut;
            }

            let Some(stage) = self.config.profile.stage_at(elapsed) else {
                break RunOutcome::Completed;
            };
            self.state.send_replace(SchedulerState::Ramping(stage));

            let target = self.config.profile.target_at(elapsed);
            let current = active.len() + retired.len();

            if current < target {
                for _ in current..target {
                    let index =
                        next_free_index(&active, &draining, &retired, self.config.pool_size);
                    active.insert(index, self.spawn_slot(index, workload.clone()));
                    slots_started += 1;
                }
                debug!(target, "Scaled up");
            } else if current > target {
                let excess = (current - target).min(active.len());
                for _ in 0..excess {
                    if let Some((_, slot)) = active.pop_last() {
                        draining.push(self.stop_slot(slot, now));
                    }
                }
                debug!(target, "Scaled down");
            }

            peak_running = peak_running.max(active.len());
        };

        self.state.send_replace(SchedulerState::SteadyOrDone);

        // Wind down whatever is still running
        let now = Instant::now();
        let abort_all = outcome == RunOutcome::TimedOut || shutdown.is_aborted();
        for (_, slot) in std::mem::take(&mut active) {
            let mut entry = self.stop_slot(slot, now);
            if abort_all {
                self.abort_entry(&mut entry, now);
            }
            draining.push(entry);
        }
        if abort_all {
            for entry in &mut draining {
                self.abort_entry(entry, now);
            }
        }

        let mut aborted = abort_all;
        while !draining.is_empty() {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.aborted(), if !aborted => {
                    info!("External abort requested, interrupting remaining slots");
                    aborted = true;
                    let now = Instant::now();
                    for entry in &mut draining {
                        self.abort_entry(entry, now);
                    }
                }
            }

            let now = Instant::now();
            if !aborted && deadline.is_some_and(|d| now >= d) {
                warn!("Run timeout reached during shutdown, aborting slots");
                aborted = true;
                for entry in &mut draining {
                    self.abort_entry(entry, now);
                }
            }
            slots_killed += self.service_draining(&mut draining, now).await;
        }

        self.state.send_replace(SchedulerState::Finished);

        let report = SchedulerReport {
            outcome,
            slots_started,
            peak_running,
            iterations_completed: self.stats.iterations_completed(),
            iterations_interrupted: self.stats.iterations_interrupted(),
            slots_killed,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            outcome = ?report.outcome,
            slots = report.slots_started,
            completed = report.iterations_completed,
            interrupted = report.iterations_interrupted,
            "Scheduler finished"
        );
        report
    }

    fn spawn_slot<W: Workload>(&self, index: usize, workload: Arc<W>) -> Slot {
        let (stop, listener) = StopHandle::new();
        let state = Arc::new(AtomicU8::new(SlotState::Idle as u8));
        let handle = tokio::spawn(drive_slot(
            index,
            workload,
            listener,
            state.clone(),
            self.stats.clone(),
            self.config.think_time,
            self.config.iterations_per_vu,
        ));
        Slot {
            index,
            stop,
            state,
            handle,
        }
    }

    fn stop_slot(&self, slot: Slot, now: Instant) -> Draining {
        if self.config.graceful_ramp_down.is_zero() {
            slot.stop.abort();
            Draining {
                slot,
                escalate_at: now + self.config.abort_grace,
            }
        } else {
            slot.stop.drain();
            Draining {
                slot,
                escalate_at: now + self.config.graceful_ramp_down,
            }
        }
    }

    fn abort_entry(&self, entry: &mut Draining, now: Instant) {
        if entry.slot.stop.mode() != StopMode::Abort {
            entry.slot.stop.abort();
            entry.escalate_at = now + self.config.abort_grace;
        }
    }

    /// Collect finished active slots; retired ones keep their index
    async fn reap_active(&self, active: &mut BTreeMap<usize, Slot>, retired: &mut BTreeSet<usize>) {
        let finished: Vec<usize> = active
            .iter()
            .filter(|(_, slot)| slot.handle.is_finished())
            .map(|(index, _)| *index)
            .collect();

        for index in finished {
            if let Some(slot) = active.remove(&index) {
                match slot.handle.await {
                    Ok(SlotExit::Retired) => {
                        retired.insert(index);
                    }
                    Ok(SlotExit::Stopped) => {}
                    Err(e) => error!(slot = index, "Slot task failed: {}", e),
                }
            }
        }
    }

    /// Reap finished draining slots and escalate overdue ones. Returns the
    /// number of tasks killed outright.
    async fn service_draining(&self, draining: &mut Vec<Draining>, now: Instant) -> usize {
        let mut killed = 0;
        let mut still_draining = Vec::with_capacity(draining.len());

        for mut entry in draining.drain(..) {
            if entry.slot.handle.is_finished() {
                if let Err(e) = (&mut entry.slot.handle).await
                    && !e.is_cancelled()
                {
                    error!(slot = entry.slot.index, "Slot task failed: {}", e);
                }
                continue;
            }
            if now >= entry.escalate_at {
                if entry.slot.stop.mode() == StopMode::Abort {
                    warn!(
                        slot = entry.slot.index,
                        state = ?SlotState::from_u8(entry.slot.state.load(Ordering::SeqCst)),
                        "Slot ignored abort, killing task"
                    );
                    entry.slot.handle.abort();
                    killed += 1;
                    continue;
                }
                debug!(slot = entry.slot.index, "Graceful ramp-down expired, aborting slot");
                self.abort_entry(&mut entry, now);
            }
            still_draining.push(entry);
        }

        *draining = still_draining;
        killed
    }
}

/// Lowest index that is neither running nor retired. Indices inside the pool come
/// first, preferring ones no draining slot still holds.
fn next_free_index(
    active: &BTreeMap<usize, Slot>,
    draining: &[Draining],
    retired: &BTreeSet<usize>,
    pool: Option<usize>,
) -> usize {
    let free = |i: &usize| !active.contains_key(i) && !retired.contains(i);
    let idle = |i: &usize| free(i) && !draining.iter().any(|d| d.slot.index == *i);

    match pool {
        Some(pool) => (0..pool)
            .find(|i| idle(i))
            .or_else(|| (0..pool).find(|i| free(i)))
            .or_else(|| (pool..).find(|i| idle(i))),
        None => (0..).find(|i| idle(i)),
    }
    .unwrap_or(0)
}

/// Marks the slot stopped however the task ends, including abort
struct SlotGuard {
    state: Arc<AtomicU8>,
    stats: Arc<SchedulerStats>,
}

impl SlotGuard {
    fn enter(state: Arc<AtomicU8>, stats: Arc<SchedulerStats>) -> Self {
        state.store(SlotState::Running as u8, Ordering::SeqCst);
        stats.running.fetch_add(1, Ordering::SeqCst);
        gauge!("chatload_active_vus").increment(1.0);
        Self { state, stats }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.state.store(SlotState::Stopped as u8, Ordering::SeqCst);
        self.stats.running.fetch_sub(1, Ordering::SeqCst);
        gauge!("chatload_active_vus").decrement(1.0);
    }
}

async fn drive_slot<W: Workload>(
    index: usize,
    workload: Arc<W>,
    mut stop: StopListener,
    state: Arc<AtomicU8>,
    stats: Arc<SchedulerStats>,
    think_time: Duration,
    iterations_per_vu: Option<u64>,
) -> SlotExit {
    let _guard = SlotGuard::enter(state, stats.clone());
    let mut iterations = 0u64;

    loop {
        if stop.is_stopping() {
            return SlotExit::Stopped;
        }

        match workload.iteration(index, &mut stop).await {
            IterationOutcome::Completed => {
                stats.completed.fetch_add(1, Ordering::SeqCst);
                counter!("chatload_iterations_total", "outcome" => "completed").increment(1);
            }
            IterationOutcome::Interrupted => {
                stats.interrupted.fetch_add(1, Ordering::SeqCst);
                counter!("chatload_iterations_total", "outcome" => "interrupted").increment(1);
            }
        }

        iterations += 1;
        if iterations_per_vu.is_some_and(|cap| iterations >= cap) {
            debug!(slot = index, iterations, "Slot reached iteration cap");
            return SlotExit::Retired;
        }

        tokio::select! {
            _ = tokio::time::sleep(think_time) => {}
            _ = stop.stopping() => return SlotExit::Stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ramp::{RampPolicy, RampStage};

    /// Sleeps for `work` per iteration unless aborted
    struct SleepyWorkload {
        work: Duration,
    }

    #[async_trait]
    impl Workload for SleepyWorkload {
        async fn iteration(&self, _slot: usize, stop: &mut StopListener) -> IterationOutcome {
            tokio::select! {
                _ = tokio::time::sleep(self.work) => IterationOutcome::Completed,
                _ = stop.aborted() => IterationOutcome::Interrupted,
            }
        }
    }

    /// Records every slot index it is driven with
    struct RecordingWorkload {
        work: Duration,
        seen: std::sync::Mutex<BTreeSet<usize>>,
    }

    #[async_trait]
    impl Workload for RecordingWorkload {
        async fn iteration(&self, slot: usize, stop: &mut StopListener) -> IterationOutcome {
            self.seen.lock().unwrap().insert(slot);
            tokio::select! {
                _ = tokio::time::sleep(self.work) => IterationOutcome::Completed,
                _ = stop.aborted() => IterationOutcome::Interrupted,
            }
        }
    }

    /// Never finishes and ignores every stop request
    struct StubbornWorkload;

    #[async_trait]
    impl Workload for StubbornWorkload {
        async fn iteration(&self, _slot: usize, _stop: &mut StopListener) -> IterationOutcome {
            std::future::pending::<()>().await;
            IterationOutcome::Completed
        }
    }

    fn config(start: usize, stages: Vec<RampStage>, policy: RampPolicy) -> SchedulerConfig {
        let mut config = SchedulerConfig::new(RampProfile::new(start, stages, policy).unwrap());
        config.think_time = Duration::from_millis(100);
        config
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_ramp_reaches_target_by_stage_boundary() {
        let mut cfg = config(0, vec![RampStage::new(secs(10), 50)], RampPolicy::Linear);
        cfg.graceful_ramp_down = Duration::ZERO;
        let scheduler = Scheduler::new(cfg);
        let probe = scheduler.probe();
        assert_eq!(probe.state(), SchedulerState::NotStarted);
        assert_eq!(probe.running(), 0);

        let workload = Arc::new(SleepyWorkload {
            work: Duration::from_millis(200),
        });
        let (_stop, listener) = StopHandle::new();
        let run = tokio::spawn(scheduler.run(workload, listener));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.running(), 0);
        assert_eq!(probe.state(), SchedulerState::Ramping(0));

        tokio::time::sleep(Duration::from_millis(4_950)).await;
        let mid = probe.running();
        assert!((23..=25).contains(&mid), "mid-ramp running = {mid}");

        tokio::time::sleep(Duration::from_millis(4_950)).await;
        let near_end = probe.running();
        assert!((48..=50).contains(&near_end), "near boundary running = {near_end}");

        let report = run.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.peak_running >= 48);
        assert_eq!(probe.running(), 0);
        assert_eq!(probe.state(), SchedulerState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_ramp_down_interrupts_iterations() {
        let mut cfg = config(
            0,
            vec![RampStage::new(secs(1), 2), RampStage::new(secs(1), 0)],
            RampPolicy::Immediate,
        );
        cfg.graceful_ramp_down = Duration::ZERO;
        let scheduler = Scheduler::new(cfg);

        let workload = Arc::new(SleepyWorkload { work: secs(10) });
        let (_stop, listener) = StopHandle::new();
        let report = scheduler.run(workload, listener).await;

        assert_eq!(report.slots_started, 2);
        assert_eq!(report.iterations_interrupted, 2);
        assert_eq!(report.iterations_completed, 0);
        assert!(report.elapsed_ms < 3_000, "elapsed {}ms", report.elapsed_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_ramp_down_waits_for_iterations() {
        let mut cfg = config(
            0,
            vec![RampStage::new(secs(1), 2), RampStage::new(secs(1), 0)],
            RampPolicy::Immediate,
        );
        cfg.graceful_ramp_down = secs(30);
        let scheduler = Scheduler::new(cfg);

        let workload = Arc::new(SleepyWorkload { work: secs(10) });
        let (_stop, listener) = StopHandle::new();
        let report = scheduler.run(workload, listener).await;

        assert_eq!(report.iterations_completed, 2);
        assert_eq!(report.iterations_interrupted, 0);
        assert!(report.elapsed_ms >= 10_000, "elapsed {}ms", report.elapsed_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_period_expiry_aborts() {
        let mut cfg = config(
            0,
            vec![RampStage::new(secs(1), 1), RampStage::new(secs(1), 0)],
            RampPolicy::Immediate,
        );
        cfg.graceful_ramp_down = secs(2);
        let scheduler = Scheduler::new(cfg);

        let workload = Arc::new(SleepyWorkload { work: secs(60) });
        let (_stop, listener) = StopHandle::new();
        let report = scheduler.run(workload, listener).await;

        assert_eq!(report.iterations_interrupted, 1);
        assert!(report.elapsed_ms < 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout_bounds_hung_workers() {
        let mut cfg = config(0, vec![RampStage::new(secs(60), 3)], RampPolicy::Immediate);
        cfg.run_timeout = Some(secs(2));
        cfg.abort_grace = secs(1);
        let scheduler = Scheduler::new(cfg);

        let report = scheduler.run(Arc::new(StubbornWorkload), StopListener::detached()).await;

        assert_eq!(report.outcome, RunOutcome::TimedOut);
        assert_eq!(report.slots_killed, 3);
        assert!(report.elapsed_ms < 5_000, "elapsed {}ms", report.elapsed_ms);
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_cancels_run() {
        let cfg = config(0, vec![RampStage::new(secs(60), 4)], RampPolicy::Immediate);
        let scheduler = Scheduler::new(cfg);
        let (stop, listener) = StopHandle::new();

        let workload = Arc::new(SleepyWorkload {
            work: Duration::from_millis(300),
        });
        let run = tokio::spawn(scheduler.run(workload, listener));

        tokio::time::sleep(secs(2)).await;
        stop.drain();

        let report = run.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.iterations_interrupted, 0);
        assert!(report.iterations_completed > 0);
        assert!(report.elapsed_ms < 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_cap_retires_slots_without_respawn() {
        let mut cfg = config(0, vec![RampStage::new(secs(5), 3)], RampPolicy::Immediate);
        cfg.iterations_per_vu = Some(1);
        let scheduler = Scheduler::new(cfg);

        let workload = Arc::new(SleepyWorkload {
            work: Duration::from_millis(100),
        });
        let report = scheduler.run(workload, StopListener::detached()).await;

        assert_eq!(report.slots_started, 3);
        assert_eq!(report.iterations_completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramp_back_up_reuses_pool_indices() {
        let mut cfg = config(
            0,
            vec![
                RampStage::new(secs(1), 2),
                RampStage::new(secs(1), 1),
                RampStage::new(secs(1), 2),
            ],
            RampPolicy::Immediate,
        );
        cfg.graceful_ramp_down = secs(30);
        cfg.pool_size = Some(2);
        let scheduler = Scheduler::new(cfg);

        let workload = Arc::new(RecordingWorkload {
            work: secs(5),
            seen: Default::default(),
        });
        let report = scheduler.run(workload.clone(), StopListener::detached()).await;

        assert_eq!(report.slots_started, 3);
        let seen = workload.seen.lock().unwrap().clone();
        assert_eq!(seen, [0, 1].into_iter().collect::<BTreeSet<_>>());
    }

    #[test]
    fn test_next_free_index_skips_retired() {
        let active = BTreeMap::new();
        let retired: BTreeSet<usize> = [0, 1, 3].into_iter().collect();
        assert_eq!(next_free_index(&active, &[], &retired, None), 2);
        assert_eq!(next_free_index(&active, &[], &retired, Some(4)), 2);
        // Pool exhausted by retired slots: continue past it
        assert_eq!(next_free_index(&active, &[], &retired, Some(2)), 2);
    }
}
