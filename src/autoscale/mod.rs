//! Autoscaled worker pool: grows and shrinks concurrency between
//! `min_concurrency` and `max_concurrency` based on periodic system-load
//! snapshots. See spec §4.5.
//!
//! The task-spawning half mirrors `fusillade::daemon::Daemon::run`'s
//! `JoinSet` + `scopeguard`-decremented in-flight counter. The scaling half
//! has no direct analogue in the teacher (its concurrency is a fixed
//! per-model `Semaphore`), so it's grounded instead on the `sysinfo`-based
//! resource snapshot approach documented in the `riptide-crawler` manifest
//! under `other_examples/` — resizing a `tokio::sync::Semaphore` at runtime
//! via `add_permits`/`forget_permits` is the idiomatic way to make a fixed
//! concurrency gate elastic.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Tunables for the autoscaler's scale-up/down decisions.
#[derive(Debug, Clone)]
pub struct AutoscaleConfig {
    pub min_concurrency: usize,
    pub max_concurrency: usize,
    pub desired_concurrency_ratio: f64,
    pub scale_interval: Duration,
    /// Fraction of system memory, above which the pool scales down.
    pub max_memory_ratio: f32,
    /// Event-loop scheduling lag, above which the pool scales down — a
    /// cheap proxy for CPU saturation that doesn't require per-platform
    /// CPU sampling.
    pub max_event_loop_lag: Duration,
}

impl Default for AutoscaleConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            max_concurrency: 200,
            desired_concurrency_ratio: 0.1,
            scale_interval: Duration::from_secs(5),
            max_memory_ratio: 0.9,
            max_event_loop_lag: Duration::from_millis(500),
        }
    }
}

/// A single load measurement used to decide whether to scale up or down.
#[derive(Debug, Clone, Copy)]
pub struct LoadSnapshot {
    pub memory_ratio: f32,
    pub event_loop_lag: Duration,
}

impl LoadSnapshot {
    pub fn is_overloaded(&self, config: &AutoscaleConfig) -> bool {
        self.memory_ratio >= config.max_memory_ratio || self.event_loop_lag >= config.max_event_loop_lag
    }
}

/// Periodically samples system memory and event-loop responsiveness.
pub struct Snapshotter {
    system: parking_lot::Mutex<System>,
    last_tick: parking_lot::Mutex<Instant>,
}

impl Snapshotter {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: parking_lot::Mutex::new(system),
            last_tick: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Take a fresh reading. The event-loop lag is measured as the drift
    /// between wall-clock elapsed time and expected elapsed time since the
    /// last snapshot, a cheap stand-in for "is the tokio scheduler falling
    /// behind".
    pub fn snapshot(&self, expected_interval: Duration) -> LoadSnapshot {
        let mut system = self.system.lock();
        system.refresh_memory();
        let memory_ratio = if system.total_memory() == 0 {
            0.0
        } else {
            system.used_memory() as f32 / system.total_memory() as f32
        };

        let mut last_tick = self.last_tick.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(*last_tick);
        *last_tick = now;
        let lag = elapsed.saturating_sub(expected_interval);

        LoadSnapshot { memory_ratio, event_loop_lag: lag }
    }
}

impl Default for Snapshotter {
    fn default() -> Self {
        Self::new()
    }
}

/// A task-readiness probe: whether the driving loop has work worth
/// claiming right now (spec §4.5's `is_task_ready()`).
pub type TaskReadyProbe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// Claim and run exactly one unit of work (spec §4.5's `run_task()`).
/// Infallible by contract: a probe that can fail reports the failure
/// through its own side channel rather than this return type, since the
/// pool driving it has no domain knowledge of what "fatal" means.
pub type RunTaskProbe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Whether the whole run is done (spec §4.5's `is_finished()` / §8
/// testable property 2): once true and every spawned task has drained,
/// [`AutoscaledPool::run`] returns.
pub type FinishedProbe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// A resizable concurrency gate: workers acquire a permit before doing
/// work, and the pool's background scaling loop grows or shrinks the
/// total permit count within `[min_concurrency, max_concurrency]`.
pub struct AutoscaledPool {
    semaphore: Arc<Semaphore>,
    config: AutoscaleConfig,
    current: AtomicUsize,
}

impl AutoscaledPool {
    pub fn new(config: AutoscaleConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.min_concurrency));
        Self {
            semaphore,
            current: AtomicUsize::new(config.min_concurrency),
            config,
        }
    }

    pub fn current_concurrency(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    pub fn semaphore(&self) -> Arc<Semaphore> {
        self.semaphore.clone()
    }

    /// Apply one scaling decision based on a load snapshot: scale down by
    /// one step if overloaded, otherwise scale up by one step, clamped to
    /// `[min_concurrency, max_concurrency]`.
    pub fn apply_snapshot(&self, snapshot: LoadSnapshot) {
        let current = self.current.load(Ordering::Relaxed);
        let step = ((current as f64 * self.config.desired_concurrency_ratio).ceil() as usize).max(1);

        if snapshot.is_overloaded(&self.config) {
            let target = current.saturating_sub(step).max(self.config.min_concurrency);
            if target < current {
                let delta = current - target;
                self.semaphore.forget_permits(delta);
                self.current.store(target, Ordering::Relaxed);
                tracing::debug!(from = current, to = target, "autoscale: scaling down");
            }
        } else {
            let target = (current + step).min(self.config.max_concurrency);
            if target > current {
                self.semaphore.add_permits(target - current);
                self.current.store(target, Ordering::Relaxed);
                tracing::debug!(from = current, to = target, "autoscale: scaling up");
            }
        }
    }

    /// Drive a worker loop against the spec §4.5 three-probe contract:
    /// opportunistically drain finished tasks, stop once `is_finished`
    /// reports the crawl is done, otherwise wait for `is_task_ready` before
    /// acquiring a permit and spawning `run_task`. Mirrors
    /// `fusillade::daemon::Daemon::run`'s own "drain, check a stop
    /// condition, acquire, claim, spawn" shape, generalized so the caller
    /// supplies the claim/stop predicates instead of this pool hard-coding
    /// a request queue.
    ///
    /// A panic inside `run_task` is swallowed rather than propagated: the
    /// probes are contractually infallible from this pool's point of view,
    /// so a caller that needs to observe task failure does so through its
    /// own side channel (see `Crawler::run_inner`'s `fatal` mutex), not
    /// through this method's return type.
    pub async fn run(self: Arc<Self>, is_task_ready: TaskReadyProbe, run_task: RunTaskProbe, is_finished: FinishedProbe, idle_poll_interval: Duration) {
        let mut join_set: JoinSet<()> = JoinSet::new();

        loop {
            while join_set.try_join_next().is_some() {}

            if is_finished().await {
                break;
            }

            if !is_task_ready().await {
                tokio::time::sleep(idle_poll_interval).await;
                continue;
            }

            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tokio::time::sleep(idle_poll_interval).await;
                    continue;
                }
            };

            let task = run_task.clone();
            join_set.spawn(async move {
                let _permit = permit;
                task().await;
            });
        }

        while join_set.join_next().await.is_some() {}
    }

    /// Run the scaling loop until `shutdown` resolves. Intended to be
    /// spawned as its own task alongside the dispatcher's worker loop.
    pub async fn run_scaling_loop(self: Arc<Self>, snapshotter: Arc<Snapshotter>, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.scale_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let snapshot = snapshotter.snapshot(self.config.scale_interval);
                    self.apply_snapshot(snapshot);
                }
                _ = &mut shutdown => {
                    tracing::debug!("autoscale: scaling loop shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_down_when_overloaded() {
        let pool = AutoscaledPool::new(AutoscaleConfig {
            min_concurrency: 1,
            max_concurrency: 20,
            desired_concurrency_ratio: 1.0,
            ..Default::default()
        });
        // Warm up to a higher concurrency first.
        pool.apply_snapshot(LoadSnapshot { memory_ratio: 0.1, event_loop_lag: Duration::ZERO });
        pool.apply_snapshot(LoadSnapshot { memory_ratio: 0.1, event_loop_lag: Duration::ZERO });
        let before = pool.current_concurrency();
        assert!(before > 1);

        pool.apply_snapshot(LoadSnapshot { memory_ratio: 0.99, event_loop_lag: Duration::ZERO });
        assert!(pool.current_concurrency() < before);
        assert!(pool.current_concurrency() >= pool.config.min_concurrency);
    }

    #[test]
    fn never_exceeds_max_concurrency() {
        let pool = AutoscaledPool::new(AutoscaleConfig {
            min_concurrency: 1,
            max_concurrency: 4,
            desired_concurrency_ratio: 1.0,
            ..Default::default()
        });
        for _ in 0..10 {
            pool.apply_snapshot(LoadSnapshot { memory_ratio: 0.0, event_loop_lag: Duration::ZERO });
        }
        assert_eq!(pool.current_concurrency(), 4);
    }

    #[test]
    fn never_drops_below_min_concurrency() {
        let pool = AutoscaledPool::new(AutoscaleConfig {
            min_concurrency: 2,
            max_concurrency: 8,
            desired_concurrency_ratio: 1.0,
            ..Default::default()
        });
        for _ in 0..10 {
            pool.apply_snapshot(LoadSnapshot { memory_ratio: 1.0, event_loop_lag: Duration::ZERO });
        }
        assert_eq!(pool.current_concurrency(), 2);
    }
}
