//! Guarded in-process caches.
//!
//! A [`GuardedCache`] owns one piece of state behind a tokio mutex. Callers
//! only ever reach it through [`GuardedCache::access`], and an optional
//! background sweep runs on the same mutex at a fixed interval. Caches are a
//! local optimization: nothing here is a source of truth.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod ban;
mod chain_nodes;
mod clock;
mod ttl_map;

pub use ban::{BanCache, BanLookup};
pub use chain_nodes::ChainNodeCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use ttl_map::TtlMap;

/// Cache tuning shared by every cache the runtime builds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds between sweeps.
    pub prune_interval_secs: u64,
    /// Entry time-to-live in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prune_interval_secs: 60,
            ttl_secs: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Sweep run against the guarded state on every timer tick.
pub type SweepFn<S> = fn(&mut S, DateTime<Utc>);

struct SweepTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Mutex-serialized state with a periodic sweep.
pub struct GuardedCache<S> {
    state: Arc<Mutex<S>>,
    prune_interval: Duration,
    sweep: Option<SweepFn<S>>,
    clock: Arc<dyn Clock>,
    task: Mutex<Option<SweepTask>>,
}

impl<S: Send + 'static> GuardedCache<S> {
    pub fn new(initial_state: S, prune_interval_secs: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(initial_state)),
            prune_interval: Duration::from_secs(prune_interval_secs.max(1)),
            sweep: None,
            clock: Arc::new(SystemClock),
            task: Mutex::new(None),
        }
    }

    pub fn with_sweep(mut self, sweep: SweepFn<S>) -> Self {
        self.sweep = Some(sweep);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the sweep period (sub-second periods for tests).
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval;
        self
    }

    /// Current time according to the injected clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `f` with exclusive access to the state.
    pub async fn access<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Run the sweep once, outside the timer.
    pub async fn sweep_now(&self) {
        if let Some(sweep) = self.sweep {
            let now = self.clock.now();
            sweep(&mut *self.state.lock().await, now);
        }
    }

    /// Start the background sweep. No-op if already running or if no
    /// sweep is configured.
    pub async fn start(&self) {
        let Some(sweep) = self.sweep else {
            debug!("Cache has no sweep, timer not started");
            return;
        };
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let period = self.prune_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let now = clock.now();
                        sweep(&mut *state.lock().await, now);
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        info!(prune_interval = ?period, "Cache sweep started");
        *task = Some(SweepTask {
            stop: stop_tx,
            handle,
        });
    }

    /// Cancel the sweep and wait for it to exit.
    pub async fn stop(&self) {
        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        let _ = task.stop.send(true);
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Cache sweep task panicked");
        }
        info!("Cache sweep stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}
