//! Fixed-size pool of supervised workers.
//!
//! Workers are created eagerly and handed out through a bounded ready queue,
//! so no two callers ever hold the same worker. Failed workers are reaped and
//! replaced on background threads while the caller gets the error.

mod supervisor;

pub use supervisor::{RecyclePolicy, RecycleReason, read_process_rss_mib};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{PoolConfig, WorkersConfig};
use crate::error::{RelayvisorError, Result};
use crate::events::{EventBus, EventContext, EventKind};
use crate::payload::Payload;
use crate::worker::{Worker, WorkerFactory, WorkerInfo, WorkerState, factory_for};

/// Delay between attempts to replace a worker that failed to spawn.
const RESPAWN_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Slice in which shutdown re-checks the ready queue and worker list.
const DESTROY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters reported by [`Pool::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Target worker count.
    pub capacity: usize,
    /// Workers currently tracked, including ones being reaped.
    pub workers: usize,
    pub ready: usize,
    pub working: usize,
    pub jobs: u64,
    pub errors: u64,
    pub restarts: u64,
    pub allocate_timeouts: u64,
}

struct PoolInner {
    capacity: usize,
    allocate_timeout: Duration,
    destroy_timeout: Duration,
    policy: RecyclePolicy,
    factory: Arc<dyn WorkerFactory>,
    events: EventBus,
    ready_tx: Sender<Arc<Worker>>,
    ready_rx: Receiver<Arc<Worker>>,
    workers: Mutex<Vec<Arc<Worker>>>,
    /// Signalled whenever a worker leaves `workers`.
    removed: Condvar,
    stopping: AtomicBool,
    background: Mutex<Vec<JoinHandle<()>>>,
    jobs: AtomicU64,
    errors: AtomicU64,
    restarts: AtomicU64,
    allocate_timeouts: AtomicU64,
}

/// Handle to a running pool. Dropping it destroys the pool.
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Pool {
    /// Build a pool and spawn all of its workers.
    ///
    /// Fails, and cleans up what was already started, if any worker cannot be
    /// spawned.
    #[instrument(level = "debug", skip_all, fields(workers = config.num_workers()))]
    pub fn new(
        config: &PoolConfig,
        factory: Arc<dyn WorkerFactory>,
        events: EventBus,
    ) -> Result<Self> {
        let capacity = config.num_workers();
        let (ready_tx, ready_rx) = bounded(capacity);
        let inner = Arc::new(PoolInner {
            capacity,
            allocate_timeout: config.allocate_timeout(),
            destroy_timeout: config.destroy_timeout(),
            policy: RecyclePolicy::from(config),
            factory,
            events,
            ready_tx,
            ready_rx,
            workers: Mutex::new(Vec::with_capacity(capacity)),
            removed: Condvar::new(),
            stopping: AtomicBool::new(false),
            background: Mutex::new(Vec::new()),
            jobs: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            allocate_timeouts: AtomicU64::new(0),
        });
        let pool = Self { inner };

        for _ in 0..capacity {
            let worker = match pool.inner.factory.spawn_worker() {
                Ok(worker) => Arc::new(worker),
                Err(e) => {
                    error!(error = %e, "Failed to start worker pool");
                    pool.destroy();
                    return Err(e);
                }
            };
            pool.inner.admit(worker, false);
        }

        info!(workers = capacity, "Worker pool started");
        pool.inner.events.emit(EventKind::PoolCreate, EventContext::None);
        Ok(pool)
    }

    /// Build the transport factory and the pool from a `workers` section.
    pub fn from_config(config: &WorkersConfig, events: EventBus) -> Result<Self> {
        config.validate()?;
        let factory = factory_for(config, &events)?;
        Self::new(&config.pool, factory, events)
    }

    /// Build a fresh pool on this pool's transport.
    ///
    /// Both pools share one factory, so a socket relay keeps its listener and
    /// address. The factory closes once the last pool using it is destroyed.
    pub fn rebuild(&self, config: &PoolConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::clone(&self.inner.factory),
            self.inner.events.clone(),
        )
    }

    /// Target number of workers.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Run one job on a free worker, waiting up to the configured allocate timeout.
    pub fn exec(&self, payload: &Payload) -> Result<Payload> {
        self.exec_timeout(payload, self.inner.allocate_timeout)
    }

    /// Run one job, waiting at most `timeout` for a worker.
    ///
    /// The timeout bounds allocation only; a job that has started runs to
    /// completion. Failed jobs are not retried.
    pub fn exec_timeout(&self, payload: &Payload, timeout: Duration) -> Result<Payload> {
        let worker = self.inner.allocate(timeout)?;
        match worker.exec(payload) {
            Ok(response) => {
                self.inner.jobs.fetch_add(1, Ordering::Relaxed);
                self.inner.release(worker);
                Ok(response)
            }
            Err(e) => {
                self.inner.errors.fetch_add(1, Ordering::Relaxed);
                if let Some(stderr) = e.stderr() {
                    warn!(pid = worker.pid(), error = %e, stderr = %stderr.trim_end(), "Job failed");
                } else {
                    warn!(pid = worker.pid(), error = %e, "Job failed");
                }
                self.inner.events.emit(
                    EventKind::WorkerError,
                    EventContext::WorkerError {
                        worker: worker.info(),
                        error: e.to_string(),
                    },
                );
                self.inner.replace(worker);
                Err(e)
            }
        }
    }

    /// Snapshot of every tracked worker.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|w| w.info())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let workers = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = |state: WorkerState| workers.iter().filter(|w| w.state() == state).count();
        PoolStats {
            capacity: self.inner.capacity,
            workers: workers.len(),
            ready: count(WorkerState::Ready),
            working: count(WorkerState::Working),
            jobs: self.inner.jobs.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            restarts: self.inner.restarts.load(Ordering::Relaxed),
            allocate_timeouts: self.inner.allocate_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    /// Stop every worker and release the transport.
    ///
    /// Idle workers are stopped at once; in-flight jobs may finish until the
    /// destroy timeout, after which remaining workers are killed. Calling it
    /// again is a no-op.
    pub fn destroy(&self) {
        self.inner.destroy();
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl PoolInner {
    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Track a freshly spawned worker and make it available.
    fn admit(self: &Arc<Self>, worker: Arc<Worker>, restart: bool) {
        {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_stopping() {
                drop(workers);
                worker.stop(self.destroy_timeout);
                return;
            }
            workers.push(Arc::clone(&worker));
        }
        if restart {
            self.restarts.fetch_add(1, Ordering::Relaxed);
        }
        debug!(pid = worker.pid(), "Worker created");
        self.events
            .emit(EventKind::WorkerCreate, EventContext::Worker(worker.info()));
        self.enqueue(worker);
    }

    fn enqueue(self: &Arc<Self>, worker: Arc<Worker>) {
        match self.ready_tx.try_send(worker) {
            Ok(()) => {}
            Err(TrySendError::Full(worker) | TrySendError::Disconnected(worker)) => {
                warn!(pid = worker.pid(), "Ready queue rejected worker");
                self.retire(worker);
            }
        }
    }

    fn allocate(self: &Arc<Self>, timeout: Duration) -> Result<Arc<Worker>> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_stopping() {
                return Err(RelayvisorError::PoolStopped);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.ready_rx.recv_timeout(remaining) {
                Ok(worker) => {
                    if self.is_stopping() {
                        self.retire(worker);
                        return Err(RelayvisorError::PoolStopped);
                    }
                    if worker.state() != WorkerState::Ready {
                        trace!(pid = worker.pid(), state = %worker.state(), "Skipping stale worker");
                        continue;
                    }
                    if !worker.is_alive() {
                        worker.invalidate();
                        let reason = worker
                            .exit_reason()
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "unknown reason".to_string());
                        warn!(pid = worker.pid(), reason = %reason, "Idle worker died");
                        self.events.emit(
                            EventKind::WorkerError,
                            EventContext::WorkerError {
                                worker: worker.info(),
                                error: format!("worker exited while idle: {}", reason),
                            },
                        );
                        self.replace(worker);
                        continue;
                    }
                    return Ok(worker);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.is_stopping() {
                        return Err(RelayvisorError::PoolStopped);
                    }
                    if self.live_workers() == 0 {
                        return Err(RelayvisorError::PoolUnavailable);
                    }
                    self.allocate_timeouts.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(
                        EventKind::PoolError,
                        EventContext::Error {
                            message: format!("worker allocation timed out after {:?}", timeout),
                        },
                    );
                    return Err(RelayvisorError::AllocateTimeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RelayvisorError::PoolStopped);
                }
            }
        }
    }

    fn live_workers(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|w| w.state().is_active())
            .count()
    }

    /// Return a worker after a successful job.
    fn release(self: &Arc<Self>, worker: Arc<Worker>) {
        if self.is_stopping() {
            self.retire(worker);
            return;
        }

        if let Some(reason) = self.policy.check(&worker) {
            if worker.invalidate() {
                info!(pid = worker.pid(), reason = %reason, "Recycling worker");
                self.events
                    .emit(EventKind::WorkerRecycle, EventContext::Worker(worker.info()));
            }
            self.replace(worker);
            return;
        }

        if worker.state() != WorkerState::Ready {
            self.replace(worker);
            return;
        }

        self.enqueue(worker);
    }

    /// Reap a worker that can't be reused and start a replacement.
    fn replace(self: &Arc<Self>, worker: Arc<Worker>) {
        worker.invalidate();
        self.retire(worker);
        if !self.is_stopping() {
            self.spawn_background("respawn".to_string(), |pool| pool.respawn());
        }
    }

    /// Stop a worker on a background thread and forget it.
    fn retire(self: &Arc<Self>, worker: Arc<Worker>) {
        let name = format!("reap-{}", worker.pid());
        self.spawn_background(name, move |pool| {
            let reason = worker.stop(pool.destroy_timeout);
            trace!(pid = worker.pid(), reason = %reason, "Worker reaped");
            pool.forget(&worker);
        });
    }

    fn forget(&self, worker: &Arc<Worker>) {
        let found = {
            let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            let before = workers.len();
            workers.retain(|w| !Arc::ptr_eq(w, worker));
            before != workers.len()
        };
        self.removed.notify_all();
        if found {
            self.events
                .emit(EventKind::WorkerDestruct, EventContext::Worker(worker.info()));
        }
    }

    /// Spawn workers until one succeeds or the pool stops.
    fn respawn(self: &Arc<Self>) {
        while !self.is_stopping() {
            match self.factory.spawn_worker() {
                Ok(worker) => {
                    self.admit(Arc::new(worker), true);
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to respawn worker, retrying");
                    self.events.emit(
                        EventKind::WorkerError,
                        EventContext::Error {
                            message: format!("worker respawn failed: {}", e),
                        },
                    );
                    std::thread::sleep(RESPAWN_RETRY_INTERVAL);
                }
            }
        }
    }

    fn spawn_background<F>(self: &Arc<Self>, name: String, task: F)
    where
        F: FnOnce(Arc<PoolInner>) + Send + 'static,
    {
        let pool = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(name)
            .spawn(move || task(pool));

        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        let (finished, running): (Vec<_>, Vec<_>) =
            background.drain(..).partition(|h| h.is_finished());
        *background = running;
        for handle in finished {
            let _ = handle.join();
        }
        match spawned {
            Ok(handle) => background.push(handle),
            Err(e) => error!(error = %e, "Failed to start pool background thread"),
        }
    }

    fn destroy(self: &Arc<Self>) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let deadline = Instant::now() + self.destroy_timeout;
        debug!(timeout = ?self.destroy_timeout, "Destroying worker pool");

        loop {
            let idle: Vec<Arc<Worker>> = self.ready_rx.try_iter().collect();
            if !idle.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                std::thread::scope(|s| {
                    for worker in &idle {
                        s.spawn(move || {
                            worker.stop(remaining);
                            self.forget(worker);
                        });
                    }
                });
            }

            let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if workers.is_empty() || remaining.is_zero() {
                break;
            }
            let _ = self
                .removed
                .wait_timeout(workers, remaining.min(DESTROY_POLL_INTERVAL))
                .unwrap_or_else(PoisonError::into_inner);
        }

        let leftover: Vec<Arc<Worker>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in leftover {
            warn!(pid = worker.pid(), state = %worker.state(), "Destroy timeout reached, killing worker");
            worker.kill();
            self.events
                .emit(EventKind::WorkerDestruct, EventContext::Worker(worker.info()));
        }

        // A replacement pool may still be spawning through this factory.
        if Arc::strong_count(&self.factory) == 1 {
            self.factory.close();
        }

        let handles: Vec<JoinHandle<()>> = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let join_deadline = Instant::now() + self.destroy_timeout;
        for handle in handles {
            while !handle.is_finished() && Instant::now() < join_deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }

        info!("Worker pool destroyed");
        self.events.emit(EventKind::PoolDestroy, EventContext::None);
    }
}
