use crate::config::DispatcherConfig;
use crate::executor::AttemptExecutor;
use crate::metrics::DispatcherMetrics;
use crate::pool::{SlotGuard, SlotInfo, WorkerPool};
use crate::queue::PriorityQueue;
use chrono::Utc;
use dashmap::DashMap;
use jobq_core::{
    BackoffPolicy, ClientError, DispatchError, ErrorKind, JobError, JobId, JobPayload, JobRecord,
    JobResult, JobSpec, JobState, JobStatus, Result, Role, Tier,
};
use jobq_store::JobStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often terminal records are checked against the retention window
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Poll period while waiting for busy slots to drain at shutdown
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Delays between attempts to record an outcome the store refused to write
const STORE_RETRY_BASE: Duration = Duration::from_millis(50);
const STORE_RETRY_CEILING: Duration = Duration::from_secs(5);

/// The job moved on without us, usually because it was cancelled. Any other
/// update error is a store fault.
fn is_lifecycle_conflict(err: &DispatchError) -> bool {
    matches!(
        err,
        DispatchError::InvalidTransition { .. } | DispatchError::NotFound(_)
    )
}

/// Where a pending job stands in its role's queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuePosition {
    pub job_id: JobId,
    pub role: Role,
    /// 1-indexed among pending jobs of the same role
    pub position: usize,
    pub estimated_wait: Duration,
}

/// Point-in-time view of the queue and the pool.
///
/// `pending`, `retrying` and `running` count each job once, by lifecycle state.
/// `queued` and the per-tier and per-role breakdowns cover everything in the
/// queue, which includes retrying jobs whose backoff has elapsed.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub retrying: usize,
    pub queued: usize,
    pub pending_by_tier: BTreeMap<Tier, usize>,
    pub pending_by_role: BTreeMap<Role, usize>,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub busy_slots: usize,
    pub total_slots: usize,
    pub max_queue_size: usize,
    /// Estimated wait for a job submitted now
    pub estimated_wait: Duration,
}

/// Running mean of successful attempt durations
struct WaitEstimate {
    mean_secs: f64,
    samples: u64,
}

impl WaitEstimate {
    fn seeded(seed: Duration) -> Self {
        WaitEstimate {
            mean_secs: seed.as_secs_f64(),
            samples: 0,
        }
    }

    fn record(&mut self, sample: Duration) {
        self.samples += 1;
        self.mean_secs += (sample.as_secs_f64() - self.mean_secs) / self.samples as f64;
    }

    fn per_job(&self) -> Duration {
        Duration::from_secs_f64(self.mean_secs.max(0.0))
    }
}

/// Matches pending jobs to free worker slots and drives each one to a terminal state.
///
/// The queue, the pool and the store are handed in at construction and each keeps
/// its own lock. A job leaves the queue before the store marks it `Assigned`, so
/// it is never visible in both places at once.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<PriorityQueue>,
    pool: WorkerPool,
    store: Arc<JobStore>,
    backoff: BackoffPolicy,
    metrics: Arc<DispatcherMetrics>,

    /// One watch channel per awaited job, flipped to `true` once it is terminal
    completions: DashMap<JobId, watch::Sender<bool>>,

    wake: Notify,
    shutdown: watch::Sender<bool>,

    /// Held while a job crosses between the queue and the store, so the
    /// scheduler never picks a job whose record is not written yet
    admission: Mutex<()>,
    /// Only one scheduling pass runs at a time
    scheduling: Mutex<()>,

    estimate: Mutex<WaitEstimate>,
}

impl Dispatcher {
    /// Build a dispatcher and load every queued job the store already holds.
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<PriorityQueue>,
        pool: WorkerPool,
        store: Arc<JobStore>,
    ) -> anyhow::Result<Self> {
        let metrics = DispatcherMetrics::new()?;
        let backoff = config.backoff_policy();
        let estimate = WaitEstimate::seeded(config.per_job_estimate());

        let dispatcher = Dispatcher {
            config,
            queue,
            pool,
            store,
            backoff,
            metrics: Arc::new(metrics),
            completions: DashMap::new(),
            wake: Notify::new(),
            shutdown: watch::channel(false).0,
            admission: Mutex::new(()),
            scheduling: Mutex::new(()),
            estimate: Mutex::new(estimate),
        };

        dispatcher.recover_pending();
        dispatcher.refresh_gauges();
        Ok(dispatcher)
    }

    /// Dispatcher with a queue sized from `config.max_queue_size`
    pub fn from_config(
        config: DispatcherConfig,
        pool: WorkerPool,
        store: Arc<JobStore>,
    ) -> anyhow::Result<Self> {
        let queue = Arc::new(PriorityQueue::with_capacity(config.max_queue_size));
        Self::new(config, queue, pool, store)
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.metrics
    }

    /// Spawn the scheduler loop. Jobs that were backing off when the process
    /// stopped are re-armed for their original `retry_at`.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.recover_backoffs();

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run().await;
        })
    }

    async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.subscribe();
        let mut last_purge = Instant::now();

        info!(
            "Dispatcher started with {} slots across roles {:?}",
            self.pool.total_slots(),
            self.pool.slots_by_role()
        );

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    info!("Scheduler loop stopping");
                    break;
                }
            }

            self.schedule_pass();

            if last_purge.elapsed() >= PURGE_INTERVAL {
                self.purge_expired();
                last_purge = Instant::now();
            }
        }
    }

    /// Assign as many queued jobs as there are idle slots able to take them.
    fn schedule_pass(self: &Arc<Self>) -> usize {
        let _pass = self.scheduling.lock();
        let mut assigned = 0;

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let idle = self.pool.idle_roles();
            if idle.is_empty() {
                break;
            }

            let job = match self.queue.peek_eligible(&idle) {
                Some(job) => job,
                None => break,
            };

            let slot = match self.pool.acquire_free_slot(&job.role) {
                Some(slot) => slot,
                None => continue,
            };

            let handed_off = {
                let _admit = self.admission.lock();
                // Cancelled between peek and removal; the slot goes back on drop
                if self.queue.remove(&job.id).is_none() {
                    continue;
                }
                self.store
                    .update(&job.id, |r| r.status.assign(slot.slot_id()))
                    .map_err(DispatchError::from)
            };

            if let Err(e) = handed_off {
                if is_lifecycle_conflict(&e) {
                    debug!("Dropping job {} from the queue: {}", job.id, e);
                    continue;
                }
                // Record unchanged, so the job is still waiting; try again next pass
                error!("Failed to assign job {}: {}", job.id, e);
                self.queue.requeue(job);
                break;
            }

            slot.bind(&job.id);
            debug!("Assigned job {} to slot {}", job.id, slot.slot_id());

            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.supervise(job, slot).await;
            });
            assigned += 1;
        }

        if assigned > 0 {
            self.refresh_gauges();
        }
        assigned
    }

    /// Run one attempt on `slot` and record what came of it.
    async fn supervise(self: Arc<Self>, job: JobSpec, slot: SlotGuard) {
        let attempt = match self
            .update_until_stored(&job.id, |r| r.status.start_attempt())
            .await
        {
            Ok(attempt) => attempt,
            Err(e) if is_lifecycle_conflict(&e) => {
                debug!("Job {} not started on {}: {}", job.id, slot.slot_id(), e);
                return;
            }
            Err(e) => {
                error!("Job {} left assigned on {}: {}", job.id, slot.slot_id(), e);
                return;
            }
        };

        info!(
            "Job {} attempt {}/{} running on {}",
            job.id,
            attempt,
            job.max_retries,
            slot.slot_id()
        );
        self.metrics.jobs_running.inc();
        self.metrics.inc_jobs_total("running", &job.role);

        let started = Instant::now();
        let outcome = AttemptExecutor::new(slot.client()).execute(&job, attempt).await;
        let elapsed = started.elapsed();

        // Free the slot before the job can become eligible again
        drop(slot);
        self.metrics.jobs_running.dec();
        self.metrics
            .observe_attempt_duration(&job.role, elapsed.as_secs_f64());

        match outcome {
            Ok(output) => self.finish_success(&job, output, elapsed).await,
            Err(err) => self.handle_failure(&job, attempt, err).await,
        }

        self.refresh_gauges();
        self.wake.notify_one();
    }

    /// Apply `f` to the job's record, retrying while the store fails to write it.
    /// Lifecycle conflicts return at once. After shutdown the last error is
    /// returned and the job is picked up again by restart recovery.
    async fn update_until_stored<T, F>(&self, job_id: &JobId, mut f: F) -> Result<T>
    where
        F: FnMut(&mut JobRecord) -> Result<T>,
    {
        let retry = BackoffPolicy::new(STORE_RETRY_BASE, STORE_RETRY_CEILING);
        let mut failures = 0;

        loop {
            let err = match self.store.update(job_id, |r| f(r)) {
                Ok(value) => return Ok(value),
                Err(e) => DispatchError::from(e),
            };
            if is_lifecycle_conflict(&err) || self.is_shutting_down() {
                return Err(err);
            }

            failures += 1;
            let delay = retry.delay(failures);
            error!(
                "Failed to record job {} ({} failures), retrying in {:?}: {}",
                job_id, failures, delay, err
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn finish_success(&self, job: &JobSpec, output: JobPayload, elapsed: Duration) {
        let recorded = self
            .update_until_stored(&job.id, |r| {
                r.status.succeed()?;
                let result = JobResult::succeeded(&r.status, output.clone());
                r.result = Some(result.clone());
                Ok(result)
            })
            .await;

        match recorded {
            Ok(result) => {
                info!(
                    "Job {} succeeded after {} attempts ({:?})",
                    job.id, result.attempts_used, result.total_wall_time
                );
                self.estimate.lock().record(elapsed);
                self.metrics.inc_jobs_total("succeeded", &job.role);
                self.notify_done(&job.id);
            }
            Err(e) if is_lifecycle_conflict(&e) => {
                info!("Discarding output of job {}: {}", job.id, e)
            }
            Err(e) => error!("Output of job {} not recorded: {}", job.id, e),
        }
    }

    async fn handle_failure(self: &Arc<Self>, job: &JobSpec, attempt: u32, err: ClientError) {
        let last = JobError::from(err.clone());

        if err.is_retryable() && attempt < job.max_retries {
            let delay = self.backoff.jittered_delay(attempt, &mut rand::thread_rng());
            let retry_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            match self
                .update_until_stored(&job.id, |r| {
                    r.status.schedule_retry(last.clone(), retry_at)
                })
                .await
            {
                Ok(()) => {
                    warn!(
                        "Job {} attempt {} failed ({}), retrying in {:?}",
                        job.id, attempt, err, delay
                    );
                    self.metrics.inc_retries(&job.role);
                    self.metrics.inc_jobs_total("retrying", &job.role);
                    self.schedule_requeue(job.clone(), delay);
                }
                Err(e) if is_lifecycle_conflict(&e) => {
                    info!("Not retrying job {}: {}", job.id, e)
                }
                Err(e) => error!("Retry of job {} not recorded: {}", job.id, e),
            }
            return;
        }

        let error = if err.is_retryable() {
            JobError::exhausted(last, attempt)
        } else {
            last
        };

        let recorded = self
            .update_until_stored(&job.id, |r| {
                r.status.fail()?;
                r.result = Some(JobResult::failed(&r.status, error.clone()));
                Ok(())
            })
            .await;

        match recorded {
            Ok(()) => {
                error!("Job {} failed: {}", job.id, error);
                self.metrics.inc_jobs_total("failed", &job.role);
                self.notify_done(&job.id);
            }
            Err(e) if is_lifecycle_conflict(&e) => {
                info!("Discarding failure of job {}: {}", job.id, e)
            }
            Err(e) => error!("Failure of job {} not recorded: {}", job.id, e),
        }
    }

    /// Put a retrying job back in the queue once `delay` has passed.
    fn schedule_requeue(self: &Arc<Self>, job: JobSpec, delay: Duration) {
        let dispatcher = self.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
            dispatcher.requeue_if_retrying(job);
        });
    }

    fn requeue_if_retrying(&self, job: JobSpec) {
        let job_id = job.id.clone();
        if !self.is_retrying(&job_id) {
            return;
        }

        self.queue.requeue(job);

        // A cancel may have landed between the check and the insert
        if !self.is_retrying(&job_id) {
            self.queue.remove(&job_id);
            return;
        }

        debug!("Job {} back in the queue after backoff", job_id);
        self.refresh_gauges();
        self.wake.notify_one();
    }

    fn is_retrying(&self, job_id: &JobId) -> bool {
        matches!(
            self.store.status(job_id).map(|s| s.state),
            Some(JobState::Retrying { .. })
        )
    }

    /// Accept a job. Malformed jobs and jobs for a role without slots are
    /// refused synchronously; the latter is still recorded as failed.
    pub fn submit(&self, job: JobSpec) -> Result<JobId> {
        if *self.shutdown.borrow() {
            return Err(DispatchError::ShuttingDown);
        }
        job.validate()?;

        let job_id = job.id.clone();
        let role = job.role.clone();

        if !self.pool.has_role(&role) {
            return self.reject_without_worker(job);
        }

        {
            let _admit = self.admission.lock();
            if let Err(e) = self.queue.enqueue(job.clone()) {
                warn!("Rejecting job {}: {}", job_id, e);
                return Err(e);
            }

            if let Err(e) = self.store.insert(JobRecord::new(job)) {
                self.queue.remove(&job_id);
                return Err(e.into());
            }
        }

        info!("Submitted job {} for role {}", job_id, role);
        self.metrics.inc_jobs_total("pending", &role);
        self.refresh_gauges();
        self.wake.notify_one();

        Ok(job_id)
    }

    fn reject_without_worker(&self, job: JobSpec) -> Result<JobId> {
        let job_id = job.id.clone();
        let role = job.role.clone();

        let mut record = JobRecord::new(job);
        record.status = JobStatus::failed_on_arrival(job_id.clone());
        record.result = Some(JobResult::failed(
            &record.status,
            JobError::new(
                ErrorKind::NoWorkerForRole,
                format!("no worker slot configured for role '{}'", role),
            ),
        ));
        self.store.insert(record)?;

        warn!("Job {} failed: no worker for role {}", job_id, role);
        self.metrics.inc_jobs_total("failed", &role);

        Err(DispatchError::NoWorkerForRole { job_id, role })
    }

    pub fn status(&self, job_id: &JobId) -> Result<JobStatus> {
        self.store
            .status(job_id)
            .ok_or_else(|| DispatchError::NotFound(job_id.clone()))
    }

    /// Wait until the job is terminal. A `None` timeout waits indefinitely.
    pub async fn await_result(&self, job_id: &JobId, timeout: Option<Duration>) -> Result<JobResult> {
        let outcome = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.wait_terminal(job_id))
                .await
                .unwrap_or_else(|_| Err(DispatchError::Timeout(job_id.clone()))),
            None => self.wait_terminal(job_id).await,
        };

        self.completions
            .remove_if(job_id, |_, tx| tx.receiver_count() == 0);
        outcome
    }

    async fn wait_terminal(&self, job_id: &JobId) -> Result<JobResult> {
        // Subscribe before reading the store so a completion in between is not missed
        let mut done = self.subscribe(job_id);

        loop {
            let record = self
                .store
                .get(job_id)
                .ok_or_else(|| DispatchError::NotFound(job_id.clone()))?;

            if record.status.is_terminal() {
                return record.result.ok_or_else(|| {
                    DispatchError::Storage(format!("job {} is terminal without a result", job_id))
                });
            }

            if done.changed().await.is_err() {
                done = self.subscribe(job_id);
            }
        }
    }

    fn subscribe(&self, job_id: &JobId) -> watch::Receiver<bool> {
        self.completions
            .entry(job_id.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    fn notify_done(&self, job_id: &JobId) {
        if let Some((_, tx)) = self.completions.remove(job_id) {
            tx.send_replace(true);
        }
    }

    /// Cancel a job. Returns false when it had already finished.
    ///
    /// A running attempt is not interrupted: its slot stays busy until the call
    /// returns, and whatever it returns is discarded.
    pub fn cancel(&self, job_id: &JobId) -> Result<bool> {
        let previous = self.store.update(job_id, |r| {
            let previous = r.status.state.name();
            if !r.status.cancel() {
                return Ok(None);
            }
            r.result = Some(JobResult::cancelled(&r.status));
            Ok(Some((previous, r.spec.role.clone())))
        })?;

        let (previous, role) = match previous {
            Some(cancelled) => cancelled,
            None => return Ok(false),
        };

        self.queue.remove(job_id);
        info!("Cancelled job {} (was {})", job_id, previous);
        self.metrics.inc_jobs_total("cancelled", &role);
        self.refresh_gauges();
        self.notify_done(job_id);

        Ok(true)
    }

    /// Queue position and wait estimate. `None` once the job has left the queue.
    pub fn position(&self, job_id: &JobId) -> Result<Option<QueuePosition>> {
        let spec = self
            .store
            .spec(job_id)
            .ok_or_else(|| DispatchError::NotFound(job_id.clone()))?;

        let position = match self.queue.position(job_id) {
            Some(position) => position,
            None => return Ok(None),
        };

        Ok(Some(QueuePosition {
            job_id: job_id.clone(),
            estimated_wait: self.estimate_wait(position, self.pool.slots_for_role(&spec.role)),
            role: spec.role,
            position,
        }))
    }

    /// `ceil(position / slots) * per_job_estimate`
    fn estimate_wait(&self, position: usize, slots: usize) -> Duration {
        let rounds = position.div_ceil(slots.max(1));
        self.estimate.lock().per_job().mul_f64(rounds as f64)
    }

    pub fn stats(&self) -> QueueStats {
        let by_state = self.store.count_by_state();
        let count = |state: &str| by_state.get(state).copied().unwrap_or(0);
        let queued = self.queue.len();
        let total_slots = self.pool.total_slots();

        QueueStats {
            pending: count("pending"),
            retrying: count("retrying"),
            queued,
            pending_by_tier: self.queue.count_by_tier(),
            pending_by_role: self.queue.count_by_role(),
            running: count("running") + count("assigned"),
            succeeded: count("succeeded"),
            failed: count("failed"),
            cancelled: count("cancelled"),
            busy_slots: self.pool.busy_count(),
            total_slots,
            max_queue_size: self.queue.capacity(),
            estimated_wait: self.estimate_wait(queued + 1, total_slots),
        }
    }

    pub fn slots(&self) -> Vec<SlotInfo> {
        self.pool.snapshot()
    }

    /// Delete the record of a finished job
    pub fn forget(&self, job_id: &JobId) -> Result<JobRecord> {
        let record = self.store.remove_terminal(job_id)?;
        self.completions.remove(job_id);
        debug!("Forgot job {}", job_id);
        Ok(record)
    }

    /// Stop scheduling and wait up to `grace` for busy slots to finish.
    /// Returns whether every slot drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("Dispatcher shutting down (grace {:?})", grace);
        self.shutdown.send_replace(true);
        self.wake.notify_one();

        let deadline = Instant::now() + grace;
        while self.pool.busy_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }

        let busy = self.pool.busy_count();
        if busy > 0 {
            warn!("{} slots still busy after shutdown grace period", busy);
        }

        if let Err(e) = self.store.sync() {
            error!("Failed to flush job store: {}", e);
        }

        busy == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn purge_expired(&self) {
        let retention = match self.config.retention() {
            Some(retention) => retention,
            None => return,
        };

        let age = match chrono::Duration::from_std(retention) {
            Ok(age) => age,
            Err(e) => {
                warn!("Retention {:?} out of range: {}", retention, e);
                return;
            }
        };

        if let Err(e) = self.store.purge_terminal_older_than(age) {
            error!("Failed to purge finished jobs: {}", e);
        }
    }

    /// Load pending jobs from the store into the queue
    fn recover_pending(&self) {
        let mut recovered = 0;

        for record in self.store.queued() {
            if !self.pool.has_role(&record.spec.role) {
                self.fail_orphan(&record);
                continue;
            }
            if record.status.state == JobState::Pending {
                self.queue.requeue(record.spec);
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("Loaded {} pending jobs into the queue", recovered);
        }
    }

    /// Re-arm backoff timers for jobs that were retrying when the process stopped
    fn recover_backoffs(self: &Arc<Self>) {
        for record in self.store.queued() {
            if let JobState::Retrying { retry_at, .. } = record.status.state {
                let delay = (retry_at - Utc::now()).to_std().unwrap_or_default();
                debug!("Job {} resumes backoff ({:?} left)", record.spec.id, delay);
                self.schedule_requeue(record.spec, delay);
            }
        }
    }

    /// A recovered job whose role no longer has slots
    fn fail_orphan(&self, record: &JobRecord) {
        let role = record.spec.role.clone();
        let recorded = self.store.update(record.id(), |r| {
            r.status.state = JobState::Failed;
            r.status.finished_at = Some(Utc::now());
            r.result = Some(JobResult::failed(
                &r.status,
                JobError::new(
                    ErrorKind::NoWorkerForRole,
                    format!("no worker slot configured for role '{}'", role),
                ),
            ));
            Ok(())
        });

        match recorded {
            Ok(()) => warn!("Recovered job {} failed: no worker for role {}", record.id(), role),
            Err(e) => error!("Failed to record orphaned job {}: {}", record.id(), e),
        }
    }

    fn refresh_gauges(&self) {
        self.metrics.jobs_pending.set(self.queue.len() as i64);
        self.metrics.slots_busy.set(self.pool.busy_count() as i64);
        self.metrics.update_queue_depth(&self.queue.count_by_tier());
    }
}
