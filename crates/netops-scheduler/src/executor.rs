//! Bounded executor: runs task references on a fixed-size worker pool with a
//! per-attempt timeout and a fixed-delay retry policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::store::{JobStore, MAX_CLAIM_LEASE_SECS};
use crate::task::{Task, TaskContext, TaskRegistry};
use crate::types::{JobDefinition, JobRun, RunStatus};

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Extra lease time on top of the job's worst-case run time.
const CLAIM_GRACE_SECS: u64 = 300;

static NEXT_EXECUTOR: AtomicU64 = AtomicU64::new(0);

/// Fixed-size worker pool with retry and timeout semantics.
///
/// At most one execution per job id is in flight at any time, across every
/// executor sharing the same store; a second request for the same job is
/// rejected with `AlreadyRunning`.
pub struct BoundedExecutor {
    store: Arc<dyn JobStore>,
    /// Identifies this executor's claims in the store.
    owner: String,
    registry: Arc<TaskRegistry>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    /// In-flight job ids with the time they were claimed.
    running: Arc<DashMap<String, DateTime<Utc>>>,
    /// Count of in-flight executions, watched by `drain`.
    inflight: Arc<watch::Sender<usize>>,
    /// Cancelled while the scheduler is stopping.
    shutdown: Mutex<CancellationToken>,
}

/// Exclusive right to execute one job id; released on drop.
struct Claim {
    job_id: String,
    owner: String,
    /// Set once the store-side claim is held.
    stored: bool,
    store: Arc<dyn JobStore>,
    running: Arc<DashMap<String, DateTime<Utc>>>,
    inflight: Arc<watch::Sender<usize>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.stored {
            if let Err(e) = self.store.release_claim(&self.job_id, &self.owner) {
                // The lease still expires on its own.
                error!(job_id = %self.job_id, error = %e, "failed to release job claim");
            }
        }
        self.running.remove(&self.job_id);
        self.inflight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl BoundedExecutor {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<TaskRegistry>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        let (inflight, _) = watch::channel(0usize);
        let owner = format!(
            "{}-{}-{}",
            std::process::id(),
            Utc::now().timestamp_micros(),
            NEXT_EXECUTOR.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            store,
            owner,
            registry,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            running: Arc::new(DashMap::new()),
            inflight: Arc::new(inflight),
            shutdown: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.contains_key(job_id)
    }

    /// In-flight job ids and when each execution was claimed, oldest first.
    pub fn running_jobs(&self) -> Vec<(String, DateTime<Utc>)> {
        let mut jobs: Vec<_> = self
            .running
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        jobs.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        jobs
    }

    /// Run `job` to completion on the caller's task, waiting for a free worker.
    ///
    /// Failures of the task itself are reported in the returned run, never as
    /// an `Err`; the errors are `AlreadyRunning` and a store failure while
    /// taking the claim.
    pub async fn execute(&self, job: &JobDefinition) -> Result<JobRun> {
        let claim = self.claim(job)?;
        let permit = self.acquire().await;
        Ok(self.run_claimed(job, claim, permit).await)
    }

    /// Wait for a free worker, then run `job` on a spawned task.
    ///
    /// Callers that submit in a given order get workers in that order, since
    /// the worker permit is taken before this returns.
    pub async fn submit(self: &Arc<Self>, job: JobDefinition) -> Result<JoinHandle<JobRun>> {
        let claim = self.claim(&job)?;
        let permit = self.acquire().await;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move {
            this.run_claimed(&job, claim, permit).await
        }))
    }

    /// Ask in-flight tasks to wrap up and abandon pending retries.
    pub fn begin_shutdown(&self) {
        self.shutdown.lock().expect("shutdown token poisoned").cancel();
    }

    /// Re-arm after a completed shutdown so the executor can be reused.
    pub fn reset_shutdown(&self) {
        *self.shutdown.lock().expect("shutdown token poisoned") = CancellationToken::new();
    }

    /// Wait until no execution is in flight.
    pub async fn drain(&self) {
        let mut rx = self.inflight.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().expect("shutdown token poisoned").clone()
    }

    /// Claim `job` locally, then in the store so other schedulers on the same
    /// database see it.
    fn claim(&self, job: &JobDefinition) -> Result<Claim> {
        match self.running.entry(job.id.clone()) {
            Entry::Occupied(_) => {
                return Err(SchedulerError::AlreadyRunning { id: job.id.clone() })
            }
            Entry::Vacant(slot) => {
                slot.insert(Utc::now());
            }
        }
        self.inflight.send_modify(|n| *n += 1);
        let mut claim = Claim {
            job_id: job.id.clone(),
            owner: self.owner.clone(),
            stored: false,
            store: Arc::clone(&self.store),
            running: Arc::clone(&self.running),
            inflight: Arc::clone(&self.inflight),
        };

        if !self.store.try_claim(&job.id, &self.owner, claim_lease(job))? {
            info!(job_id = %job.id, "job is running in another scheduler");
            return Err(SchedulerError::AlreadyRunning { id: job.id.clone() });
        }
        claim.stored = true;
        Ok(claim)
    }

    /// Restart the claim lease once a worker is available, so time spent
    /// queued does not count against it.
    fn renew_claim(&self, job: &JobDefinition) {
        match self.store.try_claim(&job.id, &self.owner, claim_lease(job)) {
            Ok(true) => {}
            Ok(false) => warn!(
                job_id = %job.id,
                "claim lease expired while queued; another scheduler took it"
            ),
            Err(e) => warn!(job_id = %job.id, error = %e, "failed to renew job claim"),
        }
    }

    async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .expect("worker semaphore is never closed")
    }

    async fn run_claimed(
        &self,
        job: &JobDefinition,
        _claim: Claim,
        permit: OwnedSemaphorePermit,
    ) -> JobRun {
        self.renew_claim(job);
        let mut run = JobRun::started(&job.id, Utc::now().trunc_subsecs(6));
        let mut permit = Some(permit);

        let Some(task) = self.registry.resolve(&job.task_ref) else {
            // Retrying cannot make an unregistered task appear.
            run.status = RunStatus::Failed;
            run.error = Some(format!("unknown task reference: {}", job.task_ref));
            return self.finish(run);
        };

        info!(job_id = %job.id, task_ref = %job.task_ref, "job started");
        let shutdown = self.shutdown_token();
        let mut attempt: u32 = 0;

        loop {
            if permit.is_none() {
                permit = Some(self.acquire().await);
            }

            match self.attempt(job, &task, attempt, &shutdown).await {
                Ok(output) => {
                    run.status = RunStatus::Completed;
                    run.output = output;
                    run.error = None;
                    break;
                }
                Err(e) => {
                    run.error = Some(e.to_string());
                    if attempt >= job.max_retries {
                        run.status = RunStatus::Failed;
                        break;
                    }
                    warn!(
                        job_id = %job.id,
                        attempt,
                        max_retries = job.max_retries,
                        delay_secs = job.retry_delay_seconds,
                        error = %e,
                        "attempt failed, retrying"
                    );

                    // Give the worker back while waiting out the delay.
                    permit = None;
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(job.retry_delay_seconds)) => {}
                        _ = shutdown.cancelled() => {
                            info!(job_id = %job.id, attempt, "shutdown during retry delay; run cancelled");
                            run.status = RunStatus::Cancelled;
                            break;
                        }
                    }
                    attempt += 1;
                }
            }
        }

        drop(permit);
        run.retry_count = attempt;
        run.end_time = Some(Utc::now().trunc_subsecs(6));
        self.finish(run)
    }

    /// One invocation under the job's timeout, isolated on its own task so a
    /// panic or an overrun cannot take the worker down with it.
    async fn attempt(
        &self,
        job: &JobDefinition,
        task: &Arc<dyn Task>,
        attempt: u32,
        shutdown: &CancellationToken,
    ) -> Result<Option<String>> {
        let timeout = Duration::from_secs(job.timeout_seconds);
        let cancel = shutdown.child_token();
        let ctx = TaskContext {
            job_id: job.id.clone(),
            attempt,
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
            deadline: deadline_after(timeout),
            cancel: cancel.clone(),
        };

        let task = Arc::clone(task);
        let mut handle = tokio::spawn(async move { task.run(ctx).await });

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(SchedulerError::Execution(e.to_string())),
            Ok(Err(join_err)) => {
                let detail = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "task was cancelled".to_string()
                };
                Err(SchedulerError::Execution(format!("task panicked: {detail}")))
            }
            Err(_elapsed) => {
                cancel.cancel();
                handle.abort();
                Err(SchedulerError::ExecutionTimeout {
                    secs: job.timeout_seconds,
                })
            }
        }
    }

    /// Persist the final outcome. A failed write is logged and flagged on the
    /// run; the in-memory result is still returned to the caller.
    fn finish(&self, mut run: JobRun) -> JobRun {
        if run.end_time.is_none() {
            run.end_time = Some(Utc::now().trunc_subsecs(6));
        }
        match self.store.record_run(&run) {
            Ok(id) => {
                run.id = Some(id);
                run.persisted = true;
            }
            Err(e) => {
                error!(job_id = %run.job_id, error = %e, "run outcome not persisted; history unreliable");
                run.persisted = false;
            }
        }

        match run.status {
            RunStatus::Completed => {
                info!(job_id = %run.job_id, retry_count = run.retry_count, "job completed")
            }
            status => warn!(
                job_id = %run.job_id,
                %status,
                retry_count = run.retry_count,
                error = run.error.as_deref().unwrap_or_default(),
                "job did not complete"
            ),
        }
        run
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Worst-case time the job can hold its claim: every attempt timing out, with
/// the retry delay between attempts.
fn claim_lease(job: &JobDefinition) -> ChronoDuration {
    let attempts = u64::from(job.max_retries).saturating_add(1);
    let secs = job
        .timeout_seconds
        .saturating_mul(attempts)
        .saturating_add(job.retry_delay_seconds.saturating_mul(u64::from(job.max_retries)))
        .saturating_add(CLAIM_GRACE_SECS);
    let secs = i64::try_from(secs).unwrap_or(MAX_CLAIM_LEASE_SECS).min(MAX_CLAIM_LEASE_SECS);
    ChronoDuration::seconds(secs)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
