use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use netops_core::SchedulerSettings;

use crate::error::{Result, SchedulerError};
use crate::executor::BoundedExecutor;
use crate::gate::{DependencyGate, Readiness};
use crate::schedule::{CronEvaluator, ScheduleEvaluator};
use crate::store::JobStore;
use crate::task::TaskRegistry;
use crate::types::{ImportReport, JobDefinition, JobRun, JobStatusReport, Registration, RunStatus};
use crate::validate::{check_dependencies, validate_definition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Stopped,
    Running,
}

/// What happened to the due jobs of one scheduling cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleReport {
    pub submitted: Vec<String>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Skipped because a dependency failed this cycle.
    pub blocked: Vec<String>,
    /// Skipped because dependencies never completed this cycle.
    pub waiting: Vec<String>,
    /// Skipped because a manual run of the same job was in flight.
    pub already_running: Vec<String>,
    /// Schedules that failed to evaluate.
    pub invalid: Vec<String>,
}

struct Runner {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The driving loop and the service contract offered to front ends.
///
/// One instance owns the scheduling decisions for a store. Collaborators are
/// injected so tests can swap any of them.
pub struct SchedulerController {
    store: Arc<dyn JobStore>,
    evaluator: Arc<dyn ScheduleEvaluator>,
    executor: Arc<BoundedExecutor>,
    gate: Arc<DependencyGate>,
    settings: SchedulerSettings,
    /// Last trigger instant fired per job.
    last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Serialises cycles; the gate belongs to one cycle at a time.
    cycle_lock: tokio::sync::Mutex<()>,
    runner: Mutex<Option<Runner>>,
}

impl SchedulerController {
    pub fn new(
        store: Arc<dyn JobStore>,
        evaluator: Arc<dyn ScheduleEvaluator>,
        executor: Arc<BoundedExecutor>,
        gate: Arc<DependencyGate>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            store,
            evaluator,
            executor,
            gate,
            settings,
            last_fired: Mutex::new(HashMap::new()),
            cycle_lock: tokio::sync::Mutex::new(()),
            runner: Mutex::new(None),
        }
    }

    /// Controller with the cron evaluator, a fresh gate and an executor
    /// sized from `settings.max_workers`.
    pub fn with_defaults(
        store: Arc<dyn JobStore>,
        registry: Arc<TaskRegistry>,
        settings: SchedulerSettings,
    ) -> Self {
        let executor = Arc::new(BoundedExecutor::new(
            Arc::clone(&store),
            registry,
            settings.max_workers,
        ));
        Self::new(
            store,
            Arc::new(CronEvaluator),
            executor,
            Arc::new(DependencyGate::new()),
            settings,
        )
    }

    pub fn executor(&self) -> &Arc<BoundedExecutor> {
        &self.executor
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    // ---- job management ---------------------------------------------------

    /// Validate and store a definition, replacing any job with the same id.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub fn register_job(&self, job: JobDefinition) -> Result<Registration> {
        validate_definition(&job, self.evaluator.as_ref())?;

        let existing = self.store.list_all()?;
        let mut warnings = check_dependencies(&job, &existing)?;
        if !self.executor.registry().contains(&job.task_ref) {
            warnings.push(format!(
                "job {} uses unregistered task reference {}",
                job.id, job.task_ref
            ));
        }
        for warning in &warnings {
            warn!("{warning}");
        }

        let replaced = existing.iter().any(|j| j.id == job.id);
        self.store.register(&job)?;
        info!(replaced, priority = %job.priority, schedule = %job.schedule, "job registered");

        Ok(Registration {
            job_id: job.id,
            replaced,
            warnings,
        })
    }

    #[instrument(skip(self))]
    pub fn unregister_job(&self, id: &str) -> Result<()> {
        if !self.store.unregister(id)? {
            return Err(SchedulerError::not_found(id));
        }
        self.last_fired
            .lock()
            .expect("last-fired map poisoned")
            .remove(id);

        let dependents: Vec<String> = self
            .store
            .list_all()?
            .into_iter()
            .filter(|j| j.dependencies.contains(id))
            .map(|j| j.id)
            .collect();
        if !dependents.is_empty() {
            warn!(?dependents, "removed job is still a dependency of other jobs");
        }
        info!("job unregistered");
        Ok(())
    }

    pub fn list_jobs(&self) -> Result<Vec<JobDefinition>> {
        self.store.list_all()
    }

    pub fn get_job(&self, id: &str) -> Result<JobDefinition> {
        self.store.get(id)?.ok_or_else(|| SchedulerError::not_found(id))
    }

    /// Status derived from the in-flight execution (here or in another
    /// scheduler on the same store), else the latest run.
    pub fn get_job_status(&self, id: &str) -> Result<JobStatusReport> {
        let job = self.get_job(id)?;

        let in_flight = match self
            .executor
            .running_jobs()
            .into_iter()
            .find(|(running, _)| *running == job.id)
        {
            Some((_, started)) => Some(started),
            None => self.store.claimed_at(&job.id)?,
        };
        if let Some(started) = in_flight {
            return Ok(JobStatusReport {
                job_id: job.id,
                last_status: Some(RunStatus::Running),
                last_run: Some(started),
                last_end: None,
                last_error: None,
                retry_count: None,
            });
        }

        let latest = self.store.latest_run(&job.id)?;
        Ok(JobStatusReport {
            job_id: job.id,
            last_status: latest.as_ref().map(|r| r.status),
            last_run: latest.as_ref().map(|r| r.start_time),
            last_end: latest.as_ref().and_then(|r| r.end_time),
            last_error: latest.as_ref().and_then(|r| r.error.clone()),
            retry_count: latest.as_ref().map(|r| r.retry_count),
        })
    }

    /// Next trigger for `job`, or `None` when it is disabled.
    pub fn get_next_run_time(&self, job: &JobDefinition) -> Result<Option<DateTime<Utc>>> {
        self.next_run_after(job, Utc::now())
    }

    pub fn next_run_after(
        &self,
        job: &JobDefinition,
        reference: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        if !job.enabled {
            return Ok(None);
        }
        self.evaluator.next_after(&job.schedule, reference).map(Some)
    }

    /// Execute a job immediately, skipping the schedule check.
    ///
    /// Dependencies must have completed in the current cycle. A second call
    /// while the job is in flight fails with `AlreadyRunning`.
    #[instrument(skip(self))]
    pub async fn run_job_now(&self, id: &str) -> Result<JobRun> {
        let job = self.get_job(id)?;

        match self.gate.readiness(&job) {
            Readiness::Ready => {}
            Readiness::Waiting(pending) | Readiness::Blocked(pending) => {
                return Err(SchedulerError::DependencyUnsatisfied {
                    id: job.id,
                    pending,
                });
            }
        }

        info!("manual run requested");
        let run = self.executor.execute(&job).await?;
        self.gate.mark(&job.id, run.succeeded());
        Ok(run)
    }

    pub fn history(&self, job_id: Option<&str>, limit: usize, offset: usize) -> Result<Vec<JobRun>> {
        self.store.history(job_id, limit, offset)
    }

    // ---- scheduling -------------------------------------------------------

    /// Run one scheduling cycle as if the clock read `now`, waiting for every
    /// submitted job to finish.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.cycle(now, None).await
    }

    async fn cycle(
        &self,
        now: DateTime<Utc>,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        self.gate.reset();

        let mut report = CycleReport::default();
        let mut pending = self.due_jobs(now, &mut report)?;
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut inflight: JoinSet<(String, std::result::Result<JobRun, JoinError>)> =
            JoinSet::new();
        let mut stopping = false;

        loop {
            let mut still_waiting = Vec::new();
            for job in std::mem::take(&mut pending) {
                if stopping {
                    still_waiting.push(job);
                    continue;
                }
                if self.gate.can_run(&job) {
                    match self.submit(&job, stop).await {
                        Ok(Some(handle)) => {
                            debug!(job_id = %job.id, priority = %job.priority, "job submitted");
                            report.submitted.push(job.id.clone());
                            let id = job.id.clone();
                            inflight.spawn(async move { (id, handle.await) });
                        }
                        Ok(None) => {
                            stopping = true;
                            still_waiting.push(job);
                        }
                        Err(SchedulerError::AlreadyRunning { id }) => {
                            warn!(job_id = %id, "job still running from an earlier run; skipped");
                            report.already_running.push(id);
                        }
                        Err(e) => return Err(e),
                    }
                } else if matches!(self.gate.readiness(&job), Readiness::Blocked(_)) {
                    report.blocked.push(job.id);
                } else {
                    still_waiting.push(job);
                }
            }
            pending = still_waiting;

            if stopping || pending.is_empty() {
                break;
            }
            // A completion may unblock a waiting dependent.
            match inflight.join_next().await {
                Some(joined) => self.settle(joined, &mut report),
                None => break,
            }
        }

        while let Some(joined) = inflight.join_next().await {
            self.settle(joined, &mut report);
        }
        for job in pending {
            debug!(job_id = %job.id, "dependencies not satisfied this cycle; skipped");
            report.waiting.push(job.id);
        }

        info!(
            submitted = report.submitted.len(),
            completed = report.completed.len(),
            failed = report.failed.len(),
            blocked = report.blocked.len(),
            waiting = report.waiting.len(),
            "scheduling cycle finished"
        );
        Ok(report)
    }

    /// Enabled jobs whose next trigger falls inside the lookahead window and
    /// has not been fired yet.
    fn due_jobs(&self, now: DateTime<Utc>, report: &mut CycleReport) -> Result<Vec<JobDefinition>> {
        let horizon = now + chrono::Duration::seconds(self.settings.lookahead_secs as i64);
        let mut fired = self.last_fired.lock().expect("last-fired map poisoned");
        let mut due = Vec::new();

        for job in self.store.list_all()?.into_iter().filter(|j| j.enabled) {
            match self.evaluator.next_after(&job.schedule, now) {
                Ok(next) if next <= horizon => {
                    if fired.get(&job.id) == Some(&next) {
                        debug!(job_id = %job.id, trigger = %next, "trigger already fired");
                        continue;
                    }
                    debug!(job_id = %job.id, trigger = %next, "job due");
                    fired.insert(job.id.clone(), next);
                    due.push(job);
                }
                Ok(_) => {}
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "schedule evaluation failed; job skipped");
                    report.invalid.push(job.id);
                }
            }
        }
        Ok(due)
    }

    /// Hand `job` to the executor unless a stop arrives first.
    async fn submit(
        &self,
        job: &JobDefinition,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<Option<JoinHandle<JobRun>>> {
        let Some(stop) = stop else {
            return self.executor.submit(job.clone()).await.map(Some);
        };
        tokio::select! {
            biased;
            _ = stop_signalled(stop.clone()) => Ok(None),
            submitted = self.executor.submit(job.clone()) => submitted.map(Some),
        }
    }

    fn settle(
        &self,
        joined: std::result::Result<(String, std::result::Result<JobRun, JoinError>), JoinError>,
        report: &mut CycleReport,
    ) {
        match joined {
            Ok((id, Ok(run))) => {
                self.gate.mark(&id, run.succeeded());
                if run.succeeded() {
                    report.completed.push(id);
                } else {
                    report.failed.push(id);
                }
            }
            Ok((id, Err(e))) => {
                error!(job_id = %id, error = %e, "execution task aborted");
                self.gate.mark(&id, false);
                report.failed.push(id);
            }
            Err(e) => error!(error = %e, "completion watcher aborted"),
        }
    }

    // ---- lifecycle --------------------------------------------------------

    pub fn state(&self) -> ControllerState {
        match self.runner.lock().expect("runner poisoned").as_ref() {
            Some(runner) if !runner.handle.is_finished() => ControllerState::Running,
            _ => ControllerState::Stopped,
        }
    }

    /// Spawn the scheduling loop on the current runtime.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut runner = self.runner.lock().expect("runner poisoned");
        if runner.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SchedulerError::Lifecycle(
                "scheduler is already running".to_string(),
            ));
        }
        // Refuse to start on a store that cannot even be read.
        self.store.list_all()?;

        let (shutdown, rx) = watch::channel(false);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop(rx).await });
        *runner = Some(Runner { shutdown, handle });
        Ok(())
    }

    /// Stop picking up jobs, let the current cycle and in-flight executions
    /// finish, then flush the job export if configured.
    pub async fn stop(&self) -> Result<()> {
        let runner = self.runner.lock().expect("runner poisoned").take();
        let Some(runner) = runner else {
            debug!("stop requested while already stopped");
            return Ok(());
        };

        info!("scheduler stopping");
        let _ = runner.shutdown.send(true);
        self.executor.begin_shutdown();
        if let Err(e) = runner.handle.await {
            error!(error = %e, "scheduler loop terminated abnormally");
        }
        self.executor.drain().await;
        self.executor.reset_shutdown();

        if self.settings.save_jobs_on_stop && self.settings.jobs_file.is_some() {
            let saved = self.save_config()?;
            info!(jobs = saved, "job definitions saved");
        }
        info!("scheduler stopped");
        Ok(())
    }

    async fn run_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            tick_secs = self.settings.tick_secs,
            max_workers = self.executor.max_workers(),
            "scheduler started"
        );
        let mut interval = tokio::time::interval(Duration::from_secs(self.settings.tick_secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.cycle(Utc::now(), Some(&shutdown)).await {
                error!(code = e.code(), error = %e, "scheduling cycle failed");
            }
        }
        info!("scheduler loop exited");
    }

    // ---- persisted job configuration --------------------------------------

    /// Write every job to the configured jobs file. Returns the job count.
    pub fn save_config(&self) -> Result<usize> {
        let path = self.jobs_file()?;
        self.export_to(&path)
    }

    /// Import the configured jobs file.
    pub fn load_config(&self) -> Result<ImportReport> {
        let path = self.jobs_file()?;
        self.import_from(&path)
    }

    fn jobs_file(&self) -> Result<std::path::PathBuf> {
        self.settings.jobs_file_path().ok_or_else(|| {
            SchedulerError::Validation("no scheduler.jobs_file configured".to_string())
        })
    }

    /// Write the job export (a JSON array) to `path`.
    pub fn export_to(&self, path: &Path) -> Result<usize> {
        let jobs = self.store.export_jobs()?;
        let json = serde_json::to_string_pretty(&jobs)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        debug!(path = %path.display(), jobs = jobs.len(), "jobs exported");
        Ok(jobs.len())
    }

    /// Register every record of a job export through full validation.
    ///
    /// A bad record is reported in `rejected`; the rest are still imported.
    pub fn import_from(&self, path: &Path) -> Result<ImportReport> {
        let raw = std::fs::read_to_string(path)?;
        let records: Vec<Value> = serde_json::from_str(&raw)?;
        let mut report = ImportReport::default();

        for record in records {
            let id = record
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("<missing id>")
                .to_string();
            let outcome = serde_json::from_value::<JobDefinition>(record)
                .map_err(SchedulerError::from)
                .and_then(|job| self.register_job(job));
            match outcome {
                Ok(_) => report.imported += 1,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "job rejected during import");
                    report.rejected.push((id, e.to_string()));
                }
            }
        }

        info!(
            path = %path.display(),
            imported = report.imported,
            rejected = report.rejected.len(),
            "jobs imported"
        );
        Ok(report)
    }
}

/// Resolves once `true` is published or the sender is gone.
async fn stop_signalled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteJobStore;
    use crate::task::{TaskContext, TaskError};
    use crate::types::Priority;
    use chrono::TimeZone;

    fn registry() -> TaskRegistry {
        let registry = TaskRegistry::new();
        registry.register_fn("ok", |_| async { Ok::<_, TaskError>(Some("ok".into())) });
        registry.register_fn("fail", |_| async {
            Err::<Option<String>, _>(TaskError::failed("boom"))
        });
        registry.register_fn("slow", |ctx: TaskContext| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = ctx.cancel.cancelled() => {}
            }
            Ok::<_, TaskError>(None)
        });
        registry
    }

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            jobs_file: None,
            ..SchedulerSettings::default()
        }
    }

    fn controller() -> (SchedulerController, Arc<SqliteJobStore>) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let ctl = SchedulerController::with_defaults(store.clone(), Arc::new(registry()), settings());
        (ctl, store)
    }

    fn job(id: &str, task_ref: &str) -> JobDefinition {
        JobDefinition::new(id, id, task_ref, "* * * * *").with_retries(0, 0)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 19, 10, 0, 30).unwrap()
    }

    #[test]
    fn registration_reports_replacement_and_warnings() {
        let (ctl, _) = controller();
        let first = ctl.register_job(job("b", "ok").with_dependency("a")).unwrap();
        assert!(!first.replaced);
        assert_eq!(first.warnings, vec!["job b depends on unknown job a"]);

        let second = ctl.register_job(job("b", "ok")).unwrap();
        assert!(second.replaced);
        assert!(second.warnings.is_empty());
        assert_eq!(ctl.list_jobs().unwrap().len(), 1);

        let unknown = ctl.register_job(job("c", "missing.task")).unwrap();
        assert!(unknown.warnings[0].contains("unregistered task reference"));
    }

    #[test]
    fn invalid_definitions_are_not_stored() {
        let (ctl, store) = controller();
        let mut bad = job("a", "ok");
        bad.schedule = "61 * * * *".into();
        assert_eq!(ctl.register_job(bad).unwrap_err().code(), "INVALID_SCHEDULE");

        ctl.register_job(job("a", "ok").with_dependency("b")).unwrap();
        let err = ctl.register_job(job("b", "ok").with_dependency("a")).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(store.get("b").unwrap().is_none());
    }

    #[test]
    fn unregister_unknown_is_not_found() {
        let (ctl, _) = controller();
        assert_eq!(ctl.unregister_job("nope").unwrap_err().code(), "NOT_FOUND");
        ctl.register_job(job("a", "ok")).unwrap();
        ctl.unregister_job("a").unwrap();
        assert_eq!(ctl.get_job("a").unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn cycle_runs_due_jobs_once_per_trigger() {
        let (ctl, store) = controller();
        ctl.register_job(job("every-minute", "ok")).unwrap();
        ctl.register_job(JobDefinition::new("yearly", "yearly", "ok", "0 0 1 1 *")).unwrap();
        ctl.register_job(job("off", "ok").disabled()).unwrap();

        let report = ctl.run_cycle(now()).await.unwrap();
        assert_eq!(report.submitted, vec!["every-minute"]);
        assert_eq!(report.completed, vec!["every-minute"]);

        // Same trigger instant (10:01) again: nothing new fires.
        let again = ctl.run_cycle(now() + chrono::Duration::seconds(10)).await.unwrap();
        assert!(again.submitted.is_empty());

        // Next trigger (10:02) fires.
        let later = ctl.run_cycle(now() + chrono::Duration::seconds(60)).await.unwrap();
        assert_eq!(later.submitted, vec!["every-minute"]);
        assert_eq!(store.history(Some("every-minute"), 10, 0).unwrap().len(), 2);
        assert!(store.history(Some("off"), 10, 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn dependents_follow_their_prerequisites() {
        let (ctl, _) = controller();
        ctl.register_job(job("poll", "ok")).unwrap();
        ctl.register_job(job("report", "ok").with_dependency("poll")).unwrap();
        ctl.register_job(job("backup", "fail")).unwrap();
        ctl.register_job(job("archive", "ok").with_dependency("backup")).unwrap();
        ctl.register_job(job("orphan", "ok").with_dependency("ghost")).unwrap();

        let report = ctl.run_cycle(now()).await.unwrap();
        assert!(report.completed.contains(&"poll".to_string()));
        assert!(report.completed.contains(&"report".to_string()));
        assert_eq!(report.failed, vec!["backup"]);
        assert_eq!(report.blocked, vec!["archive"]);
        assert_eq!(report.waiting, vec!["orphan"]);
        assert!(!report.submitted.contains(&"archive".to_string()));
    }

    struct NeverEvaluates;

    impl ScheduleEvaluator for NeverEvaluates {
        fn next_after(&self, expression: &str, _: DateTime<Utc>) -> Result<DateTime<Utc>> {
            Err(SchedulerError::InvalidSchedule {
                expression: expression.to_string(),
                reason: "evaluator offline".to_string(),
            })
        }
        fn validate(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn evaluation_failure_only_skips_that_job() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::in_memory().unwrap());
        let executor = Arc::new(BoundedExecutor::new(store.clone(), Arc::new(registry()), 1));
        let ctl = SchedulerController::new(
            store,
            Arc::new(NeverEvaluates),
            executor,
            Arc::new(DependencyGate::new()),
            settings(),
        );
        ctl.register_job(job("a", "ok")).unwrap();

        let report = ctl.run_cycle(now()).await.unwrap();
        assert_eq!(report.invalid, vec!["a"]);
        assert!(report.submitted.is_empty());
        assert_eq!(ctl.get_next_run_time(&job("a", "ok")).unwrap_err().code(), "INVALID_SCHEDULE");
    }

    #[tokio::test]
    async fn run_now_checks_existence_and_dependencies() {
        let (ctl, _) = controller();
        assert_eq!(ctl.run_job_now("ghost").await.unwrap_err().code(), "NOT_FOUND");

        ctl.register_job(job("poll", "ok")).unwrap();
        ctl.register_job(job("report", "ok").with_dependency("poll")).unwrap();

        match ctl.run_job_now("report").await.unwrap_err() {
            SchedulerError::DependencyUnsatisfied { id, pending } => {
                assert_eq!(id, "report");
                assert_eq!(pending, vec!["poll"]);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(ctl.run_job_now("poll").await.unwrap().succeeded());
        assert!(ctl.run_job_now("report").await.unwrap().succeeded());
    }

    #[tokio::test]
    async fn status_tracks_latest_and_in_flight_runs() {
        let (ctl, _) = controller();
        ctl.register_job(job("slow", "slow")).unwrap();
        ctl.register_job(job("bad", "fail")).unwrap();

        let idle = ctl.get_job_status("bad").unwrap();
        assert_eq!(idle.last_status, None);

        ctl.run_job_now("bad").await.unwrap();
        let status = ctl.get_job_status("bad").unwrap();
        assert_eq!(status.last_status, Some(RunStatus::Failed));
        assert_eq!(status.retry_count, Some(0));
        assert!(status.last_error.unwrap().contains("boom"));

        let ctl = Arc::new(ctl);
        let background = {
            let ctl = Arc::clone(&ctl);
            tokio::spawn(async move { ctl.run_job_now("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            ctl.get_job_status("slow").unwrap().last_status,
            Some(RunStatus::Running)
        );
        background.await.unwrap().unwrap();
        assert_eq!(
            ctl.get_job_status("slow").unwrap().last_status,
            Some(RunStatus::Completed)
        );
    }

    #[tokio::test]
    async fn status_and_run_now_respect_claims_held_elsewhere() {
        let (ctl, store) = controller();
        ctl.register_job(job("poll", "ok")).unwrap();
        assert!(store
            .try_claim("poll", "other-netopsd", chrono::Duration::minutes(5))
            .unwrap());

        let status = ctl.get_job_status("poll").unwrap();
        assert_eq!(status.last_status, Some(RunStatus::Running));
        assert_eq!(
            ctl.run_job_now("poll").await.unwrap_err().code(),
            "ALREADY_RUNNING"
        );
        let report = ctl.run_cycle(now()).await.unwrap();
        assert_eq!(report.already_running, vec!["poll"]);

        store.release_claim("poll", "other-netopsd").unwrap();
        assert!(ctl.run_job_now("poll").await.unwrap().succeeded());
    }

    #[tokio::test]
    async fn stop_mid_cycle_submits_nothing_new() {
        let registry = registry();
        registry.register_fn("linger", |_| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Ok::<_, TaskError>(None)
        });
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let ctl = Arc::new(SchedulerController::with_defaults(
            store.clone(),
            Arc::new(registry),
            SchedulerSettings {
                max_workers: 1,
                ..settings()
            },
        ));
        ctl.register_job(job("first", "linger").with_priority(Priority::High))
            .unwrap();
        ctl.register_job(job("second", "ok")).unwrap();

        ctl.start().unwrap();
        // "first" holds the only worker; "second" is queued behind it.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctl.executor().is_running("first"));
        ctl.stop().await.unwrap();

        let first = store.history(Some("first"), 10, 0).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, RunStatus::Completed);
        assert!(store.history(Some("second"), 10, 0).unwrap().is_empty());
        assert!(!ctl.executor().is_running("second"));
        assert!(store.claimed_at("second").unwrap().is_none());
    }

    #[test]
    fn next_run_time_skips_disabled_jobs() {
        let (ctl, _) = controller();
        let enabled = JobDefinition::new("a", "a", "ok", "*/5 * * * *");
        let next = ctl.next_run_after(&enabled, now()).unwrap();
        assert_eq!(next, Some(Utc.with_ymd_and_hms(2026, 1, 19, 10, 5, 0).unwrap()));
        assert_eq!(ctl.next_run_after(&enabled.disabled(), now()).unwrap(), None);
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let (ctl, _) = controller();
        let ctl = Arc::new(ctl);
        assert_eq!(ctl.state(), ControllerState::Stopped);

        ctl.start().unwrap();
        assert_eq!(ctl.state(), ControllerState::Running);
        assert_eq!(ctl.start().unwrap_err().code(), "LIFECYCLE_ERROR");

        ctl.stop().await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Stopped);
        // Stopping twice is harmless; restarting works.
        ctl.stop().await.unwrap();
        ctl.start().unwrap();
        ctl.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_flushes_jobs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/jobs.json");
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let ctl = Arc::new(SchedulerController::with_defaults(
            store,
            Arc::new(registry()),
            SchedulerSettings {
                jobs_file: Some(path.to_string_lossy().into_owned()),
                ..SchedulerSettings::default()
            },
        ));
        ctl.register_job(job("a", "ok")).unwrap();

        ctl.start().unwrap();
        ctl.stop().await.unwrap();

        let saved: Vec<JobDefinition> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, vec![job("a", "ok")]);
    }

    #[test]
    fn save_config_requires_jobs_file() {
        let (ctl, _) = controller();
        assert_eq!(ctl.save_config().unwrap_err().code(), "VALIDATION_ERROR");
    }

    #[test]
    fn import_reports_rejected_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "good", "name": "Good", "task_ref": "ok", "schedule": "0 * * * *"},
                {"id": "bad-priority", "name": "x", "task_ref": "ok", "schedule": "0 * * * *", "priority": 9},
                {"id": "bad-cron", "name": "x", "task_ref": "ok", "schedule": "whenever"}
            ]"#,
        )
        .unwrap();

        let (ctl, _) = controller();
        let report = ctl.import_from(&path).unwrap();
        assert_eq!(report.imported, 1);
        let rejected: Vec<&str> = report.rejected.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(rejected, vec!["bad-priority", "bad-cron"]);

        let good = ctl.get_job("good").unwrap();
        assert_eq!(good.max_retries, crate::types::DEFAULT_MAX_RETRIES);
        assert!(good.enabled);
    }
}
