//! End-to-end behaviour of the scheduler through its public API.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use netops_core::SchedulerSettings;
use netops_scheduler::{
    schedule, JobDefinition, JobStore, Priority, RunStatus, SchedulerController, SchedulerError,
    SqliteJobStore, TaskError, TaskRegistry,
};

fn settings(max_workers: usize) -> SchedulerSettings {
    SchedulerSettings {
        max_workers,
        jobs_file: None,
        ..SchedulerSettings::default()
    }
}

fn controller_with(
    registry: TaskRegistry,
    max_workers: usize,
) -> (Arc<SchedulerController>, Arc<SqliteJobStore>) {
    let store = Arc::new(SqliteJobStore::in_memory().unwrap());
    let ctl = SchedulerController::with_defaults(
        store.clone(),
        Arc::new(registry),
        settings(max_workers),
    );
    (Arc::new(ctl), store)
}

fn base_registry() -> TaskRegistry {
    let registry = TaskRegistry::new();
    registry.register_fn("ok", |_| async { Ok::<_, TaskError>(Some("done".into())) });
    registry.register_fn("fail", |_| async {
        Err::<Option<String>, _>(TaskError::failed("link down"))
    });
    registry.register_fn("nap", |_| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok::<_, TaskError>(None)
    });
    registry
}

fn every_minute(id: &str, task_ref: &str) -> JobDefinition {
    JobDefinition::new(id, id, task_ref, "* * * * *").with_retries(0, 0)
}

fn cycle_time(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 19, 10, minute, 30).unwrap()
}

#[test]
fn registering_same_id_twice_keeps_latest() {
    let (ctl, _) = controller_with(base_registry(), 2);
    ctl.register_job(every_minute("poll", "ok")).unwrap();
    ctl.register_job(every_minute("other", "ok")).unwrap();

    let updated = JobDefinition::new("poll", "Poll devices", "fail", "*/10 * * * *")
        .with_priority(Priority::High)
        .with_retries(7, 5);
    let reg = ctl.register_job(updated.clone()).unwrap();
    assert!(reg.replaced);

    let jobs = ctl.list_jobs().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(ctl.get_job("poll").unwrap(), updated);
    assert_eq!(ctl.get_job("other").unwrap(), every_minute("other", "ok"));
}

#[tokio::test]
async fn concurrent_manual_runs_never_overlap() {
    let (ctl, store) = controller_with(base_registry(), 4);
    ctl.register_job(every_minute("nap", "nap")).unwrap();

    let (first, second) = tokio::join!(ctl.run_job_now("nap"), ctl.run_job_now("nap"));
    let outcomes = [first, second];
    let ran = outcomes.iter().filter(|r| r.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|r| matches!(r, Err(SchedulerError::AlreadyRunning { .. })))
        .count();
    assert_eq!((ran, rejected), (1, 1));
    assert_eq!(store.history(Some("nap"), 10, 0).unwrap().len(), 1);
}

#[tokio::test]
async fn always_failing_task_exhausts_retries() {
    let calls = Arc::new(AtomicU32::new(0));
    let registry = TaskRegistry::new();
    let counter = calls.clone();
    registry.register_fn("always-fails", move |_| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<Option<String>, _>(TaskError::failed("SNMP timeout"))
        }
    });
    let (ctl, store) = controller_with(registry, 1);
    ctl.register_job(every_minute("poll", "always-fails").with_retries(2, 0))
        .unwrap();

    let run = ctl.run_job_now("poll").await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.retry_count, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let status = ctl.get_job_status("poll").unwrap();
    assert_eq!(status.last_status, Some(RunStatus::Failed));
    assert_eq!(status.retry_count, Some(2));
    assert_eq!(store.history(Some("poll"), 10, 0).unwrap().len(), 1);
}

#[tokio::test]
async fn slow_task_is_cut_off_at_timeout() {
    let registry = TaskRegistry::new();
    registry.register_fn("eventually-ok", |_| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok::<_, TaskError>(Some("finished".into()))
    });
    let (ctl, _) = controller_with(registry, 1);
    ctl.register_job(every_minute("backup", "eventually-ok").with_timeout(1))
        .unwrap();

    let started = std::time::Instant::now();
    let run = ctl.run_job_now("backup").await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.output, None);
    assert!(run.error.unwrap().contains("1 seconds"));
}

#[tokio::test]
async fn failed_prerequisite_blocks_dependent_for_the_cycle() {
    let (ctl, store) = controller_with(base_registry(), 2);
    ctl.register_job(every_minute("a", "fail")).unwrap();
    ctl.register_job(every_minute("b", "ok").with_dependency("a")).unwrap();

    let report = ctl.run_cycle(cycle_time(0)).await.unwrap();
    assert_eq!(report.failed, vec!["a"]);
    assert_eq!(report.blocked, vec!["b"]);
    assert!(store.history(Some("b"), 10, 0).unwrap().is_empty());

    // Once the prerequisite succeeds in a cycle, the dependent follows in it.
    ctl.register_job(every_minute("a", "ok")).unwrap();
    let report = ctl.run_cycle(cycle_time(1)).await.unwrap();
    assert_eq!(report.completed, vec!["a", "b"]);
    let b_runs = store.history(Some("b"), 10, 0).unwrap();
    let a_run = store.latest_run("a").unwrap().unwrap();
    assert_eq!(b_runs.len(), 1);
    assert!(b_runs[0].start_time >= a_run.end_time.unwrap());
}

#[tokio::test]
async fn higher_priority_starts_first_on_single_worker() {
    let (ctl, store) = controller_with(base_registry(), 1);
    for (id, priority) in [
        ("low", Priority::Low),
        ("critical", Priority::Critical),
        ("normal", Priority::Normal),
    ] {
        ctl.register_job(every_minute(id, "nap").with_priority(priority))
            .unwrap();
    }

    let report = ctl.run_cycle(cycle_time(0)).await.unwrap();
    assert_eq!(report.submitted, vec!["critical", "normal", "low"]);

    let start = |id: &str| store.latest_run(id).unwrap().unwrap().start_time;
    assert!(start("critical") <= start("normal"));
    assert!(start("normal") <= start("low"));
}

#[test]
fn every_five_minutes_lands_on_next_boundary() {
    let base = Utc.with_ymd_and_hms(2026, 2, 28, 23, 50, 0).unwrap();
    for offset_secs in [0, 1, 59, 60, 299, 300, 301, 599, 4_321] {
        let reference = base + ChronoDuration::seconds(offset_secs);
        let next = schedule::next_after("*/5 * * * *", reference).unwrap();

        assert!(next > reference, "{next} not after {reference}");
        assert_eq!(next.minute() % 5, 0);
        assert_eq!(next.second(), 0);
        assert!(next - reference <= ChronoDuration::minutes(5));
    }
}

#[test]
fn export_then_import_reproduces_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.json");

    let (source, _) = controller_with(base_registry(), 2);
    source
        .register_job(
            JobDefinition::new("poll", "Poll switches", "ok", "*/5 * * * *")
                .with_priority(Priority::High)
                .with_retries(5, 30)
                .with_timeout(120)
                .with_args(vec![serde_json::json!("core-sw-01")])
                .with_kwarg("community", serde_json::json!("public")),
        )
        .unwrap();
    source
        .register_job(
            JobDefinition::new("report", "Daily report", "ok", "0 6 * * 1-5")
                .with_dependency("poll")
                .disabled(),
        )
        .unwrap();
    assert_eq!(source.export_to(&path).unwrap(), 2);

    let (target, _) = controller_with(base_registry(), 2);
    let report = target.import_from(&path).unwrap();
    assert_eq!(report.imported, 2);
    assert!(report.rejected.is_empty());
    assert_eq!(target.list_jobs().unwrap(), source.list_jobs().unwrap());

    // Importing the same export again changes nothing.
    target.import_from(&path).unwrap();
    assert_eq!(target.list_jobs().unwrap(), source.list_jobs().unwrap());
}

#[tokio::test]
async fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state/scheduler.db");

    {
        let store = Arc::new(SqliteJobStore::open(&db_path).unwrap());
        let ctl = SchedulerController::with_defaults(
            store,
            Arc::new(base_registry()),
            settings(1),
        );
        ctl.register_job(every_minute("poll", "ok")).unwrap();
        ctl.run_job_now("poll").await.unwrap();
        ctl.unregister_job("poll").unwrap();
    }

    let reopened = SqliteJobStore::open(&db_path).unwrap();
    assert!(reopened.list_all().unwrap().is_empty());
    let history = reopened.history(Some("poll"), 10, 0).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].output.as_deref(), Some("done"));
}

#[tokio::test]
async fn schedulers_sharing_a_database_file_never_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("scheduler.db");
    let open = || {
        let store = Arc::new(SqliteJobStore::open(&db_path).unwrap());
        SchedulerController::with_defaults(store, Arc::new(base_registry()), settings(2))
    };
    let daemon = open();
    let cli = open();
    daemon.register_job(every_minute("nap", "nap")).unwrap();

    let (first, second) = tokio::join!(daemon.run_job_now("nap"), cli.run_job_now("nap"));
    assert!(first.unwrap().succeeded());
    assert!(matches!(second, Err(SchedulerError::AlreadyRunning { .. })));
    assert_eq!(cli.history(Some("nap"), 10, 0).unwrap().len(), 1);

    // The claim is gone once the run is recorded.
    assert_eq!(cli.get_job_status("nap").unwrap().last_status, Some(RunStatus::Completed));
    assert!(cli.run_job_now("nap").await.unwrap().succeeded());
    assert_eq!(daemon.history(Some("nap"), 10, 0).unwrap().len(), 2);
}

#[tokio::test]
async fn unbounded_timeout_is_rejected_at_registration() {
    let (ctl, store) = controller_with(base_registry(), 1);
    let err = ctl
        .register_job(every_minute("j", "ok").with_timeout(u64::MAX))
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(store.get("j").unwrap().is_none());
    assert_eq!(ctl.run_job_now("j").await.unwrap_err().code(), "NOT_FOUND");
}
