//! Registration-time checks for job definitions.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::error::{Result, SchedulerError};
use crate::schedule::ScheduleEvaluator;
use crate::types::JobDefinition;

/// Longest accepted per-attempt timeout: one week.
pub const MAX_TIMEOUT_SECS: u64 = 7 * 86_400;

/// Longest accepted delay between attempts: one day.
pub const MAX_RETRY_DELAY_SECS: u64 = 86_400;

/// Reject definitions that can never run correctly.
pub fn validate_definition(job: &JobDefinition, evaluator: &dyn ScheduleEvaluator) -> Result<()> {
    for (field, value) in [
        ("id", &job.id),
        ("name", &job.name),
        ("task_ref", &job.task_ref),
        ("schedule", &job.schedule),
    ] {
        if value.trim().is_empty() {
            return Err(SchedulerError::Validation(format!("{field} must not be empty")));
        }
    }
    if job.timeout_seconds == 0 {
        return Err(SchedulerError::Validation(format!(
            "job {}: timeout_seconds must be positive",
            job.id
        )));
    }
    if job.timeout_seconds > MAX_TIMEOUT_SECS {
        return Err(SchedulerError::Validation(format!(
            "job {}: timeout_seconds must be at most {MAX_TIMEOUT_SECS}",
            job.id
        )));
    }
    if job.retry_delay_seconds > MAX_RETRY_DELAY_SECS {
        return Err(SchedulerError::Validation(format!(
            "job {}: retry_delay_seconds must be at most {MAX_RETRY_DELAY_SECS}",
            job.id
        )));
    }
    if job.dependencies.contains(&job.id) {
        return Err(SchedulerError::Validation(format!(
            "job {} depends on itself",
            job.id
        )));
    }
    evaluator.validate(&job.schedule)
}

/// Check `job`'s dependencies against the jobs already stored.
///
/// A dependency cycle is an error. Dependencies on unknown ids are returned as
/// warnings; such a job stays unschedulable until the missing job exists.
pub fn check_dependencies(job: &JobDefinition, existing: &[JobDefinition]) -> Result<Vec<String>> {
    let mut graph: HashMap<&str, &BTreeSet<String>> = existing
        .iter()
        .filter(|j| j.id != job.id)
        .map(|j| (j.id.as_str(), &j.dependencies))
        .collect();
    graph.insert(job.id.as_str(), &job.dependencies);

    let warnings = job
        .dependencies
        .iter()
        .filter(|dep| !graph.contains_key(dep.as_str()))
        .map(|dep| format!("job {} depends on unknown job {dep}", job.id))
        .collect();

    let mut visited = HashSet::new();
    let mut path = vec![job.id.clone()];
    for dep in &job.dependencies {
        if reaches(&graph, dep, &job.id, &mut visited, &mut path) {
            return Err(SchedulerError::Validation(format!(
                "dependency cycle: {}",
                path.join(" -> ")
            )));
        }
    }
    Ok(warnings)
}

/// Depth-first search from `node` for `target`, leaving the route in `path`.
fn reaches(
    graph: &HashMap<&str, &BTreeSet<String>>,
    node: &str,
    target: &str,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    path.push(node.to_string());
    if node == target {
        return true;
    }
    if visited.insert(node.to_string()) {
        if let Some(deps) = graph.get(node) {
            for next in deps.iter() {
                if reaches(graph, next, target, visited, path) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::CronEvaluator;

    fn job(id: &str) -> JobDefinition {
        JobDefinition::new(id, id, "noop", "*/5 * * * *")
    }

    #[test]
    fn accepts_well_formed() {
        assert!(validate_definition(&job("a"), &CronEvaluator).is_ok());
    }

    #[test]
    fn rejects_empty_fields_and_zero_timeout() {
        let mut blank = job("a");
        blank.task_ref = " ".to_string();
        let err = validate_definition(&blank, &CronEvaluator).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("task_ref"));

        let err = validate_definition(&job("a").with_timeout(0), &CronEvaluator).unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
    }

    #[test]
    fn rejects_unbounded_durations() {
        let err = validate_definition(&job("a").with_timeout(u64::MAX), &CronEvaluator).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("timeout_seconds must be at most 604800"));

        let week = job("a").with_timeout(MAX_TIMEOUT_SECS);
        assert!(validate_definition(&week, &CronEvaluator).is_ok());

        let err = validate_definition(&job("a").with_retries(1, u64::MAX), &CronEvaluator).unwrap_err();
        assert!(err.to_string().contains("retry_delay_seconds must be at most"));
    }

    #[test]
    fn rejects_bad_schedule() {
        let mut bad = job("a");
        bad.schedule = "every tuesday".to_string();
        let err = validate_definition(&bad, &CronEvaluator).unwrap_err();
        assert_eq!(err.code(), "INVALID_SCHEDULE");
    }

    #[test]
    fn rejects_self_dependency() {
        let err = validate_definition(&job("a").with_dependency("a"), &CronEvaluator).unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn unknown_dependency_is_a_warning() {
        let warnings = check_dependencies(&job("b").with_dependency("a"), &[]).unwrap();
        assert_eq!(warnings, vec!["job b depends on unknown job a"]);

        let warnings = check_dependencies(&job("b").with_dependency("a"), &[job("a")]).unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn detects_cycles_through_stored_jobs() {
        let existing = vec![job("a").with_dependency("b"), job("b").with_dependency("c")];
        let err = check_dependencies(&job("c").with_dependency("a"), &existing).unwrap_err();
        assert_eq!(err.to_string(), "Validation error: dependency cycle: c -> a -> b -> c");
    }

    #[test]
    fn replacing_a_job_drops_its_old_edges() {
        // Stored "c" depends on "a", so "a" may not depend on "c"...
        let existing = vec![job("c").with_dependency("a"), job("a")];
        let candidate = job("a").with_dependency("c");
        assert!(check_dependencies(&candidate, &existing).is_err());

        // ...but re-registering "c" without the edge is judged on the new edges.
        let existing = vec![job("c").with_dependency("a"), job("a")];
        let candidate = job("c");
        assert!(check_dependencies(&candidate, &existing).is_ok());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let existing = vec![
            job("root"),
            job("left").with_dependency("root"),
            job("right").with_dependency("root"),
        ];
        let report = job("report").with_dependency("left").with_dependency("right");
        assert!(check_dependencies(&report, &existing).unwrap().is_empty());
    }
}
