use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Scheduling priority. Higher values are submitted first within a tick.
///
/// Serialised as its numeric value (1-4) in exports and in the `jobs` table.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> u8 {
        p as u8
    }
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Critical),
            other => Err(format!("unknown priority value: {other} (expected 1-4)")),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// The unit of schedulable work. Also the record format of the job export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Primary key, immutable once created.
    pub id: String,
    /// Human-readable label, not unique.
    pub name: String,
    /// Key into the host's task registry; never interpreted by the engine.
    pub task_ref: String,
    /// 5-field cron expression.
    pub schedule: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts; there is no backoff.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Ids that must complete successfully in the same cycle first.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}
fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}
fn bool_true() -> bool {
    true
}

impl JobDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        task_ref: impl Into<String>,
        schedule: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            task_ref: task_ref.into(),
            schedule: schedule.into(),
            priority: Priority::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_seconds: DEFAULT_RETRY_DELAY_SECS,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            dependencies: BTreeSet::new(),
            enabled: true,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_seconds = retry_delay_seconds;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.insert(id.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Lifecycle state of one execution of a job.
///
/// `Pending -> Running -> {Completed | Failed | Retrying}`, `Retrying -> Running`.
/// Only terminal states (`Completed`, `Failed`, `Cancelled`) are ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    /// Shutdown arrived while the job was waiting to retry.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Retrying => "retrying",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "retrying" => Ok(RunStatus::Retrying),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// One persisted execution outcome, spanning all retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// `job_history` row id; `None` until the row is written.
    pub id: Option<i64>,
    pub job_id: String,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub output: Option<String>,
    /// Index of the final attempt (0 = succeeded or failed on the first try).
    pub retry_count: u32,
    /// False when the history write failed and this outcome exists only in memory.
    #[serde(default = "bool_true")]
    pub persisted: bool,
}

impl JobRun {
    pub fn started(job_id: impl Into<String>, start_time: DateTime<Utc>) -> Self {
        Self {
            id: None,
            job_id: job_id.into(),
            status: RunStatus::Running,
            start_time,
            end_time: None,
            error: None,
            output: None,
            retry_count: 0,
            persisted: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Status summary derived from the latest run (or the in-flight one).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusReport {
    pub job_id: String,
    pub last_status: Option<RunStatus>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_end: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub retry_count: Option<u32>,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub job_id: String,
    /// True when an existing definition with the same id was replaced.
    pub replaced: bool,
    /// Non-fatal problems, e.g. dependencies on jobs that do not exist yet.
    pub warnings: Vec<String>,
}

/// Result of importing a job export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    /// `(job id, reason)` for every record that failed validation.
    pub rejected: Vec<(String, String)>,
}
