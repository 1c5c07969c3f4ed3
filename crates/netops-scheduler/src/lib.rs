//! `netops-scheduler`: cron-driven job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Job definitions and run history live in SQLite behind the [`store::JobStore`]
//! trait. Every tick the [`controller::SchedulerController`] finds the enabled
//! jobs whose next cron trigger falls inside the lookahead window, filters them
//! through the per-cycle [`gate::DependencyGate`], and submits them in priority
//! order to the [`executor::BoundedExecutor`], which runs registered
//! [`task::Task`]s on a fixed-size worker pool with retries and timeouts.
//!
//! # Components
//!
//! | Module       | Role                                                   |
//! |--------------|--------------------------------------------------------|
//! | `store`      | Job registry and append-only history                   |
//! | `schedule`   | 5-field cron evaluation (UTC)                          |
//! | `gate`       | "all dependencies completed this cycle" check          |
//! | `executor`   | Worker pool, retry loop, per-attempt timeout           |
//! | `controller` | Tick loop, manual runs, lifecycle, export/import       |

pub mod controller;
pub mod db;
pub mod error;
pub mod executor;
pub mod gate;
pub mod schedule;
pub mod store;
pub mod task;
pub mod types;
pub mod validate;

pub use controller::{ControllerState, CycleReport, SchedulerController};
pub use error::{Result, SchedulerError};
pub use executor::BoundedExecutor;
pub use gate::DependencyGate;
pub use schedule::{CronEvaluator, ScheduleEvaluator};
pub use store::{JobStore, SqliteJobStore};
pub use task::{Task, TaskContext, TaskError, TaskRegistry};
pub use types::{
    ImportReport, JobDefinition, JobRun, JobStatusReport, Priority, Registration, RunStatus,
};
