//! CLI definitions for netopsd.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Network operations job scheduler.
#[derive(Parser)]
#[command(name = "netopsd")]
#[command(about = "Cron-style scheduler for network maintenance jobs")]
#[command(version)]
pub(crate) struct Cli {
    /// Configuration file path (falls back to NETOPS_CONFIG, then ~/.netops/netops.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the scheduler in the foreground until Ctrl-C (default)
    Run,

    /// List all registered jobs
    List,

    /// Show one job definition
    Show {
        /// Job ID
        id: String,
    },

    /// Show the status of a job's latest run
    Status {
        /// Job ID
        id: String,
    },

    /// Show the next trigger time of a job
    Next {
        /// Job ID
        id: String,
    },

    /// Show execution history, newest first
    History {
        /// Only runs of this job
        #[arg(long)]
        job: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Run a job immediately, bypassing its schedule
    RunNow {
        /// Job ID
        id: String,
    },

    /// Unregister a job (its history is kept)
    Remove {
        /// Job ID
        id: String,
    },

    /// Write all jobs as JSON (defaults to scheduler.jobs_file)
    Export {
        path: Option<PathBuf>,
    },

    /// Register jobs from a JSON export (defaults to scheduler.jobs_file)
    Import {
        path: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["netopsd"]).unwrap();
        assert!(cli.command.is_none());
        assert!(cli.config.is_none());
    }

    #[test]
    fn history_flags_and_global_config() {
        let cli = Cli::try_parse_from([
            "netopsd", "history", "--job", "poll", "--limit", "5", "-c", "/etc/netops.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/netops.toml")));
        match cli.command {
            Some(Commands::History { job, limit, offset }) => {
                assert_eq!(job.as_deref(), Some("poll"));
                assert_eq!(limit, 5);
                assert_eq!(offset, 0);
            }
            _ => panic!("expected history"),
        }
    }

    #[test]
    fn run_now_is_kebab_case() {
        let cli = Cli::try_parse_from(["netopsd", "run-now", "backup"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::RunNow { id }) if id == "backup"));
    }
}
