pub mod slurm;

#[cfg(test)]
pub mod fake;

use crate::{config::SchedulerConfig, job::ExternalId};
use std::{fmt, path::Path, thread};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum ExecutorError {
    /// the control plane answered, but not in a form we understand
    #[error("Unparseable scheduler output: {0}")]
    Transient(String),
    #[error("Failed to spawn scheduler command '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Scheduler command '{0}' timed out")]
    CommandTimeout(String),
    /// the scheduler rejected the submission script, retrying won't help
    #[error("Submission rejected in {directory}: {output}")]
    Submission { directory: String, output: String },
}

impl ExecutorError {
    /// transient control plane failures are worth another attempt
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Submission { .. })
    }
}

/// State of a job id in the scheduler queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Running,
    /// the id is no longer queued, the job ended one way or another
    Absent,
}

/// Coarse cause reported by the scheduler's resource accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingState {
    /// the job exited on its own (zero or non-zero), any failure is application level
    Exited,
    NodeFail,
    Timeout,
    OutOfMemory,
    /// still running, nothing to classify yet
    Running,
    /// the scheduler has no record of the id
    Unknown,
    Other(String),
}

impl fmt::Display for AccountingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited => f.write_str("EXITED"),
            Self::NodeFail => f.write_str("NODE_FAIL"),
            Self::Timeout => f.write_str("TIMEOUT"),
            Self::OutOfMemory => f.write_str("OUT_OF_MEMORY"),
            Self::Running => f.write_str("RUNNING"),
            Self::Unknown => f.write_str("UNKNOWN"),
            Self::Other(state) => f.write_str(state),
        }
    }
}

/// The external cluster scheduler, driven through its text interface
pub trait Executor {
    /// submit `<directory>/<script>` and return the id the scheduler assigned
    fn submit(&self, directory: &Path, script: &str) -> Result<ExternalId, ExecutorError>;

    fn query(&self, id: ExternalId) -> Result<QueueState, ExecutorError>;

    fn account(&self, id: ExternalId) -> Result<AccountingState, ExecutorError>;
}

/// Run `operation` up to `config.retries` times, sleeping with a linear
/// backoff between attempts. Non transient errors are returned immediately.
pub fn with_retries<T>(
    config: &SchedulerConfig,
    what: &str,
    mut operation: impl FnMut() -> Result<T, ExecutorError>,
) -> Result<T, ExecutorError> {
    let attempts = config.retries.max(1);
    let mut attempt = 1;

    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < attempts => {
                debug!("Bad capture of {what}: {error}, attempt {attempt}/{attempts}");
                thread::sleep(config.backoff(attempt));
                attempt += 1;
            }
            Err(error) => {
                if error.is_transient() {
                    warn!("Giving up on {what} after {attempt} attempts: {error}");
                }

                return Err(error);
            }
        }
    }
}

#[cfg(test)]
#[path = "executors_test.rs"]
mod executors_test;
