use super::{AccountingState, Executor, ExecutorError, QueueState};
use crate::{config::SchedulerConfig, job::ExternalId};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    io::Read,
    path::Path,
    process::{Command, Stdio},
};
use tracing::{debug, instrument, trace};
use wait_timeout::ChildExt;

static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("id pattern is valid"));

// errors after which the controller may well answer on the next attempt
const CONTROLLER_ERRORS: [&str; 3] = [
    "Socket timed out",
    "Unable to contact slurm controller",
    "Transport endpoint is not connected",
];

/// Slurm through its command line tools (`sbatch`, `squeue`, `seff`/`sacct`)
#[derive(Debug, Clone)]
pub struct SlurmExecutor {
    config: SchedulerConfig,
}

impl SlurmExecutor {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// Run `command` (split on whitespace) with `args` and return stdout and
    /// stderr combined, killing it once the configured timeout expires.
    fn run(&self, command: &str, args: &[&str], directory: Option<&Path>) -> Result<String, ExecutorError> {
        let mut parts = command.split_whitespace();
        let program = parts.next().unwrap_or(command);

        let mut builder = Command::new(program);
        builder
            .args(parts)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(directory) = directory {
            builder.current_dir(directory);
        }

        let spawn_error = |source| ExecutorError::Spawn {
            command: command.to_owned(),
            source,
        };

        let mut child = builder.spawn().map_err(spawn_error)?;

        match child.wait_timeout(self.config.timeout()).map_err(spawn_error)? {
            Some(status) => trace!(command, status = %status, "Scheduler command finished"),
            None => {
                // the child may have exited between the timeout and the kill
                let _ = child.kill();
                let _ = child.wait();

                return Err(ExecutorError::CommandTimeout(command.to_owned()));
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = child.stdout.take() {
            stdout.read_to_string(&mut output).map_err(spawn_error)?;
        }
        if let Some(mut stderr) = child.stderr.take() {
            stderr.read_to_string(&mut output).map_err(spawn_error)?;
        }

        trace!(command, output, "Scheduler command output");

        Ok(output)
    }
}

impl Executor for SlurmExecutor {
    #[instrument(skip(self), level = "debug")]
    fn submit(&self, directory: &Path, script: &str) -> Result<ExternalId, ExecutorError> {
        let output = self.run(&self.config.submit, &[script], Some(directory))?;

        parse_submission(&output, directory)
    }

    fn query(&self, id: ExternalId) -> Result<QueueState, ExecutorError> {
        let output = self.run(&self.config.query, &["--job", &id.to_string()], None)?;

        parse_queue(&output)
    }

    fn account(&self, id: ExternalId) -> Result<AccountingState, ExecutorError> {
        let output = self.run(&self.config.accounting, &[&id.to_string()], None)?;

        parse_accounting(&output)
    }
}

/// `Submitted batch job <id>`, anything mentioning `error:` is a rejected script
pub fn parse_submission(output: &str, directory: &Path) -> Result<ExternalId, ExecutorError> {
    if output.contains("error:") {
        if CONTROLLER_ERRORS.iter().any(|error| output.contains(error)) {
            return Err(ExecutorError::Transient(output.trim().to_owned()));
        }

        return Err(ExecutorError::Submission {
            directory: directory.to_string_lossy().into_owned(),
            output: output.trim().to_owned(),
        });
    }

    FIRST_NUMBER
        .find(output)
        .and_then(|id| id.as_str().parse().ok())
        .ok_or_else(|| ExecutorError::Transient(output.trim().to_owned()))
}

/// `squeue --job <id>`: a header followed by at most one row, the state is
/// the fifth column
pub fn parse_queue(output: &str) -> Result<QueueState, ExecutorError> {
    if output.contains("error:") {
        // squeue forgets ids shortly after they finish
        if output.contains("Invalid job id") {
            return Ok(QueueState::Absent);
        }

        return Err(ExecutorError::Transient(output.trim().to_owned()));
    }

    let mut lines = output.lines().filter(|line| !line.trim().is_empty());

    match lines.next() {
        Some(header) if header.split_whitespace().next() == Some("JOBID") => {}
        _ => return Err(ExecutorError::Transient(output.trim().to_owned())),
    }

    let Some(row) = lines.next() else {
        return Ok(QueueState::Absent);
    };

    let state = row
        .split_whitespace()
        .nth(4)
        .ok_or_else(|| ExecutorError::Transient(row.trim().to_owned()))?;

    debug!(state, "Queue state");

    Ok(match state {
        "PD" | "CF" => QueueState::Pending,
        // completing jobs are still allocated, their output may not be final yet
        "R" | "CG" | "S" | "ST" => QueueState::Running,
        _ => QueueState::Absent,
    })
}

/// Accepts `seff` output (`State: COMPLETED (exit code 0)`) as well as the bare
/// state printed by `sacct -n -X -o State`.
pub fn parse_accounting(output: &str) -> Result<AccountingState, ExecutorError> {
    let trimmed = output.trim();

    if trimmed.is_empty() {
        return Err(ExecutorError::Transient(String::new()));
    }

    if trimmed.contains("not found") || trimmed.contains("Invalid job id") {
        return Ok(AccountingState::Unknown);
    }

    let state = trimmed
        .lines()
        .find_map(|line| line.trim().strip_prefix("State:"))
        .unwrap_or(trimmed)
        .split_whitespace()
        .next()
        .unwrap_or_default();

    Ok(match state {
        "COMPLETED" | "FAILED" => AccountingState::Exited,
        "NODE_FAIL" => AccountingState::NodeFail,
        "TIMEOUT" => AccountingState::Timeout,
        "OUT_OF_MEMORY" | "OOM" => AccountingState::OutOfMemory,
        "RUNNING" | "PENDING" | "COMPLETING" => AccountingState::Running,
        other => AccountingState::Other(other.to_owned()),
    })
}

#[cfg(test)]
#[path = "slurm_test.rs"]
mod slurm_test;
