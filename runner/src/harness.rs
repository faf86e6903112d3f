//! Runtime lifecycle of a single job: submit, poll, parse, interpret, finalize.
//!
//! A harness only lives while its ledger row is active. Every status change is
//! mirrored into the job directory's run info, from which a fresh process
//! rebuilds the harness after a crash.

pub mod finalize;
pub mod policy;

use crate::{
    config::{HarnessConfig, RunnerConfig, SchedulerConfig},
    executors::{with_retries, Executor, ExecutorError, QueueState},
    ingest::{IngestorError, Ingestors, ParsedOutput},
    job::{job_file, ExternalId, JobKey, JobRecord, Program, Status},
    run_info::{hostname, RunInfo, RunInfoError},
};
use globset::Glob;
use policy::ProgramSpec;
use std::{
    fs,
    path::{Path, PathBuf},
    thread,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Failed to set up output extraction")]
    Ingest(#[from] IngestorError),
    #[error("Failed to write run info")]
    RunInfo(#[from] RunInfoError),
    #[error("Parsing {output} failed {failures} times, giving up on the job")]
    ParseFailureExceeded { output: PathBuf, failures: u32 },
    #[error("{output} never appeared after the job left the queue ({polls} polls)")]
    OutputNeverAppeared { output: PathBuf, polls: u32 },
    #[error("Finalize failed: {0}")]
    Finalize(String),
}

/// Highest id among the scheduler logs (`slurm-<id>.out`) in `directory`
pub fn latest_log_id(directory: &Path, log_glob: &str) -> Option<ExternalId> {
    let matcher = Glob::new(log_glob).ok()?.compile_matcher();

    fs::read_dir(directory)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| matcher.is_match(entry.file_name()))
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let digits: String = name
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(char::is_ascii_digit)
                .collect();

            digits.parse().ok()
        })
        .max()
}

#[derive(Debug)]
pub struct Harness {
    key: JobKey,
    program: Program,
    spec: ProgramSpec,
    ingestor: Ingestors,
    external_id: Option<ExternalId>,
    status: Status,
    parse_failures: u32,
    vanished_polls: u32,
    harness: HarnessConfig,
    scheduler: SchedulerConfig,
}

impl Harness {
    /// Bind a harness to `record`, reconciling the ledger row with the run info
    /// left in the job directory and, as a last resort, with the scheduler logs.
    pub fn new(record: &JobRecord, config: &RunnerConfig) -> Result<Self, HarnessError> {
        let spec = config.program(record.program);
        let ingestor = Ingestors::load(record.program, &spec)?;

        let mut harness = Self {
            key: record.key(),
            program: record.program,
            spec,
            ingestor,
            external_id: record.external_id,
            status: record.status,
            parse_failures: 0,
            vanished_polls: 0,
            harness: config.harness.clone(),
            scheduler: config.scheduler.clone(),
        };

        harness.restore();

        Ok(harness)
    }

    fn restore(&mut self) {
        let info = match RunInfo::read(&self.key.directory) {
            Ok(info) => info.filter(|info| info.basename == self.key.basename && info.program == self.program),
            Err(error) => {
                warn!(job = %self.key, "Ignoring unreadable run info: {error}");
                None
            }
        };

        if let Some(info) = info {
            self.parse_failures = info.parse_failures;
            self.vanished_polls = info.vanished_polls;

            // the run info is written before the ledger, it may be one step ahead
            if self.external_id.is_none() {
                self.external_id = info.external_id();
            }
            if self.status == Status::NotStarted && info.external_id().is_some() && !info.status.is_terminal() {
                debug!(job = %self.key, status = %info.status, "Adopting status from run info");
                self.status = info.status;
            }
        }

        if self.external_id.is_none() && self.status.is_active() {
            self.external_id = latest_log_id(&self.key.directory, &self.scheduler.log_glob);

            if let Some(id) = self.external_id {
                info!(job = %self.key, id, "Recovered external id from scheduler log");
            }
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn program(&self) -> Program {
        self.program
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn external_id(&self) -> Option<ExternalId> {
        self.external_id
    }

    pub fn parse_failures(&self) -> u32 {
        self.parse_failures
    }

    pub fn vanished_polls(&self) -> u32 {
        self.vanished_polls
    }

    pub fn output_path(&self) -> PathBuf {
        job_file(&self.key.directory, &self.key.basename, &self.spec.output_extension)
    }

    pub fn input_path(&self) -> PathBuf {
        job_file(&self.key.directory, &self.key.basename, &self.spec.input_extension)
    }

    pub fn script_name(&self) -> String {
        format!("{}.sh", self.key.basename)
    }

    pub fn run_info(&self) -> RunInfo {
        RunInfo {
            basename: self.key.basename.clone(),
            program: self.program,
            status: self.status,
            external_id: RunInfo::encode_id(self.external_id),
            ruleset: self.ingestor.reference(),
            parse_failures: self.parse_failures,
            vanished_polls: self.vanished_polls,
            host: hostname(),
        }
    }

    fn persist(&self) -> Result<(), HarnessError> {
        self.run_info().write(&self.key.directory)?;

        Ok(())
    }

    fn transition(&mut self, status: Status) -> Result<(), HarnessError> {
        if status != self.status {
            info!(job = %self.key, from = %self.status, to = %status, "Status changed");
            self.status = status;
        }

        self.persist()
    }

    /// Called once before a `not_started` row would be submitted. If the job
    /// ran before (output on disk, or an id recorded by a crashed process) it
    /// is interpreted instead of submitted again. Returns true if submission
    /// must be skipped.
    #[instrument(level = "debug", skip(self, executor), fields(job = %self.key))]
    pub fn resume_existing(&mut self, executor: &dyn Executor) -> Result<bool, HarnessError> {
        if self.status.is_active() {
            self.update_status(executor)?;

            return Ok(true);
        }

        if !self.output_path().is_file() {
            return Ok(false);
        }

        warn!(job = %self.key, "Output already exists, interpreting it instead of submitting");

        match self.external_id {
            // the scheduler may still be writing it
            Some(_) => {
                self.transition(Status::Pending)?;
                self.update_status(executor)?;
            }
            None => {
                self.interpret_output()?;
            }
        }

        Ok(true)
    }

    /// Submit `<basename>.sh` in the job directory. Not retried: a garbled
    /// answer may still have queued the job.
    #[instrument(skip(self, executor), fields(job = %self.key))]
    pub fn submit(&mut self, executor: &dyn Executor) -> Result<ExternalId, HarnessError> {
        let id = executor.submit(&self.key.directory, &self.script_name())?;

        self.external_id = Some(id);
        self.transition(Status::Pending)?;

        info!(id, "Submitted");

        Ok(id)
    }

    /// Poll the scheduler and move the job along its state machine. A control
    /// plane that stays unreachable leaves the status unchanged until the next tick.
    #[instrument(level = "debug", skip(self, executor), fields(job = %self.key))]
    pub fn update_status(&mut self, executor: &dyn Executor) -> Result<Status, HarnessError> {
        let Some(id) = self.external_id else {
            return Ok(self.status);
        };

        let queue = match with_retries(&self.scheduler, "queue state", || executor.query(id)) {
            Ok(queue) => queue,
            Err(error) => {
                warn!(id, "Queue state unknown, trying again next tick: {error}");

                return Ok(self.status);
            }
        };

        match queue {
            QueueState::Pending if self.status == Status::Running => {
                debug!(id, "Requeued by the scheduler, keeping running");
            }
            QueueState::Pending => self.transition(Status::Pending)?,
            QueueState::Running => self.transition(Status::Running)?,
            QueueState::Absent if !self.output_path().is_file() => {
                // the output may be created after the id left the queue
                self.count_vanished_poll()?;
                debug!(id, polls = self.vanished_polls, "Left the queue without output");
            }
            QueueState::Absent => {
                self.interpret_output()?;
            }
        }

        Ok(self.status)
    }

    pub fn interpret_completion(&self, parsed: &ParsedOutput) -> Status {
        self.spec.policy.interpret(parsed)
    }

    /// The job stays pending/running until `vanished_output_polls` is reached
    fn count_vanished_poll(&mut self) -> Result<(), HarnessError> {
        self.vanished_polls += 1;
        self.persist()?;

        if self.vanished_polls >= self.harness.vanished_output_polls {
            return Err(HarnessError::OutputNeverAppeared {
                output: self.output_path(),
                polls: self.vanished_polls,
            });
        }

        Ok(())
    }

    fn count_parse_failure(&mut self) -> Result<(), HarnessError> {
        self.parse_failures += 1;
        self.persist()?;

        if self.parse_failures >= self.harness.parse_fail_threshold {
            return Err(HarnessError::ParseFailureExceeded {
                output: self.output_path(),
                failures: self.parse_failures,
            });
        }

        Ok(())
    }

    /// Extract the structured result and store it as `<basename>.json`. A
    /// missing output is retried a few times, it may not have reached the
    /// shared filesystem yet. `Ok(None)` means nothing could be parsed this time.
    pub fn parse_output(&mut self) -> Result<Option<ParsedOutput>, HarnessError> {
        let output = self.output_path();
        let attempts = self.harness.missing_output_retries.max(1);

        for attempt in 1..=attempts {
            match self.ingestor.extract(&output) {
                Ok(parsed) => {
                    let stored = ParsedOutput::path_for(&self.key.directory, &self.key.basename);
                    if let Err(error) = parsed.store(&stored) {
                        warn!(path = ?stored, "Failed to store parsed output: {error}");
                    }

                    return Ok(Some(parsed));
                }
                Err(IngestorError::MissingOutput(_)) if attempt < attempts => {
                    debug!(output = ?output, "Output missing, attempt {attempt}/{attempts}");
                    thread::sleep(self.harness.missing_output_delay());
                }
                Err(error) => {
                    warn!(output = ?output, "Failed to parse output: {error}");
                    break;
                }
            }
        }

        self.count_parse_failure()?;

        Ok(None)
    }

    /// Parse and interpret the output of a job that left the queue, finalizing
    /// it on success
    pub fn interpret_output(&mut self) -> Result<Status, HarnessError> {
        let Some(parsed) = self.parse_output()? else {
            return Ok(self.status);
        };

        let status = self.interpret_completion(&parsed);
        self.transition(status)?;

        if status == Status::Succeeded {
            if let Err(error) = self.finalize() {
                error!(job = %self.key, "Finalize failed, the job stays succeeded: {error}");
            }
        }

        Ok(self.status)
    }

    pub fn finalize(&self) -> Result<(), HarnessError> {
        finalize::run(
            self.spec.finalizer,
            &self.key.directory,
            &self.key.basename,
            &self.output_path(),
        )
    }

    /// Mark the job failed outside of the normal state machine (rejected
    /// submission, parse failures exceeded)
    pub fn fail(&mut self) -> Result<(), HarnessError> {
        self.transition(Status::Failed)
    }
}

#[cfg(test)]
#[path = "harness_test.rs"]
mod harness_test;
