//! The scheduling loop.
//!
//! One tick advances every active job, propagates breakage one dependency hop,
//! fills the free capacity with eligible jobs in ledger order and persists the
//! ledger. The loop ends once no row can make progress anymore.

use crate::{
    batch::{Batch, BatchError},
    config::RunnerConfig,
    dependency,
    editor::{self, EditorError},
    executors::Executor,
    harness::{Harness, HarnessError},
    job::{JobKey, JobRecord, Status},
    ledger::{Ledger, LedgerError},
    quarantine::{Quarantine, QuarantineError},
    restart::{self, RestartOutcome},
};
use itertools::Itertools;
use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs, io,
    path::{Path, PathBuf},
    thread,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Failed to set up quarantine")]
    Quarantine(#[from] QuarantineError),
}

/// Errors that end the current attempt of one job, never the run
#[derive(Error, Debug)]
enum PrepareError {
    #[error("Failed to copy dependency artifact")]
    Artifact(#[from] io::Error),
    #[error(transparent)]
    Editor(#[from] EditorError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
}

/// What happened during one tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub advanced: usize,
    pub submitted: usize,
    pub finished: usize,
    pub broken: usize,
}

pub struct BatchRunner<E: Executor> {
    config: RunnerConfig,
    executor: E,
    ledger: Ledger,
    ledger_path: PathBuf,
    quarantine: Quarantine,
    harnesses: BTreeMap<JobKey, Harness>,
    ticks: u64,
}

impl<E: Executor> BatchRunner<E> {
    pub fn new(
        config: RunnerConfig,
        executor: E,
        root: &Path,
        ledger: Ledger,
        ledger_path: PathBuf,
    ) -> Result<Self, RunnerError> {
        let quarantine = Quarantine::new(root, &config.quarantine, &config.scheduler.log_glob)?;

        Ok(Self {
            config,
            executor,
            ledger,
            ledger_path,
            quarantine,
            harnesses: BTreeMap::new(),
            ticks: 0,
        })
    }

    /// Load a batch definition and, unless `fresh`, merge the ledger of a
    /// previous run over it so in-flight statuses survive a restart of the
    /// orchestrator. The ledger lives next to the batch file.
    pub fn from_batch(batch_path: &Path, config: RunnerConfig, executor: E, fresh: bool) -> Result<Self, RunnerError> {
        let batch = Batch::load(batch_path)?;
        let ledger_path = batch_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&config.ledger);

        let ledger = if !fresh && ledger_path.is_file() {
            let previous = Ledger::load(&ledger_path)?;
            info!(path = ?ledger_path, rows = previous.len(), "Resuming from existing ledger");

            Ledger::merge(&batch.ledger, &previous)
        } else {
            batch.ledger
        };

        info!(root = ?batch.root, jobs = ledger.len(), "Loaded batch");

        Self::new(config, executor, &batch.root, ledger, ledger_path)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// number of jobs with a live harness
    pub fn active_harnesses(&self) -> usize {
        self.harnesses.len()
    }

    /// Run `operation` on the harness of `record`, creating it on first use.
    /// Keyed by identity, so a row never has two live harnesses.
    fn with_harness<T>(
        &mut self,
        record: &JobRecord,
        operation: impl FnOnce(&mut Harness, &dyn Executor) -> Result<T, HarnessError>,
    ) -> Result<T, HarnessError> {
        let harness = match self.harnesses.entry(record.key()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Harness::new(record, &self.config)?),
        };

        operation(harness, &self.executor)
    }

    /// mirror the harness state into the ledger row
    fn sync_row(&mut self, key: &JobKey) {
        let Some(harness) = self.harnesses.get(key) else {
            return;
        };

        if let Some(record) = self.ledger.get_mut(key) {
            record.status = harness.status();
            record.external_id = harness.external_id();
        }
    }

    fn fail_row(&mut self, key: &JobKey) {
        if let Some(harness) = self.harnesses.get_mut(key) {
            if let Err(error) = harness.fail() {
                warn!(job = %key, "Failed to record failure in run info: {error}");
            }
        }

        self.ledger.set_status(key, Status::Failed);
    }

    /// Quarantine the output of a failed job and, if enabled, restart it
    fn handle_failure(&mut self, key: &JobKey) {
        let Some(record) = self.ledger.get(key).cloned() else {
            return;
        };

        let output = record.file(&self.config.program(record.program).output_extension);
        if let Err(error) = self.quarantine.store(&record.directory, &output) {
            error!(job = %key, "Failed to quarantine output: {error}");
        }

        if !self.config.restart.automatic {
            return;
        }

        let cause = restart::classify(&record, &self.executor, &self.config);
        info!(job = %key, cause = %cause, "Classified failure");

        let Some(record) = self.ledger.get_mut(key) else {
            return;
        };

        match restart::restart(record, &cause, &self.config) {
            Ok(RestartOutcome::Restarted { archive, .. }) => {
                info!(job = %key, archive = ?archive, "Requeued for the next tick");
                self.ledger.reset_broken_dependents(&key.directory);
            }
            Ok(outcome) => debug!(job = %key, outcome = ?outcome, "Not restarted"),
            Err(error) => error!(job = %key, "Restart failed, the job stays failed: {error}"),
        }
    }

    /// Called when a harness reached a terminal state
    fn retire(&mut self, key: &JobKey) {
        self.sync_row(key);
        self.harnesses.remove(key);

        if self.ledger.get(key).map(|record| record.status) == Some(Status::Failed) {
            self.handle_failure(key);
        }
    }

    /// Step 1: poll every pending/running job
    fn advance_active(&mut self, summary: &mut TickSummary) {
        let active: Vec<JobRecord> = self
            .ledger
            .records()
            .iter()
            .filter(|record| record.status.is_active())
            .cloned()
            .collect();

        for record in active {
            let key = record.key();
            summary.advanced += 1;

            match self.with_harness(&record, |harness, executor| harness.update_status(executor)) {
                Ok(status) => {
                    self.sync_row(&key);

                    if status.is_terminal() {
                        summary.finished += 1;
                        self.retire(&key);
                    }
                }
                Err(
                    error @ (HarnessError::ParseFailureExceeded { .. }
                    | HarnessError::OutputNeverAppeared { .. }
                    | HarnessError::Ingest(_)),
                ) => {
                    error!(job = %key, "{error}");
                    self.fail_row(&key);
                    summary.finished += 1;
                    self.retire(&key);
                }
                Err(error) => error!(job = %key, "Failed to update status, trying again next tick: {error}"),
            }
        }
    }

    /// Copy the upstream artifact into the job directory and point the input at it
    fn pipe_artifact(&self, record: &JobRecord, harness_input: &Path) -> Result<(), PrepareError> {
        let Some(ref dependency) = record.dependency else {
            return Ok(());
        };

        let copied = record.directory.join(&dependency.artifact);
        fs::copy(dependency.artifact_path(), &copied)?;

        let spec = self.config.program(record.program);
        editor::use_geometry(spec.input_style, harness_input, &copied)?;

        Ok(())
    }

    /// Step 4 for one row. Returns the resulting status.
    fn launch(&mut self, record: &JobRecord) -> Result<Status, PrepareError> {
        let input = self.with_harness(record, |harness, _| Ok(harness.input_path()))?;
        self.pipe_artifact(record, &input)?;

        let status = self.with_harness(record, |harness, executor| {
            if !harness.resume_existing(executor)? {
                harness.submit(executor)?;
            }

            Ok(harness.status())
        })?;

        Ok(status)
    }

    /// Steps 2 to 4: fill the free capacity with eligible rows in ledger order
    fn enqueue_eligible(&mut self, summary: &mut TickSummary) {
        let capacity = self.config.max_jobs.saturating_sub(self.ledger.active_count());
        if capacity == 0 {
            return;
        }

        let eligible: Vec<JobRecord> = self
            .ledger
            .records()
            .iter()
            .zip(self.ledger.is_eligible())
            .filter(|(_, eligible)| *eligible)
            .map(|(record, _)| record.clone())
            .collect();

        let mut occupied = 0;

        for record in eligible {
            if occupied >= capacity {
                break;
            }

            let key = record.key();

            match self.launch(&record) {
                Ok(status) => {
                    self.sync_row(&key);

                    if status.is_active() {
                        occupied += 1;
                        summary.submitted += 1;
                    } else if status.is_terminal() {
                        summary.finished += 1;
                        self.retire(&key);
                    }
                }
                Err(PrepareError::Harness(HarnessError::Executor(error))) if error.is_transient() => {
                    // nothing is known to be queued, try again next tick
                    warn!(job = %key, "Submission did not go through: {error}");
                    self.harnesses.remove(&key);
                }
                Err(error) => {
                    error!(job = %key, "Job failed before it could run: {error}");
                    self.fail_row(&key);
                    summary.finished += 1;
                    self.retire(&key);
                }
            }
        }
    }

    pub fn tick(&mut self) -> Result<TickSummary, RunnerError> {
        self.ticks += 1;
        let mut summary = TickSummary::default();

        self.advance_active(&mut summary);

        let flagged = self.ledger.flag_broken_dependencies();
        for key in flagged.iter() {
            self.harnesses.remove(key);
        }
        summary.broken = flagged.len();

        self.enqueue_eligible(&mut summary);

        self.ledger.persist(&self.ledger_path)?;

        debug!(tick = self.ticks, summary = ?summary, "Tick done");

        Ok(summary)
    }

    /// Rows that are not terminal but can't progress either: their upstream
    /// succeeded without leaving the artifact, or is not part of this ledger
    pub fn stuck(&self) -> Vec<JobKey> {
        self.ledger
            .records()
            .iter()
            .filter(|record| {
                record.status == Status::NotStarted
                    && !dependency::satisfied(record)
                    && !dependency::waiting(record, &self.ledger)
                    && !dependency::broken(record, &self.ledger)
            })
            .map(JobRecord::key)
            .collect()
    }

    /// true once every row is terminal or stuck
    pub fn is_done(&self) -> bool {
        let stuck = self.stuck();

        self.ledger
            .records()
            .iter()
            .all(|record| record.status.is_terminal() || stuck.contains(&record.key()))
    }

    /// Tick until no row can make progress
    pub fn run(&mut self) -> Result<(), RunnerError> {
        info!(max_jobs = self.config.max_jobs, "Starting scheduling loop");

        loop {
            let summary = self.tick()?;

            if summary.submitted > 0 || summary.finished > 0 || summary.broken > 0 {
                info!(
                    tick = self.ticks,
                    active = self.ledger.active_count(),
                    submitted = summary.submitted,
                    finished = summary.finished,
                    broken = summary.broken,
                    "Progress"
                );
            }

            if self.is_done() {
                break;
            }

            thread::sleep(self.config.tick_interval());
        }

        for key in self.stuck() {
            warn!(job = %key, "Never ran, its dependency can't be satisfied");
        }

        let counts = self
            .ledger
            .records()
            .iter()
            .map(|record| record.status)
            .counts();
        for (status, count) in counts.into_iter().sorted_by_key(|(status, _)| status.as_str()) {
            info!(status = %status, count, "Run finished");
        }

        Ok(())
    }
}

#[cfg(test)]
#[path = "runner_test.rs"]
mod runner_test;
