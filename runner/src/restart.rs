//! Failure classification and the restart routine.
//!
//! Classification asks the scheduler's accounting for a coarse cause first and
//! only looks at the parsed output for jobs that exited on their own. Each
//! cause maps to at most one [`RestartPlan`]. The edited inputs are rendered
//! first; only then is the attempt archived to `<directory>_history_<n>`,
//! cleared, and the row reset.

use crate::{
    config::{RestartConfig, RunnerConfig},
    editor::{self, gaussian::GaussianInput, sbatch::SubmitScript, EditorError},
    executors::{with_retries, AccountingState, Executor},
    harness::policy::{InputStyle, ProgramSpec},
    ingest::{IngestorError, Ingestors, ParsedOutput},
    job::{JobKey, JobRecord, Program, Status},
    ledger::Ledger,
    run_info::{RunInfo, RunInfoError},
};
use globset::Glob;
use ignore::WalkBuilder;
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub const RESTART_WARNING: &str = "RESTART_WARNING.txt";

#[derive(Error, Debug)]
pub enum RestartError {
    #[error("Failed to archive or clean job directory")]
    Io(#[from] io::Error),
    #[error("Failed to walk job directory")]
    Walk(#[from] ignore::Error),
    #[error("Failed to rewrite input")]
    Editor(#[from] EditorError),
    #[error("Failed to parse output for classification")]
    Ingest(#[from] IngestorError),
    #[error("Failed to remove run info")]
    RunInfo(#[from] RunInfoError),
    #[error("Invalid scheduler log glob")]
    InvalidGlob(#[from] globset::Error),
    #[error("{file} has no {directive}, don't know what to scale")]
    MissingDirective { file: PathBuf, directive: &'static str },
    #[error("Job directory {0} has no parent to archive next to")]
    NoParent(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    NodeFail,
    Timeout,
    OutOfMemory,
    ImaginaryFrequency,
    OptimizationStepLimit,
    ScfConvergence,
    BadInternalCoordinates,
    /// a linked optimisation + frequency run whose second step never terminated
    BadStationaryPoint,
    /// exited on its own without a recognised signature
    Application,
    /// accounting state without a restart rule
    Scheduler(String),
    /// neither accounting nor output tell anything
    Unknown,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeFail => f.write_str("NODE_FAIL"),
            Self::Timeout => f.write_str("TIMEOUT"),
            Self::OutOfMemory => f.write_str("OUT_OF_MEMORY"),
            Self::ImaginaryFrequency => f.write_str("imaginary_freq"),
            Self::OptimizationStepLimit => f.write_str("opt_maxcycle"),
            Self::ScfConvergence => f.write_str("scf_fail"),
            Self::BadInternalCoordinates => f.write_str("bad_internals"),
            Self::BadStationaryPoint => f.write_str("bad_stationary_point"),
            Self::Application => f.write_str("application"),
            Self::Scheduler(state) => write!(f, "scheduler:{state}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Domain causes, in order of precedence
pub fn classify_output(parsed: &ParsedOutput) -> FailureCause {
    if parsed.flag("imaginary_frequencies") {
        FailureCause::ImaginaryFrequency
    } else if parsed.flag("opt_fail") {
        FailureCause::OptimizationStepLimit
    } else if parsed.flag("scf_fail") {
        FailureCause::ScfConvergence
    } else if parsed.flag("bad_internals") {
        FailureCause::BadInternalCoordinates
    } else if parsed.flag("is_opt_freq") && parsed.count("normal_terminations") < 2 {
        FailureCause::BadStationaryPoint
    } else {
        FailureCause::Application
    }
}

/// Stored `<basename>.json` if there is one, otherwise parse the output now
fn parsed_output(record: &JobRecord, spec: &ProgramSpec) -> Result<Option<ParsedOutput>, IngestorError> {
    let stored = ParsedOutput::path_for(&record.directory, &record.basename);
    if stored.is_file() {
        return ParsedOutput::read(&stored).map(Some);
    }

    let output = record.file(&spec.output_extension);
    if !output.is_file() {
        return Ok(None);
    }

    Ingestors::load(record.program, spec)?.extract(&output).map(Some)
}

#[instrument(level = "debug", skip_all, fields(job = %record.key()))]
pub fn classify(record: &JobRecord, executor: &dyn Executor, config: &RunnerConfig) -> FailureCause {
    if let Some(id) = record.external_id {
        match with_retries(&config.scheduler, "accounting", || executor.account(id)) {
            Ok(AccountingState::NodeFail) => return FailureCause::NodeFail,
            Ok(AccountingState::Timeout) => return FailureCause::Timeout,
            Ok(AccountingState::OutOfMemory) => return FailureCause::OutOfMemory,
            Ok(AccountingState::Other(state)) => return FailureCause::Scheduler(state),
            Ok(state) => debug!(id, state = %state, "Accounting reports no resource failure"),
            Err(error) => warn!(id, "Accounting unavailable, classifying from output only: {error}"),
        }
    }

    match parsed_output(record, &config.program(record.program)) {
        Ok(Some(parsed)) => classify_output(&parsed),
        Ok(None) => FailureCause::Unknown,
        Err(error) => {
            warn!("Failed to read output for classification: {error}");
            FailureCause::Unknown
        }
    }
}

/// One row of the classification report
#[derive(Debug, Clone)]
pub struct Classification {
    pub key: JobKey,
    pub program: Program,
    pub status: Status,
    pub cause: FailureCause,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.key.directory.to_string_lossy(),
            self.program,
            self.status,
            self.cause
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPlan {
    ScaleCores,
    ScaleWalltime,
    ScaleMemory,
    /// restart an ORCA optimisation from the geometry it wrote last
    ReuseGeometry,
    /// restart a Gaussian run from the checkpoint geometry
    CheckpointGeometry { read_force_constants: bool },
}

pub fn plan(program: Program, spec: &ProgramSpec, cause: &FailureCause) -> Option<RestartPlan> {
    if !spec.restartable {
        return None;
    }

    match (cause, program) {
        (FailureCause::NodeFail, _) => Some(RestartPlan::ScaleCores),
        (FailureCause::Timeout, _) => Some(RestartPlan::ScaleWalltime),
        (FailureCause::OutOfMemory, _) => Some(RestartPlan::ScaleMemory),
        (FailureCause::ImaginaryFrequency, Program::Orca) => Some(RestartPlan::ReuseGeometry),
        (FailureCause::ImaginaryFrequency, Program::Gaussian) => Some(RestartPlan::CheckpointGeometry {
            read_force_constants: false,
        }),
        (FailureCause::BadStationaryPoint, Program::Gaussian) => Some(RestartPlan::CheckpointGeometry {
            read_force_constants: true,
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    Restarted { plan: RestartPlan, archive: PathBuf },
    /// no plan for this cause, the row stays failed
    NotRestartable,
    /// `max_attempts` reached
    PermanentlyFailed,
}

fn history_name(directory: &Path, index: u32) -> Option<PathBuf> {
    let name = directory.file_name()?.to_string_lossy().into_owned();

    Some(directory.with_file_name(format!("{name}_history_{index}")))
}

/// Number of archived attempts next to `directory`
pub fn attempts(directory: &Path) -> u32 {
    let mut count = 0;

    while history_name(directory, count).map(|path| path.is_dir()).unwrap_or(false) {
        count += 1;
    }

    count
}

/// Copy `directory` recursively to the first free `<directory>_history_<n>`
pub fn archive(directory: &Path) -> Result<PathBuf, RestartError> {
    let target = history_name(directory, attempts(directory))
        .ok_or_else(|| RestartError::NoParent(directory.to_path_buf()))?;

    let walker = WalkBuilder::new(directory).standard_filters(false).build();

    for entry in walker {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(directory) else {
            continue;
        };
        let destination = target.join(relative);

        match entry.file_type() {
            Some(kind) if kind.is_dir() => fs::create_dir_all(&destination)?,
            Some(kind) if kind.is_file() => {
                fs::copy(entry.path(), &destination)?;
            }
            _ => debug!(path = ?entry.path(), "Not archiving special file"),
        }
    }

    info!(archive = ?target, "Archived attempt");

    Ok(target)
}

/// Remove what the next attempt must not find: output, parsed result, run
/// info and scheduler logs
pub fn clear_attempt(record: &JobRecord, spec: &ProgramSpec, log_glob: &str) -> Result<(), RestartError> {
    let logs = Glob::new(log_glob)?.compile_matcher();

    for path in [
        record.file(&spec.output_extension),
        ParsedOutput::path_for(&record.directory, &record.basename),
    ] {
        match fs::remove_file(&path) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => return Err(error.into()),
            _ => {}
        }
    }

    RunInfo::remove(&record.directory)?;

    for entry in fs::read_dir(&record.directory)? {
        let entry = entry?;

        if entry.file_type()?.is_file() && logs.is_match(entry.file_name()) {
            debug!(log = ?entry.path(), "Removing scheduler log");
            fs::remove_file(entry.path())?;
        }
    }

    Ok(())
}

fn scale(value: u64, factor: f64) -> u64 {
    ((value as f64 * factor).ceil() as u64).max(value + 1)
}

fn read_script(path: &Path) -> Result<SubmitScript, RestartError> {
    Ok(SubmitScript::parse(&fs::read_to_string(path)?))
}

/// Input files of the next attempt, rendered before anything in the job
/// directory changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rewrite {
    pub files: Vec<(PathBuf, String)>,
    pub description: String,
}

impl Rewrite {
    fn new(description: impl Into<String>) -> Self {
        Self {
            files: Vec::new(),
            description: description.into(),
        }
    }

    fn with(mut self, path: PathBuf, content: String) -> Self {
        self.files.push((path, content));
        self
    }

    pub fn write(&self) -> Result<(), RestartError> {
        for (path, content) in self.files.iter() {
            fs::write(path, content)?;
        }

        Ok(())
    }
}

/// Render the inputs of `record` edited for `plan`. Nothing is written, so a
/// plan that can't be applied leaves the failed attempt untouched. `Ok(None)`
/// if the plan would not change anything, e.g. cores already at `max_cores`.
pub fn prepare(
    plan: RestartPlan,
    cause: &FailureCause,
    record: &JobRecord,
    spec: &ProgramSpec,
    config: &RestartConfig,
) -> Result<Option<Rewrite>, RestartError> {
    let script_path = record.file(".sh");
    let input_path = record.file(&spec.input_extension);

    let rewrite = match plan {
        RestartPlan::ScaleCores => {
            let mut script = read_script(&script_path)?;
            let current = script
                .cpus_per_task()
                .or_else(|| script.ntasks())
                .unwrap_or(1);
            let cores = scale(u64::from(current), config.core_factor).min(u64::from(config.max_cores)) as u32;

            if cores <= current {
                info!(cores = current, max_cores = config.max_cores, "Cores already at the limit");
                return Ok(None);
            }

            if script.cpus_per_task().is_some() {
                script.set_cpus_per_task(cores);
            } else {
                script.set_ntasks(cores);
            }

            let rewrite = Rewrite::new(format!("cores {current} -> {cores}")).with(script_path, script.render());

            match spec.input_style {
                InputStyle::OrcaInput => {
                    let content = fs::read_to_string(&input_path)?;
                    rewrite.with(input_path, editor::orca_nprocs(&content, cores))
                }
                InputStyle::GaussianInput => {
                    let mut input = read_gaussian(&input_path)?;
                    input.set_nprocs(cores);
                    rewrite.with(input_path, input.render())
                }
                InputStyle::Script => rewrite,
            }
        }
        RestartPlan::ScaleWalltime => {
            let mut script = read_script(&script_path)?;
            let current = script.walltime().ok_or_else(|| RestartError::MissingDirective {
                file: script_path.clone(),
                directive: "--time",
            })?;
            let walltime = scale(current, config.walltime_factor);

            script.set_walltime(walltime);

            Rewrite::new(format!("walltime {current}s -> {walltime}s")).with(script_path, script.render())
        }
        RestartPlan::ScaleMemory => {
            let mut script = read_script(&script_path)?;

            let description = if let Some(current) = script.memory_per_cpu() {
                let memory = scale(current, config.memory_factor);
                script.set_memory_per_cpu(memory);
                format!("memory per cpu {current}M -> {memory}M")
            } else if let Some(current) = script.memory() {
                let memory = scale(current, config.memory_factor);
                script.set_memory(memory);
                format!("memory {current}M -> {memory}M")
            } else {
                return Err(RestartError::MissingDirective {
                    file: script_path,
                    directive: "--mem-per-cpu",
                });
            };
            let rewrite = Rewrite::new(description).with(script_path, script.render());

            // Gaussian allocates its own %mem inside the slurm allocation
            if spec.input_style == InputStyle::GaussianInput {
                let mut input = read_gaussian(&input_path)?;

                match input.memory_gb() {
                    Some(current) => {
                        let memory = scale(current.ceil() as u64, config.memory_factor) as u32;
                        input.set_memory_gb(memory);
                        rewrite.with(input_path, input.render())
                    }
                    None => rewrite,
                }
            } else {
                rewrite
            }
        }
        RestartPlan::ReuseGeometry => {
            let geometry = record.file(".xyz");
            let file = format!("{}.xyz", record.basename);

            if !geometry.is_file() {
                return Err(EditorError::MissingInput(geometry).into());
            }

            let content = fs::read_to_string(&input_path)?;
            let rewritten =
                editor::orca_xyzfile(&content, &file).ok_or_else(|| EditorError::NoCoordinates(input_path.clone()))?;

            Rewrite::new(format!("coordinates from {file}")).with(input_path, rewritten)
        }
        RestartPlan::CheckpointGeometry {
            read_force_constants,
        } => {
            let mut input = read_gaussian(&input_path)?;

            if !input.link0.iter().any(|line| line.to_lowercase().starts_with("%chk")) {
                return Err(RestartError::MissingDirective {
                    file: input_path,
                    directive: "%chk",
                });
            }

            let added = ["geom=allcheck"];
            let filtered = input.merge_keywords(&added, &["geom="]);
            input.clear_molecule();
            if read_force_constants {
                input.read_force_constants();
            }

            if !filtered.is_empty() {
                warn!(job = %record.key(), "Dropping conflicting keywords {filtered:?}");
            }

            let warning = format!(
                "Restart due to: {cause}\nFiltered keywords: {filtered:?}\nAdded keywords: {added:?}\n"
            );

            Rewrite::new("geometry from checkpoint")
                .with(input_path, input.render())
                .with(record.directory.join(RESTART_WARNING), warning)
        }
    };

    Ok(Some(rewrite))
}

fn read_gaussian(path: &Path) -> Result<GaussianInput, RestartError> {
    let content = fs::read_to_string(path)?;

    GaussianInput::parse(&content).ok_or_else(|| EditorError::InvalidGaussian(path.to_path_buf()).into())
}

/// Restart a failed row in place: archive the attempt, clear it, rewrite the
/// inputs for `cause` and reset the row to `not_started` without an id.
#[instrument(skip_all, fields(job = %record.key(), cause = %cause))]
pub fn restart(
    record: &mut JobRecord,
    cause: &FailureCause,
    config: &RunnerConfig,
) -> Result<RestartOutcome, RestartError> {
    let spec = config.program(record.program);

    let Some(plan) = plan(record.program, &spec, cause) else {
        info!("No restart plan, leaving the job failed");
        return Ok(RestartOutcome::NotRestartable);
    };

    let previous = attempts(&record.directory);
    if previous >= config.restart.max_attempts {
        warn!(attempts = previous, "Restart limit reached, giving up on the job");
        record.status = Status::PermanentlyFailed;

        if let Err(error) = persist_status(record) {
            warn!("Failed to record permanent failure in run info: {error}");
        }

        return Ok(RestartOutcome::PermanentlyFailed);
    }

    let Some(rewrite) = prepare(plan, cause, record, &spec, &config.restart)? else {
        return Ok(RestartOutcome::NotRestartable);
    };

    let archive = archive(&record.directory)?;
    clear_attempt(record, &spec, &config.scheduler.log_glob)?;
    rewrite.write()?;

    record.status = Status::NotStarted;
    record.external_id = None;

    info!(attempt = previous + 1, plan = ?plan, "Restarting: {}", rewrite.description);

    Ok(RestartOutcome::Restarted { plan, archive })
}

/// Downstream jobs read the upstream status from its run info
fn persist_status(record: &JobRecord) -> Result<(), RunInfoError> {
    match RunInfo::read(&record.directory)? {
        Some(mut info) => {
            info.status = record.status;
            info.write(&record.directory)
        }
        None => Ok(()),
    }
}

/// Classify every `failed` and `permanently_failed` row of `ledger`
pub fn classify_ledger(ledger: &Ledger, executor: &dyn Executor, config: &RunnerConfig) -> Vec<Classification> {
    ledger
        .records()
        .iter()
        .filter(|record| matches!(record.status, Status::Failed | Status::PermanentlyFailed))
        .map(|record| Classification {
            key: record.key(),
            program: record.program,
            status: record.status,
            cause: classify(record, executor, config),
        })
        .collect()
}

/// Classify and restart every `failed` row of `ledger`. Dependents that were
/// broken by a restarted row become `not_started` again. A row whose restart
/// fails stays `failed` with its attempt untouched.
pub fn restart_ledger(
    ledger: &mut Ledger,
    executor: &dyn Executor,
    config: &RunnerConfig,
) -> Vec<(JobKey, Result<RestartOutcome, RestartError>)> {
    let failed: Vec<JobKey> = ledger
        .records()
        .iter()
        .filter(|record| record.status == Status::Failed)
        .map(JobRecord::key)
        .collect();

    let mut outcomes = Vec::with_capacity(failed.len());

    for key in failed {
        let Some(record) = ledger.get_mut(&key) else {
            continue;
        };

        let cause = classify(record, executor, config);
        let outcome = restart(record, &cause, config);

        match outcome {
            Ok(RestartOutcome::Restarted { .. }) => {
                ledger.reset_broken_dependents(&key.directory);
            }
            Ok(_) => {}
            Err(ref error) => error!(job = %key, "Restart failed: {error}"),
        }

        outcomes.push((key, outcome));
    }

    outcomes
}

#[cfg(test)]
#[path = "restart_test.rs"]
mod restart_test;
