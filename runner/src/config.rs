use crate::{
    harness::policy::{CompletionPolicy, ProgramSpec},
    job::Program,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        Ok((fs::metadata(path)?.mode() & 0o111) != 0)
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File {0} not found")]
    FileNotFound(PathBuf),
    #[error("Failed to read config file")]
    ReadFailed(#[from] Error),
    #[error("Failed to deserialize config file")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Config failed preflight checks, see log for details")]
    PreflightFailed,
}

/// Everything the runner needs for one run, from process start to process end
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct RunnerConfig {
    /// maximum number of jobs pending or running at the same time
    pub max_jobs: usize,
    /// sleep between two ticks, breakage propagates one dependency hop per tick
    pub tick_interval_ms: u64,
    /// ledger file name, relative to the directory of the batch file
    pub ledger: PathBuf,
    /// quarantine directory name, relative to the run root
    pub quarantine: PathBuf,
    pub scheduler: SchedulerConfig,
    pub harness: HarnessConfig,
    pub restart: RestartConfig,
    // per program overrides of the built-in program table
    pub programs: BTreeMap<Program, ProgramOverride>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    pub submit: String,
    pub query: String,
    pub accounting: String,
    /// attempts for a control plane command before giving up for this tick
    pub retries: u32,
    pub backoff_ms: u64,
    /// wall clock limit for a single control plane command
    pub timeout_ms: u64,
    /// glob for log files the scheduler writes into a job directory
    pub log_glob: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct HarnessConfig {
    /// cumulative parse failures after which a job is failed
    pub parse_fail_threshold: u32,
    /// polls of a job gone from the queue without any output before it is failed
    pub vanished_output_polls: u32,
    pub missing_output_retries: u32,
    pub missing_output_delay_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct RestartConfig {
    /// restart classified failures from inside the scheduling loop
    pub automatic: bool,
    /// restarts per job before it is marked permanently failed
    pub max_attempts: u32,
    pub core_factor: f64,
    pub memory_factor: f64,
    pub walltime_factor: f64,
    pub max_cores: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct ProgramOverride {
    pub ruleset: Option<PathBuf>,
    /// external parser executable, takes precedence over `ruleset`
    pub parser: Option<PathBuf>,
    pub parser_timeout_ms: Option<u64>,
    pub policy: Option<CompletionPolicy>,
    pub output_extension: Option<String>,
    pub input_extension: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            tick_interval_ms: 5000,
            ledger: PathBuf::from("__ledger__.csv"),
            quarantine: PathBuf::from("fail_output"),
            scheduler: SchedulerConfig::default(),
            harness: HarnessConfig::default(),
            restart: RestartConfig::default(),
            programs: BTreeMap::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit: "sbatch".to_owned(),
            query: "squeue".to_owned(),
            accounting: "seff".to_owned(),
            retries: 5,
            backoff_ms: 500,
            timeout_ms: 30_000,
            log_glob: "slurm-*.out".to_owned(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            parse_fail_threshold: 10,
            vanished_output_polls: 120,
            missing_output_retries: 3,
            missing_output_delay_ms: 1000,
        }
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            automatic: false,
            max_attempts: 3,
            core_factor: 2.0,
            memory_factor: 1.5,
            walltime_factor: 2.0,
            max_cores: 64,
        }
    }
}

impl SchedulerConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl HarnessConfig {
    pub fn missing_output_delay(&self) -> Duration {
        Duration::from_millis(self.missing_output_delay_ms)
    }
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path)?;

        // an empty file is a valid, all-default config
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// built-in program table with the overrides of this config applied
    pub fn program(&self, program: Program) -> ProgramSpec {
        let mut spec = ProgramSpec::builtin(program);

        if let Some(overrides) = self.programs.get(&program) {
            if let Some(ref ruleset) = overrides.ruleset {
                spec.ruleset = Some(ruleset.clone());
            }
            if let Some(ref parser) = overrides.parser {
                spec.parser = Some(parser.clone());
            }
            if let Some(timeout) = overrides.parser_timeout_ms {
                spec.parser_timeout_ms = timeout;
            }
            if let Some(policy) = overrides.policy {
                spec.policy = policy;
            }
            if let Some(ref extension) = overrides.output_extension {
                spec.output_extension = extension.clone();
            }
            if let Some(ref extension) = overrides.input_extension {
                spec.input_extension = extension.clone();
            }
        }

        spec
    }

    /// Validate the config, logging every problem instead of stopping at the first one.
    /// Returns true if any error was found.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;

        if self.max_jobs == 0 {
            error!("max_jobs must be at least 1, no job could ever be submitted");
            contains_error = true;
        }

        if self.tick_interval_ms == 0 {
            warn!("tick_interval_ms is 0, the runner will poll the scheduler without pause");
        }

        if self.scheduler.retries == 0 {
            error!("scheduler.retries must be at least 1");
            contains_error = true;
        }

        for (name, command) in [
            ("submit", &self.scheduler.submit),
            ("query", &self.scheduler.query),
            ("accounting", &self.scheduler.accounting),
        ] {
            if command.trim().is_empty() {
                error!("scheduler.{name} must name a command");
                contains_error = true;
            }
        }

        if let Err(error) = globset::Glob::new(&self.scheduler.log_glob) {
            error!("scheduler.log_glob ({}) is not a valid glob: {error}", self.scheduler.log_glob);
            contains_error = true;
        }

        if self.harness.vanished_output_polls == 0 {
            error!("harness.vanished_output_polls must be at least 1");
            contains_error = true;
        }

        if self.harness.parse_fail_threshold == 0 {
            error!("harness.parse_fail_threshold must be at least 1");
            contains_error = true;
        }

        for (name, factor) in [
            ("core_factor", self.restart.core_factor),
            ("memory_factor", self.restart.memory_factor),
            ("walltime_factor", self.restart.walltime_factor),
        ] {
            if factor <= 1.0 {
                error!("restart.{name} ({factor}) must be greater than 1, a restart would request the same resources");
                contains_error = true;
            }
        }

        if self.restart.automatic && self.restart.max_attempts == 0 {
            warn!("restart.automatic is set but restart.max_attempts is 0, failed jobs will be marked permanently failed");
        }

        for (program, overrides) in self.programs.iter() {
            if let Some(ref ruleset) = overrides.ruleset {
                if !ruleset.is_file() {
                    error!(
                        "programs.{program}.ruleset points to {} which is not a file",
                        ruleset.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if let Some(ref parser) = overrides.parser {
                match check_executable(parser) {
                    Ok(true) => {}
                    Ok(false) => {
                        error!(
                            "programs.{program}.parser ({}) is not executable",
                            parser.to_string_lossy()
                        );
                        contains_error = true;
                    }
                    Err(e) => {
                        error!(
                            "Failed to determine if programs.{program}.parser ({}) is an executable: {e}",
                            parser.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
            }
        }

        contains_error
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
