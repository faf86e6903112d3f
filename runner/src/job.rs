use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// External scheduler id, absent until the job has been submitted
pub type ExternalId = u64;

/// Sentinel used in the ledger and run info for "never submitted"
pub const UNSUBMITTED: i64 = -1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown program '{0}'")]
    UnknownProgram(String),
    #[error("Unknown status '{0}'")]
    UnknownStatus(String),
}

/// Closed set of computational programs the runner knows how to drive.
/// New programs are added here and in the tables in `harness::policy`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Program {
    Orca,
    Gaussian,
    Crest,
    Xtb,
    PyAroma,
}

impl Program {
    pub const ALL: [Program; 5] = [
        Program::Orca,
        Program::Gaussian,
        Program::Crest,
        Program::Xtb,
        Program::PyAroma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orca => "orca",
            Self::Gaussian => "gaussian",
            Self::Crest => "crest",
            Self::Xtb => "xtb",
            Self::PyAroma => "pyaroma",
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Program {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "orca" => Ok(Self::Orca),
            "gaussian" => Ok(Self::Gaussian),
            "crest" => Ok(Self::Crest),
            "xtb" => Ok(Self::Xtb),
            "pyaroma" => Ok(Self::PyAroma),
            _ => Err(ParseError::UnknownProgram(value.to_owned())),
        }
    }
}

/// Lifecycle of a ledger row.
///
/// `NotStarted -> Pending -> Running -> {Succeeded | Failed}`. `BrokenDependency`
/// is only reachable from `NotStarted`/`Pending`, and `Failed` only goes back to
/// `NotStarted` through the restart subsystem.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    Pending,
    Running,
    Succeeded,
    Failed,
    BrokenDependency,
    PermanentlyFailed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::BrokenDependency => "broken_dependency",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// pending or running, i.e. occupying a slot of the concurrency cap
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::BrokenDependency | Self::PermanentlyFailed
        )
    }

    /// statuses that break every job depending on this one
    pub fn breaks_dependents(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::BrokenDependency | Self::PermanentlyFailed
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "not_started" => Ok(Self::NotStarted),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "broken_dependency" => Ok(Self::BrokenDependency),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(ParseError::UnknownStatus(other.to_owned())),
        }
    }
}

/// Identity of a ledger row
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobKey {
    pub directory: PathBuf,
    pub basename: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.directory.join(&self.basename).display())
    }
}

/// Upstream job whose artifact this job consumes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    /// absolute directory of the upstream job
    pub directory: PathBuf,
    /// file expected in `directory` once the upstream succeeded
    pub artifact: String,
}

impl Dependency {
    pub fn artifact_path(&self) -> PathBuf {
        self.directory.join(&self.artifact)
    }
}

/// One ledger row
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobRecord {
    pub external_id: Option<ExternalId>,
    pub basename: String,
    pub directory: PathBuf,
    pub program: Program,
    pub status: Status,
    pub dependency: Option<Dependency>,
}

impl JobRecord {
    pub fn new(basename: impl Into<String>, directory: impl Into<PathBuf>, program: Program) -> Self {
        Self {
            external_id: None,
            basename: basename.into(),
            directory: directory.into(),
            program,
            status: Status::NotStarted,
            dependency: None,
        }
    }

    pub fn with_dependency(mut self, directory: impl Into<PathBuf>, artifact: impl Into<String>) -> Self {
        self.dependency = Some(Dependency {
            directory: directory.into(),
            artifact: artifact.into(),
        });
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            directory: self.directory.clone(),
            basename: self.basename.clone(),
        }
    }

    pub fn matches(&self, key: &JobKey) -> bool {
        self.directory == key.directory && self.basename == key.basename
    }

    /// path of `<directory>/<basename><extension>`
    pub fn file(&self, extension: &str) -> PathBuf {
        job_file(&self.directory, &self.basename, extension)
    }
}

pub fn job_file(directory: &Path, basename: &str, extension: &str) -> PathBuf {
    directory.join(format!("{basename}{extension}"))
}

/// Lexically normalise a path, resolving `.` and `..` without touching the
/// filesystem (job directories may not exist yet).
pub fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push("..");
                }
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    normalized
}
