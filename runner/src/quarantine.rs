use globset::{Glob, GlobMatcher};
use std::{
    fs, io,
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum QuarantineError {
    #[error("Invalid scheduler log glob")]
    InvalidGlob(#[from] globset::Error),
    #[error("Failed to copy into quarantine")]
    Io(#[from] io::Error),
}

/// Snapshot store for the output and scheduler logs of failed jobs, so they
/// can still be inspected after the job directory is reused by a restart.
#[derive(Debug, Clone)]
pub struct Quarantine {
    root: PathBuf,
    directory: PathBuf,
    logs: GlobMatcher,
}

/// `a/b/c` relative to the run root becomes `a__b__c`
pub fn flatten(root: &Path, directory: &Path) -> String {
    let relative = directory.strip_prefix(root).unwrap_or(directory);

    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("__")
}

impl Quarantine {
    /// `directory` is taken relative to `root` unless absolute
    pub fn new(root: &Path, directory: &Path, log_glob: &str) -> Result<Self, QuarantineError> {
        Ok(Self {
            root: root.to_path_buf(),
            directory: root.join(directory),
            logs: Glob::new(log_glob)?.compile_matcher(),
        })
    }

    pub fn path_for(&self, job_directory: &Path) -> PathBuf {
        self.directory.join(flatten(&self.root, job_directory))
    }

    /// Copy `output` and every scheduler log of `job_directory` into the
    /// quarantine, replacing an older snapshot of the same job
    pub fn store(&self, job_directory: &Path, output: &Path) -> Result<PathBuf, QuarantineError> {
        let target = self.path_for(job_directory);

        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        }
        fs::create_dir_all(&target)?;

        let mut copied = 0;

        if let Some(name) = output.file_name().filter(|_| output.is_file()) {
            fs::copy(output, target.join(name))?;
            copied += 1;
        }

        if job_directory.is_dir() {
            for entry in fs::read_dir(job_directory)? {
                let entry = entry?;

                if entry.file_type()?.is_file() && self.logs.is_match(entry.file_name()) {
                    fs::copy(entry.path(), target.join(entry.file_name()))?;
                    copied += 1;
                }
            }
        }

        debug!(target = ?target, copied, "Quarantined failed job");
        info!(directory = ?job_directory, "Failure snapshot in {}", target.to_string_lossy());

        Ok(target)
    }
}

#[cfg(test)]
#[path = "quarantine_test.rs"]
mod quarantine_test;
