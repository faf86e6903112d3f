use crate::job::{ExternalId, Program, Status, UNSUBMITTED};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::warn;

pub const RUN_INFO_FILE: &str = "run_info.json";

#[derive(Error, Debug)]
pub enum RunInfoError {
    #[error("Failed to access run info")]
    Io(#[from] io::Error),
    #[error("Run info is not valid JSON")]
    Json(#[from] serde_json::Error),
}

/// Durable shadow of a harness, written into the job directory after every
/// status change so a fresh process can rebuild the harness.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct RunInfo {
    pub basename: String,
    pub program: Program,
    pub status: Status,
    /// `-1` until submitted
    pub external_id: i64,
    pub ruleset: String,
    #[serde(default)]
    pub parse_failures: u32,
    /// polls that found the job gone from the queue and no output
    #[serde(default)]
    pub vanished_polls: u32,
    /// host of the orchestrator that last wrote this record
    #[serde(default)]
    pub host: Option<String>,
}

impl RunInfo {
    pub fn path(directory: &Path) -> PathBuf {
        directory.join(RUN_INFO_FILE)
    }

    pub fn external_id(&self) -> Option<ExternalId> {
        u64::try_from(self.external_id).ok()
    }

    pub fn encode_id(id: Option<ExternalId>) -> i64 {
        id.and_then(|id| i64::try_from(id).ok()).unwrap_or(UNSUBMITTED)
    }

    /// `Ok(None)` if the directory has no run info yet
    pub fn read(directory: &Path) -> Result<Option<Self>, RunInfoError> {
        let path = Self::path(directory);

        if !path.is_file() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// Status recorded in `directory`, unreadable records count as absent
    pub fn status_of(directory: &Path) -> Option<Status> {
        match Self::read(directory) {
            Ok(info) => info.map(|info| info.status),
            Err(error) => {
                warn!(directory = ?directory, "Ignoring unreadable run info: {error}");

                None
            }
        }
    }

    pub fn write(&self, directory: &Path) -> Result<(), RunInfoError> {
        let path = Self::path(directory);
        let tmp = directory.join(format!(".{RUN_INFO_FILE}.tmp"));

        fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        fs::rename(tmp, path)?;

        Ok(())
    }

    pub fn remove(directory: &Path) -> Result<(), RunInfoError> {
        match fs::remove_file(Self::path(directory)) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error.into()),
            _ => Ok(()),
        }
    }
}

/// hostname of this machine, `None` if it can't be determined
pub fn hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .map(|name| name.to_string_lossy().into_owned())
}
