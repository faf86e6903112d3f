use crate::{
    dependency,
    job::{Dependency, JobKey, JobRecord, ParseError, Status, UNSUBMITTED},
};
use itertools::Itertools;
use std::{
    collections::{BTreeMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

pub const DELIMITER: char = '|';

const COLUMNS: [&str; 7] = [
    "job_id",
    "job_basename",
    "job_directory",
    "program",
    "job_status",
    "coords_from",
    "xyz_filename",
];

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger {0} not found")]
    NotFound(PathBuf),
    #[error("Failed to access ledger")]
    Io(#[from] io::Error),
    #[error("Ledger header is missing column '{0}'")]
    MissingColumn(&'static str),
    #[error("Ledger line {line}: {reason}")]
    MalformedRow { line: usize, reason: String },
    #[error("Ledger line {line}: invalid value")]
    InvalidValue {
        line: usize,
        #[source]
        source: ParseError,
    },
    #[error("Two ledger rows share the identity {0}")]
    DuplicateIdentity(JobKey),
}

/// Split a delimited table into its header index and rows. Empty lines are
/// skipped, line numbers are 1-based and relative to `content`.
pub(crate) fn split_table(content: &str) -> Option<(BTreeMap<String, usize>, Vec<(usize, Vec<&str>)>)> {
    let mut lines = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let (_, header) = lines.next()?;
    let header = header
        .split(DELIMITER)
        .enumerate()
        .map(|(index, name)| (name.trim().to_owned(), index))
        .collect();

    let rows = lines
        .map(|(index, line)| (index + 1, line.split(DELIMITER).map(str::trim).collect()))
        .collect();

    Some((header, rows))
}

/// Durable table of every job in a run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ledger {
    records: Vec<JobRecord>,
}

impl Ledger {
    /// Build a ledger, rejecting rows that share a `(directory, basename)` identity
    pub fn new(records: Vec<JobRecord>) -> Result<Self, LedgerError> {
        let mut seen = HashSet::new();

        for record in records.iter() {
            if !seen.insert(record.key()) {
                return Err(LedgerError::DuplicateIdentity(record.key()));
            }
        }

        Ok(Self { records })
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &JobKey) -> Option<&JobRecord> {
        self.records.iter().find(|record| record.matches(key))
    }

    pub fn get_mut(&mut self, key: &JobKey) -> Option<&mut JobRecord> {
        self.records.iter_mut().find(|record| record.matches(key))
    }

    /// rows living in `directory`, whatever their basename
    pub fn in_directory<'a>(&'a self, directory: &'a Path) -> impl Iterator<Item = &'a JobRecord> {
        self.records
            .iter()
            .filter(move |record| record.directory == directory)
    }

    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        if !path.is_file() {
            return Err(LedgerError::NotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let Some((header, rows)) = split_table(&content) else {
            return Ok(Self::default());
        };

        let mut columns = [0usize; COLUMNS.len()];
        for (slot, name) in columns.iter_mut().zip(COLUMNS) {
            *slot = *header.get(name).ok_or(LedgerError::MissingColumn(name))?;
        }
        let [id, basename, directory, program, status, coords_from, xyz_filename] = columns;

        let mut records = Vec::with_capacity(rows.len());

        for (line, fields) in rows {
            let field = |index: usize| {
                fields
                    .get(index)
                    .copied()
                    .ok_or_else(|| LedgerError::MalformedRow {
                        line,
                        reason: format!("expected {} columns, found {}", header.len(), fields.len()),
                    })
            };

            let external_id = match field(id)?.parse::<i64>() {
                Ok(UNSUBMITTED) => None,
                Ok(value) => Some(u64::try_from(value).map_err(|_| LedgerError::MalformedRow {
                    line,
                    reason: format!("invalid job id {value}"),
                })?),
                Err(error) => {
                    return Err(LedgerError::MalformedRow {
                        line,
                        reason: format!("invalid job id: {error}"),
                    })
                }
            };

            let dependency = match (field(coords_from)?, field(xyz_filename)?) {
                ("", _) => None,
                (upstream, artifact) => Some(Dependency {
                    directory: PathBuf::from(upstream),
                    artifact: artifact.to_owned(),
                }),
            };

            records.push(JobRecord {
                external_id,
                basename: field(basename)?.to_owned(),
                directory: PathBuf::from(field(directory)?),
                program: field(program)?
                    .parse()
                    .map_err(|source| LedgerError::InvalidValue { line, source })?,
                status: field(status)?
                    .parse()
                    .map_err(|source| LedgerError::InvalidValue { line, source })?,
                dependency,
            });
        }

        debug!("Loaded {} ledger rows", records.len());

        Self::new(records)
    }

    /// Union of two ledgers. Rows of `loaded` replace rows of `current` with the
    /// same identity in place, rows only in `loaded` are appended in its order.
    pub fn merge(current: &Ledger, loaded: &Ledger) -> Ledger {
        let mut records = current.records.clone();

        for record in loaded.records.iter() {
            match records.iter_mut().find(|existing| existing.matches(&record.key())) {
                Some(existing) => *existing = record.clone(),
                None => records.push(record.clone()),
            }
        }

        Ledger { records }
    }

    /// Write the whole table to a temporary file next to `path` and rename it
    /// over the ledger, a crash mid-write leaves the previous snapshot intact.
    pub fn persist(&self, path: &Path) -> Result<(), LedgerError> {
        let mut content = COLUMNS.iter().join(&DELIMITER.to_string());
        content.push('\n');

        for record in self.records.iter() {
            let (coords_from, xyz_filename) = match record.dependency {
                Some(ref dependency) => (
                    dependency.directory.to_string_lossy().into_owned(),
                    dependency.artifact.clone(),
                ),
                None => (String::new(), String::new()),
            };

            let row = [
                crate::run_info::RunInfo::encode_id(record.external_id).to_string(),
                record.basename.clone(),
                record.directory.to_string_lossy().into_owned(),
                record.program.to_string(),
                record.status.to_string(),
                coords_from,
                xyz_filename,
            ];

            content.push_str(&row.iter().join(&DELIMITER.to_string()));
            content.push('\n');
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger".to_owned());
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));

        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;

        debug!(path = ?path, "Persisted {} ledger rows", self.records.len());

        Ok(())
    }

    pub fn set_status(&mut self, key: &JobKey, status: Status) {
        if let Some(record) = self.get_mut(key) {
            record.status = status;
        }
    }

    /// rows that are `running` or `pending`
    pub fn is_active(&self) -> Vec<bool> {
        self.records
            .iter()
            .map(|record| record.status.is_active())
            .collect()
    }

    /// rows that are `not_started` with a satisfied dependency
    pub fn is_eligible(&self) -> Vec<bool> {
        self.records
            .iter()
            .map(|record| record.status == Status::NotStarted && dependency::satisfied(record))
            .collect()
    }

    /// rows whose dependency can no longer be satisfied
    pub fn is_blocked(&self) -> Vec<bool> {
        self.records
            .iter()
            .map(|record| dependency::broken(record, self))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status.is_active())
            .count()
    }

    /// Mark every waiting row whose upstream failed as `broken_dependency`.
    /// The mask is computed on the snapshot before any row changes, so each call
    /// moves breakage exactly one hop down a dependency chain.
    pub fn flag_broken_dependencies(&mut self) -> Vec<JobKey> {
        let blocked = self.is_blocked();
        let mut flagged = Vec::new();

        for (record, blocked) in self.records.iter_mut().zip(blocked) {
            if blocked && matches!(record.status, Status::NotStarted | Status::Pending) {
                info!(job = %record.key(), "Upstream failed, marking as broken dependency");
                record.status = Status::BrokenDependency;
                flagged.push(record.key());
            }
        }

        flagged
    }

    /// Undo the breakage below a requeued job in `directory`: every
    /// `broken_dependency` row downstream of it, transitively, goes back to
    /// `not_started`. Rows that are still blocked by another upstream are
    /// flagged again on the next tick.
    pub fn reset_broken_dependents(&mut self, directory: &Path) -> Vec<JobKey> {
        let mut upstream = vec![directory.to_path_buf()];
        let mut reset = Vec::new();

        while let Some(directory) = upstream.pop() {
            for record in self.records.iter_mut() {
                let depends = record
                    .dependency
                    .as_ref()
                    .map(|dependency| dependency.directory == directory)
                    .unwrap_or(false);

                if depends && record.status == Status::BrokenDependency {
                    info!(job = %record.key(), "Upstream requeued, clearing broken dependency");
                    record.status = Status::NotStarted;
                    reset.push(record.key());
                    upstream.push(record.directory.clone());
                }
            }
        }

        reset
    }

    /// true if no row is `not_started`, `pending` or `running`
    pub fn is_finished(&self) -> bool {
        self.records.iter().all(|record| record.status.is_terminal())
    }
}

#[cfg(test)]
#[path = "ledger_test.rs"]
mod ledger_test;
