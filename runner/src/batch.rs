use crate::{
    job::{normalize, JobKey, JobRecord, Program},
    ledger::{split_table, Ledger, LedgerError},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

// `<command>{<directory>,<artifact>}`, the artifact may be empty
static PIPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(\S+?)\s*\{\s*([^,\s]+)\s*,\s*(\S*?)\s*\}\s*$").expect("pipe pattern is valid")
});

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Batch file {0} not found")]
    NotFound(PathBuf),
    #[error("Failed to read batch file")]
    Io(#[from] io::Error),
    #[error("Batch file line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("Two batch rows share the identity {0}")]
    DuplicateIdentity(JobKey),
}

/// A parsed batch definition: the run root and one record per declared job
#[derive(Debug, Clone)]
pub struct Batch {
    pub root: PathBuf,
    pub ledger: Ledger,
}

fn malformed(line: usize, reason: impl Into<String>) -> BatchError {
    BatchError::Malformed {
        line,
        reason: reason.into(),
    }
}

/// Parse a pipe expression into `(upstream directory, artifact file)`.
/// An empty artifact defaults to `<last component of directory>.xyz`.
pub fn parse_pipe(expression: &str) -> Result<(String, String), String> {
    let captures = PIPE
        .captures(expression)
        .ok_or_else(|| format!("'{expression}' is not of the form coords{{<directory>,<file>}}"))?;

    let command = &captures[1];
    let directory = captures[2].to_owned();
    let artifact = match &captures[3] {
        "" => {
            let stem = Path::new(&directory)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| format!("can't derive an artifact name from '{directory}'"))?;

            format!("{stem}.xyz")
        }
        artifact => artifact.to_owned(),
    };

    if command.eq_ignore_ascii_case("coords") {
        Ok((directory, artifact))
    } else {
        Err(format!("no pipe keyword '{command}'"))
    }
}

impl Batch {
    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self, BatchError> {
        if !path.is_file() {
            return Err(BatchError::NotFound(path.to_path_buf()));
        }

        Self::parse(&fs::read_to_string(path)?)
    }

    /// Format: a `root=<directory>` line, then a `|` delimited table with the
    /// columns `job_basename`, `job_directory`, `program` and optionally `pipe`.
    pub fn parse(content: &str) -> Result<Self, BatchError> {
        let (first, rest) = content
            .split_once('\n')
            .unwrap_or((content, ""));

        let root = match first.split_once('=') {
            Some((_, root)) if !root.trim().is_empty() => normalize(Path::new(root.trim())),
            _ => return Err(malformed(1, "first line must assign the root directory")),
        };

        let (header, rows) = split_table(rest).ok_or_else(|| malformed(2, "missing header row"))?;
        let column = |name: &str| {
            header
                .get(name)
                .copied()
                .ok_or_else(|| malformed(2, format!("header is missing column '{name}'")))
        };
        let basename_column = column("job_basename")?;
        let directory_column = column("job_directory")?;
        let program_column = column("program")?;
        let pipe_column = header.get("pipe").copied();

        let mut records = Vec::with_capacity(rows.len());

        for (index, fields) in rows {
            // rows are numbered relative to `rest`, which starts on line 2
            let line = index + 1;
            let field = |column: usize| fields.get(column).copied().unwrap_or("");

            let basename = field(basename_column);
            if basename.is_empty() {
                return Err(malformed(line, "empty job_basename"));
            }

            let directory = normalize(&root.join(field(directory_column)));
            let program: Program = field(program_column)
                .parse()
                .map_err(|error| malformed(line, format!("{error}")))?;

            let mut record = JobRecord::new(basename, directory.clone(), program);

            if let Some(pipe) = pipe_column.map(field).filter(|pipe| !pipe.is_empty()) {
                let (upstream, artifact) = parse_pipe(pipe).map_err(|reason| malformed(line, reason))?;

                record = record.with_dependency(normalize(&directory.join(upstream)), artifact);
            }

            debug!(job = %record.key(), program = %record.program, "Declared job");
            records.push(record);
        }

        let ledger = Ledger::new(records).map_err(|error| match error {
            LedgerError::DuplicateIdentity(key) => BatchError::DuplicateIdentity(key),
            other => malformed(0, other.to_string()),
        })?;

        Ok(Self { root, ledger })
    }
}

#[cfg(test)]
#[path = "batch_test.rs"]
mod batch_test;
