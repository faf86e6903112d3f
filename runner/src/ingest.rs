pub mod exec;
pub mod rules;

use crate::{harness::policy::ProgramSpec, job::Program};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IngestorError {
    #[error("Output file {0} not found")]
    MissingOutput(PathBuf),
    #[error("Failed to read output or ruleset")]
    Io(#[from] std::io::Error),
    #[error("Failed to deserialize ruleset")]
    InvalidRuleset(#[from] serde_yaml::Error),
    #[error("Rule '{field}' has an invalid pattern")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },
    #[error("Failed to spawn external parser")]
    SpawnParser(#[source] std::io::Error),
    #[error("External parser exited with {status}: {stderr}")]
    ParserFailed { status: String, stderr: String },
    #[error("External parser timed out")]
    ParserTimeout,
    #[error("Failed to deserialize parser output")]
    DeserializeParser(#[from] serde_json::Error),
}

/// A single value extracted from an output file
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Count(u64),
    Number(f64),
    Text(String),
}

/// Structured result of parsing one output file, keyed by field name
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct ParsedOutput(pub BTreeMap<String, FieldValue>);

impl ParsedOutput {
    /// a missing field reads as false, a count is true if non zero
    pub fn flag(&self, field: &str) -> bool {
        match self.0.get(field) {
            Some(FieldValue::Flag(value)) => *value,
            Some(FieldValue::Count(count)) => *count > 0,
            Some(FieldValue::Number(number)) => *number != 0.0,
            Some(FieldValue::Text(text)) => !text.is_empty(),
            None => false,
        }
    }

    pub fn count(&self, field: &str) -> u64 {
        match self.0.get(field) {
            Some(FieldValue::Count(count)) => *count,
            Some(FieldValue::Flag(value)) => u64::from(*value),
            Some(FieldValue::Number(number)) if *number >= 0.0 => *number as u64,
            Some(FieldValue::Number(_)) => 0,
            Some(FieldValue::Text(text)) => text.trim().parse().unwrap_or(0),
            None => 0,
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.0.get(field) {
            Some(FieldValue::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn insert(&mut self, field: impl Into<String>, value: FieldValue) {
        self.0.insert(field.into(), value);
    }

    /// path of the parsed result next to the output, `<basename>.json`
    pub fn path_for(directory: &Path, basename: &str) -> PathBuf {
        directory.join(format!("{basename}.json"))
    }

    pub fn store(&self, path: &Path) -> Result<(), IngestorError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;

        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, IngestorError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Output extraction for one program: either the declarative ruleset or an
/// external parser executable
#[derive(Clone, Debug)]
pub enum Ingestors {
    Rules(rules::Ruleset),
    Exec(exec::ExecIngestor),
}

impl Ingestors {
    pub fn load(program: Program, spec: &ProgramSpec) -> Result<Self, IngestorError> {
        if let Some(ref parser) = spec.parser {
            debug!(program = %program, parser = ?parser, "Using external parser");

            return Ok(Self::Exec(exec::ExecIngestor::new(parser.clone(), spec.parser_timeout())));
        }

        match spec.ruleset {
            Some(ref path) => rules::Ruleset::load(path).map(Self::Rules),
            None => rules::Ruleset::builtin(program).map(Self::Rules),
        }
    }

    /// reference recorded in the run info so a restarted process parses the same way
    pub fn reference(&self) -> String {
        match self {
            Self::Rules(ruleset) => ruleset.reference().to_owned(),
            Self::Exec(exec) => exec.parser.to_string_lossy().into_owned(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn extract(&self, output: &Path) -> Result<ParsedOutput, IngestorError> {
        if !output.is_file() {
            return Err(IngestorError::MissingOutput(output.to_path_buf()));
        }

        match self {
            // programs print stray latin-1 bytes, never fail on them
            Self::Rules(ruleset) => ruleset.extract(&String::from_utf8_lossy(&fs::read(output)?)),
            Self::Exec(exec) => exec.extract(output),
        }
    }
}

#[cfg(test)]
#[path = "ingest_test.rs"]
mod ingest_test;
