use super::{FieldValue, IngestorError, ParsedOutput};
use crate::job::Program;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::Path};
use tracing::trace;

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// true if the pattern matches anywhere
    Flag,
    /// number of matches
    Count,
    /// first capture group of the first match
    First,
    /// first capture group of the last match
    Last,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
struct RuleDefinition {
    pattern: String,
    kind: RuleKind,
}

#[derive(Clone, Debug)]
struct Rule {
    pattern: Regex,
    kind: RuleKind,
}

/// Declarative description of the fields to pull out of one program's output
#[derive(Clone, Debug)]
pub struct Ruleset {
    reference: String,
    rules: BTreeMap<String, Rule>,
}

const ORCA_RULES: &str = include_str!("../../rules/orca.yaml");
const GAUSSIAN_RULES: &str = include_str!("../../rules/gaussian.yaml");
const CREST_RULES: &str = include_str!("../../rules/crest.yaml");
const XTB_RULES: &str = include_str!("../../rules/xtb.yaml");
const PYAROMA_RULES: &str = include_str!("../../rules/pyaroma.yaml");

impl Ruleset {
    pub fn builtin(program: Program) -> Result<Self, IngestorError> {
        let source = match program {
            Program::Orca => ORCA_RULES,
            Program::Gaussian => GAUSSIAN_RULES,
            Program::Crest => CREST_RULES,
            Program::Xtb => XTB_RULES,
            Program::PyAroma => PYAROMA_RULES,
        };

        Self::parse(&format!("builtin:{program}"), source)
    }

    pub fn load(path: &Path) -> Result<Self, IngestorError> {
        Self::parse(&path.to_string_lossy(), &fs::read_to_string(path)?)
    }

    pub fn parse(reference: &str, source: &str) -> Result<Self, IngestorError> {
        let definitions: BTreeMap<String, RuleDefinition> = serde_yaml::from_str(source)?;
        let mut rules = BTreeMap::new();

        for (field, definition) in definitions {
            let pattern = RegexBuilder::new(&definition.pattern)
                .multi_line(true)
                .build()
                .map_err(|source| IngestorError::InvalidPattern {
                    field: field.clone(),
                    source,
                })?;

            rules.insert(
                field,
                Rule {
                    pattern,
                    kind: definition.kind,
                },
            );
        }

        Ok(Self {
            reference: reference.to_owned(),
            rules,
        })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Apply every rule to the full output text. Capture rules without a
    /// match are left out of the result.
    pub fn extract(&self, content: &str) -> Result<ParsedOutput, IngestorError> {
        let mut output = ParsedOutput::default();

        for (field, rule) in self.rules.iter() {
            let value = match rule.kind {
                RuleKind::Flag => Some(FieldValue::Flag(rule.pattern.is_match(content))),
                RuleKind::Count => Some(FieldValue::Count(
                    rule.pattern.find_iter(content).count() as u64,
                )),
                RuleKind::First => rule
                    .pattern
                    .captures_iter(content)
                    .next()
                    .and_then(|captures| captures.get(1))
                    .map(|found| FieldValue::Text(found.as_str().to_owned())),
                RuleKind::Last => rule
                    .pattern
                    .captures_iter(content)
                    .last()
                    .and_then(|captures| captures.get(1))
                    .map(|found| FieldValue::Text(found.as_str().to_owned())),
            };

            trace!(field = %field, value = ?value, "Applied rule");

            if let Some(value) = value {
                output.insert(field.clone(), value);
            }
        }

        Ok(output)
    }
}
