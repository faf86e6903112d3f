//! Per program behaviour, kept in one table so adding a program means adding
//! a row here and a variant to [`Program`].

use crate::{
    ingest::ParsedOutput,
    job::{Program, Status},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// How parsed output maps to `succeeded`/`failed`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionPolicy {
    /// the `success` normal-termination marker decides
    Terminated,
    /// geometry optimisations also need `opt_success` and no imaginary modes
    Optimization,
    /// chained runs (opt + freq) need one normal termination per step and,
    /// for the frequency step, no imaginary modes
    LinkedSteps,
}

impl CompletionPolicy {
    pub fn interpret(&self, output: &ParsedOutput) -> Status {
        let succeeded = match self {
            Self::Terminated => output.flag("success"),
            Self::Optimization => {
                if output.flag("is_opt") {
                    output.flag("success")
                        && output.flag("opt_success")
                        && !output.flag("imaginary_frequencies")
                } else {
                    output.flag("success")
                }
            }
            Self::LinkedSteps => {
                if output.flag("is_opt_freq") {
                    output.count("normal_terminations") >= 2 && !output.flag("imaginary_frequencies")
                } else {
                    output.count("normal_terminations") >= 1
                }
            }
        };

        if succeeded {
            Status::Succeeded
        } else {
            Status::Failed
        }
    }
}

/// Post-success hook producing the canonical artifact `<basename>.xyz`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finalizer {
    None,
    /// the program writes `<basename>.xyz` itself, only check it exists
    OwnGeometry,
    /// copy a fixed file name written by the program
    CopyGeometry(&'static str),
    /// extract the last oriented geometry block of a Gaussian log
    GaussianOrientation,
}

/// How the coordinates of an input are referenced, used when piping
/// artifacts and when restarting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputStyle {
    /// `* xyzfile <charge> <multiplicity> <file>`
    OrcaInput,
    /// inline coordinate block after the charge/multiplicity line
    GaussianInput,
    /// the `*.xyz` argument of the commands in the submit script
    Script,
}

#[derive(Clone, Debug)]
pub struct ProgramSpec {
    pub output_extension: String,
    pub input_extension: String,
    pub ruleset: Option<PathBuf>,
    pub parser: Option<PathBuf>,
    pub parser_timeout_ms: u64,
    pub policy: CompletionPolicy,
    pub finalizer: Finalizer,
    pub input_style: InputStyle,
    /// restart rewrites are known for this program
    pub restartable: bool,
}

impl ProgramSpec {
    pub fn builtin(program: Program) -> Self {
        let (output, input, policy, finalizer, input_style, restartable) = match program {
            Program::Orca => (
                ".out",
                ".inp",
                CompletionPolicy::Optimization,
                Finalizer::OwnGeometry,
                InputStyle::OrcaInput,
                true,
            ),
            Program::Gaussian => (
                ".log",
                ".gjf",
                CompletionPolicy::LinkedSteps,
                Finalizer::GaussianOrientation,
                InputStyle::GaussianInput,
                true,
            ),
            Program::Crest => (
                ".out",
                ".sh",
                CompletionPolicy::Terminated,
                Finalizer::CopyGeometry("crest_best.xyz"),
                InputStyle::Script,
                false,
            ),
            Program::Xtb => (
                ".out",
                ".sh",
                CompletionPolicy::Terminated,
                Finalizer::CopyGeometry("xtbopt.xyz"),
                InputStyle::Script,
                true,
            ),
            Program::PyAroma => (
                ".out",
                ".sh",
                CompletionPolicy::Terminated,
                Finalizer::None,
                InputStyle::Script,
                true,
            ),
        };

        Self {
            output_extension: output.to_owned(),
            input_extension: input.to_owned(),
            ruleset: None,
            parser: None,
            parser_timeout_ms: 60_000,
            policy,
            finalizer,
            input_style,
            restartable,
        }
    }

    pub fn parser_timeout(&self) -> Duration {
        Duration::from_millis(self.parser_timeout_ms)
    }
}

#[cfg(test)]
#[path = "policy_test.rs"]
mod policy_test;
