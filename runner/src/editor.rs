//! In place edits of generated inputs: pointing them at piped coordinates and
//! rewriting the directives a restart changes.

pub mod gaussian;
pub mod sbatch;

use crate::harness::policy::InputStyle;
use gaussian::GaussianInput;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum EditorError {
    #[error("Input {0} not found")]
    MissingInput(PathBuf),
    #[error("Failed to edit input")]
    Io(#[from] io::Error),
    #[error("{0} has no coordinate reference to rewrite")]
    NoCoordinates(PathBuf),
    #[error("{0} is not a Gaussian input")]
    InvalidGaussian(PathBuf),
    #[error("Geometry {0} has no atoms")]
    InvalidGeometry(PathBuf),
}

fn read_input(path: &Path) -> Result<String, EditorError> {
    if !path.is_file() {
        return Err(EditorError::MissingInput(path.to_path_buf()));
    }

    Ok(fs::read_to_string(path)?)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Atom lines of an xyz file: the count and comment lines are skipped
pub fn xyz_atoms(content: &str) -> Vec<String> {
    content
        .lines()
        .skip(2)
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Rewrite `input` so its coordinates come from `geometry`, a file in the same
/// directory. ORCA and script inputs reference the file by name, Gaussian
/// inputs get the atoms inlined.
#[tracing::instrument(level = "debug")]
pub fn use_geometry(style: InputStyle, input: &Path, geometry: &Path) -> Result<(), EditorError> {
    let content = read_input(input)?;
    let name = file_name(geometry);

    let rewritten = match style {
        InputStyle::OrcaInput => orca_xyzfile(&content, &name),
        InputStyle::Script => script_geometry(&content, &name),
        InputStyle::GaussianInput => {
            let mut parsed =
                GaussianInput::parse(&content).ok_or_else(|| EditorError::InvalidGaussian(input.to_path_buf()))?;

            let atoms = xyz_atoms(&read_input(geometry)?);
            if atoms.is_empty() {
                return Err(EditorError::InvalidGeometry(geometry.to_path_buf()));
            }

            match parsed.charge_multiplicity {
                Some(_) => {
                    parsed.coordinates = atoms;
                    Some(parsed.render())
                }
                None => None,
            }
        }
    };

    let rewritten = rewritten.ok_or_else(|| EditorError::NoCoordinates(input.to_path_buf()))?;
    fs::write(input, rewritten)?;

    debug!(input = ?input, geometry = %name, "Input now reads its coordinates from the piped geometry");

    Ok(())
}

/// `* xyzfile <charge> <multiplicity> <file>`, an inline `* xyz` block is
/// replaced by the file reference
pub fn orca_xyzfile(content: &str, file: &str) -> Option<String> {
    let mut output = Vec::new();
    let mut lines = content.lines();
    let mut replaced = false;

    while let Some(line) = lines.next() {
        let tokens: Vec<&str> = line.split_whitespace().collect();

        match tokens.as_slice() {
            ["*", kind, charge, multiplicity, ..] if !replaced && kind.eq_ignore_ascii_case("xyzfile") => {
                output.push(format!("* xyzfile {charge} {multiplicity} {file}"));
                replaced = true;
            }
            ["*", kind, charge, multiplicity] if !replaced && kind.eq_ignore_ascii_case("xyz") => {
                output.push(format!("* xyzfile {charge} {multiplicity} {file}"));
                replaced = true;

                // skip the inline block up to its closing star
                for inline in lines.by_ref() {
                    if inline.trim() == "*" {
                        break;
                    }
                }
            }
            _ => output.push(line.to_owned()),
        }
    }

    replaced.then(|| {
        let mut rewritten = output.join("\n");
        rewritten.push('\n');
        rewritten
    })
}

/// Replace the `*.xyz` argument of every command in a submit script
pub fn script_geometry(content: &str, file: &str) -> Option<String> {
    let mut replaced = false;

    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.trim_start().starts_with('#') {
                return line.to_owned();
            }

            let indent = &line[..line.len() - line.trim_start().len()];
            let tokens: Vec<&str> = line
                .split_whitespace()
                .map(|token| {
                    if token.ends_with(".xyz") {
                        replaced = true;
                        file
                    } else {
                        token
                    }
                })
                .collect();

            format!("{indent}{}", tokens.join(" "))
        })
        .collect();

    replaced.then(|| {
        let mut rewritten = lines.join("\n");
        rewritten.push('\n');
        rewritten
    })
}

/// Set the `%pal nprocs` block of an ORCA input, adding one after the keyword
/// lines if the input has none
pub fn orca_nprocs(content: &str, nprocs: u32) -> String {
    let mut output: Vec<String> = Vec::new();
    let mut found = false;
    let mut lines = content.lines();

    while let Some(line) = lines.next() {
        let lower = line.trim().to_lowercase();

        if lower.starts_with("%pal") {
            found = true;
            output.push(format!("%pal nprocs {nprocs} end"));

            // multi line block, drop everything up to its `end`
            if !lower.split_whitespace().any(|token| token == "end") {
                for inner in lines.by_ref() {
                    if inner.trim().eq_ignore_ascii_case("end") {
                        break;
                    }
                }
            }
        } else {
            output.push(line.to_owned());
        }
    }

    if !found {
        let position = output
            .iter()
            .rposition(|line| line.trim_start().starts_with('!'))
            .map(|index| index + 1)
            .unwrap_or(0);
        output.insert(position, format!("%pal nprocs {nprocs} end"));
    }

    let mut rewritten = output.join("\n");
    rewritten.push('\n');
    rewritten
}

/// `nprocs` from a `%pal` block
pub fn orca_nprocs_of(content: &str) -> Option<u32> {
    let mut tokens = content
        .lines()
        .skip_while(|line| !line.trim().to_lowercase().starts_with("%pal"))
        .flat_map(str::split_whitespace);

    tokens
        .position(|token| token.eq_ignore_ascii_case("nprocs"))
        .and_then(|_| tokens.next())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
#[path = "editor_test.rs"]
mod editor_test;
