//! Post-success hooks producing `<basename>.xyz` for downstream jobs

use super::{policy::Finalizer, HarnessError};
use crate::job::job_file;
use std::{fs, path::Path};
use tracing::{debug, info};

const ELEMENTS: [&str; 86] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S", "Cl", "Ar", "K", "Ca",
    "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr", "Y",
    "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In", "Sn", "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce",
    "Pr", "Nd", "Pm", "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb", "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir",
    "Pt", "Au", "Hg", "Tl", "Pb", "Bi", "Po", "At", "Rn",
];

pub fn element(atomic_number: usize) -> Option<&'static str> {
    ELEMENTS.get(atomic_number.checked_sub(1)?).copied()
}

/// One atom: element symbol and cartesian coordinates in Angstrom
pub type Atom = (String, [f64; 3]);

/// Atoms of the last `Standard orientation` table of a Gaussian log, falling
/// back to `Input orientation` for runs with `nosymm`
pub fn gaussian_geometry(log: &str) -> Option<Vec<Atom>> {
    let lines: Vec<&str> = log.lines().collect();

    let start = ["Standard orientation:", "Input orientation:"]
        .iter()
        .find_map(|title| lines.iter().rposition(|line| line.contains(title)))?;

    // title, dashes, two header lines, dashes
    let atoms: Vec<Atom> = lines
        .iter()
        .skip(start + 5)
        .take_while(|line| !line.trim_start().starts_with("----"))
        .map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let [_, atomic_number, _, x, y, z] = columns.as_slice() else {
                return None;
            };

            let symbol = element(atomic_number.parse().ok()?)?;

            Some((symbol.to_owned(), [x.parse().ok()?, y.parse().ok()?, z.parse().ok()?]))
        })
        .collect::<Option<_>>()?;

    (!atoms.is_empty()).then_some(atoms)
}

pub fn render_xyz(comment: &str, atoms: &[Atom]) -> String {
    let mut output = format!("{}\n{comment}\n", atoms.len());

    for (symbol, [x, y, z]) in atoms {
        output.push_str(&format!("{symbol:<2} {x:>16.8} {y:>16.8} {z:>16.8}\n"));
    }

    output
}

/// Run `finalizer` for a succeeded job in `directory`
pub fn run(finalizer: Finalizer, directory: &Path, basename: &str, output: &Path) -> Result<(), HarnessError> {
    let artifact = job_file(directory, basename, ".xyz");

    match finalizer {
        Finalizer::None => {}
        Finalizer::OwnGeometry => {
            if !artifact.is_file() {
                return Err(HarnessError::Finalize(format!(
                    "expected {} to be written by the program",
                    artifact.to_string_lossy()
                )));
            }
        }
        Finalizer::CopyGeometry(name) => {
            let source = directory.join(name);

            if !source.is_file() {
                return Err(HarnessError::Finalize(format!("{name} missing in {}", directory.to_string_lossy())));
            }

            fs::copy(&source, &artifact).map_err(|error| HarnessError::Finalize(error.to_string()))?;
        }
        Finalizer::GaussianOrientation => {
            let log = fs::read_to_string(output).map_err(|error| HarnessError::Finalize(error.to_string()))?;
            let atoms = gaussian_geometry(&log)
                .ok_or_else(|| HarnessError::Finalize("no orientation block in log".to_owned()))?;

            fs::write(&artifact, render_xyz(basename, &atoms))
                .map_err(|error| HarnessError::Finalize(error.to_string()))?;

            info!(artifact = ?artifact, atoms = atoms.len(), "Extracted final geometry");
        }
    }

    debug!(directory = ?directory, finalizer = ?finalizer, "Finalized");

    Ok(())
}

#[cfg(test)]
#[path = "finalize_test.rs"]
mod finalize_test;
