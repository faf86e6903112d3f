use crate::harness::{
    finalize::{self, element, gaussian_geometry, render_xyz},
    policy::Finalizer,
    HarnessError,
};
use std::fs;

const LOG: &str = "\
 Entering Gaussian System
                         Standard orientation:
 ---------------------------------------------------------------------
 Center     Atomic      Atomic             Coordinates (Angstroms)
 Number     Number       Type             X           Y           Z
 ---------------------------------------------------------------------
      1          8           0        0.000000    0.000000    0.200000
      2          1           0        0.000000    0.800000   -0.500000
      3          1           0        0.000000   -0.800000   -0.500000
 ---------------------------------------------------------------------
 Optimization completed.
                         Standard orientation:
 ---------------------------------------------------------------------
 Center     Atomic      Atomic             Coordinates (Angstroms)
 Number     Number       Type             X           Y           Z
 ---------------------------------------------------------------------
      1          8           0        0.000000    0.000000    0.117300
      2          1           0        0.000000    0.757200   -0.469200
      3          1           0        0.000000   -0.757200   -0.469200
 ---------------------------------------------------------------------
 Normal termination of Gaussian 16
";

#[test]
pub fn element_symbols() {
    assert_eq!(element(1), Some("H"));
    assert_eq!(element(8), Some("O"));
    assert_eq!(element(86), Some("Rn"));
    assert_eq!(element(0), None);
    assert_eq!(element(87), None);
}

#[test]
pub fn last_orientation_wins() {
    let atoms = gaussian_geometry(LOG).unwrap();

    assert_eq!(atoms.len(), 3);
    assert_eq!(atoms[0], ("O".to_owned(), [0.0, 0.0, 0.1173]));
    assert_eq!(atoms[2], ("H".to_owned(), [0.0, -0.7572, -0.4692]));
}

#[test]
pub fn input_orientation_fallback() {
    let log = LOG.replace("Standard orientation:", "Input orientation:");

    assert_eq!(gaussian_geometry(&log).unwrap().len(), 3);
    assert!(gaussian_geometry("Normal termination of Gaussian 16\n").is_none());
}

#[test]
pub fn xyz_rendering() {
    let rendered = render_xyz("water", &[("O".to_owned(), [0.0, 0.0, 0.1173])]);

    assert_eq!(rendered, "1\nwater\nO        0.00000000       0.00000000       0.11730000\n");
}

#[test]
pub fn gaussian_orientation_writes_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("opt.log");
    fs::write(&log, LOG).unwrap();

    finalize::run(Finalizer::GaussianOrientation, dir.path(), "opt", &log).unwrap();

    let xyz = fs::read_to_string(dir.path().join("opt.xyz")).unwrap();
    assert!(xyz.starts_with("3\nopt\nO "));
    assert_eq!(xyz.lines().count(), 5);
}

#[test]
pub fn copy_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("conf.out");

    let missing = finalize::run(Finalizer::CopyGeometry("crest_best.xyz"), dir.path(), "conf", &output);
    assert!(matches!(missing, Err(HarnessError::Finalize(_))));

    fs::write(dir.path().join("crest_best.xyz"), "1\nbest\nC 0 0 0\n").unwrap();
    finalize::run(Finalizer::CopyGeometry("crest_best.xyz"), dir.path(), "conf", &output).unwrap();

    assert_eq!(fs::read_to_string(dir.path().join("conf.xyz")).unwrap(), "1\nbest\nC 0 0 0\n");
}

#[test]
pub fn own_geometry_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("opt.out");

    assert!(finalize::run(Finalizer::OwnGeometry, dir.path(), "opt", &output).is_err());

    fs::write(dir.path().join("opt.xyz"), "").unwrap();
    assert!(finalize::run(Finalizer::OwnGeometry, dir.path(), "opt", &output).is_ok());
    assert!(finalize::run(Finalizer::None, dir.path(), "other", &output).is_ok());
}
