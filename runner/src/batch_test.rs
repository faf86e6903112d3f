use crate::{
    batch::{parse_pipe, Batch, BatchError},
    job::{Program, Status},
};
use std::path::{Path, PathBuf};

const BATCH: &str = "\
root=/runs/benzene
job_basename|job_directory|program|pipe
crest|conformers|crest|
opt|dft/opt|orca|coords{../../conformers,crest_best.xyz}
freq|dft/freq|gaussian|coords{../opt,}
";

#[test]
pub fn parse() {
    let batch = Batch::parse(BATCH).unwrap();
    let records = batch.ledger.records();

    assert_eq!(batch.root, PathBuf::from("/runs/benzene"));
    assert_eq!(records.len(), 3);

    assert_eq!(records[0].basename, "crest");
    assert_eq!(records[0].directory, Path::new("/runs/benzene/conformers"));
    assert_eq!(records[0].program, Program::Crest);
    assert_eq!(records[0].dependency, None);
    assert_eq!(records[0].status, Status::NotStarted);
    assert_eq!(records[0].external_id, None);

    let opt = records[1].dependency.as_ref().unwrap();
    assert_eq!(opt.directory, Path::new("/runs/benzene/conformers"));
    assert_eq!(opt.artifact, "crest_best.xyz");

    // empty artifact defaults to the upstream directory name
    let freq = records[2].dependency.as_ref().unwrap();
    assert_eq!(freq.directory, Path::new("/runs/benzene/dft/opt"));
    assert_eq!(freq.artifact, "opt.xyz");
}

#[test]
pub fn pipe_column_optional() {
    let batch = Batch::parse("root = /runs\nprogram|job_basename|job_directory\nXTB|sp|a\n").unwrap();

    assert_eq!(batch.root, PathBuf::from("/runs"));
    assert_eq!(batch.ledger.records()[0].program, Program::Xtb);
}

#[test]
pub fn pipes() {
    assert_eq!(
        parse_pipe("coords{../opt,geom.xyz}"),
        Ok(("../opt".to_owned(), "geom.xyz".to_owned()))
    );
    assert_eq!(
        parse_pipe(" coords{ ../opt , } "),
        Ok(("../opt".to_owned(), "opt.xyz".to_owned()))
    );
    assert!(parse_pipe("energy{../opt,}").is_err());
    assert!(parse_pipe("coords(../opt)").is_err());
}

#[test]
pub fn malformed() {
    assert!(matches!(
        Batch::parse("job_basename|job_directory|program\n"),
        Err(BatchError::Malformed { line: 1, .. })
    ));
    assert!(matches!(
        Batch::parse("root=/runs\njob_basename|program\nopt|orca\n"),
        Err(BatchError::Malformed { line: 2, .. })
    ));
    assert!(matches!(
        Batch::parse("root=/runs\njob_basename|job_directory|program\nopt|a|molpro\n"),
        Err(BatchError::Malformed { line: 3, .. })
    ));
    assert!(matches!(
        Batch::parse("root=/runs\njob_basename|job_directory|program|pipe\nopt|a|orca|coords[b]\n"),
        Err(BatchError::Malformed { line: 3, .. })
    ));
}

#[test]
pub fn duplicate_identity() {
    let result = Batch::parse("root=/runs\njob_basename|job_directory|program\nopt|a|orca\nopt|./a|gaussian\n");

    assert!(matches!(result, Err(BatchError::DuplicateIdentity(_))));
}

#[test]
pub fn missing_file() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        Batch::load(&dir.path().join("batch.txt")),
        Err(BatchError::NotFound(_))
    ));
}
