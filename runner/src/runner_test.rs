use crate::{
    executors::{fake::FakeExecutor, AccountingState, QueueState},
    job::{JobRecord, Program, Status},
    ledger::Ledger,
    runner::BatchRunner,
    test_util::{self, orca_job, succeeded_orca, ORCA_FAILURE, ORCA_SUCCESS, XYZ},
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// ORCA job `<root>/<name>/<name>.inp`, optionally consuming the geometry of `upstream`
fn job(root: &Path, name: &str, upstream: Option<&str>) -> JobRecord {
    let directory = root.join(name);
    orca_job(&directory, name);

    let record = JobRecord::new(name, &directory, Program::Orca);
    match upstream {
        Some(upstream) => record.with_dependency(root.join(upstream), format!("{upstream}.xyz")),
        None => record,
    }
}

fn runner(root: &Path, records: Vec<JobRecord>) -> BatchRunner<FakeExecutor> {
    BatchRunner::new(
        test_util::config(),
        FakeExecutor::new(),
        root,
        Ledger::new(records).unwrap(),
        root.join("__ledger__.csv"),
    )
    .unwrap()
}

fn status(runner: &BatchRunner<FakeExecutor>, record: &JobRecord) -> Status {
    runner.ledger().get(&record.key()).unwrap().status
}

/// Let the scheduler forget `record` and leave `output` behind
fn complete(runner: &BatchRunner<FakeExecutor>, record: &JobRecord, output: &str) {
    let id = runner.executor().id_for(&record.directory).unwrap();
    runner.executor().set_queue(id, QueueState::Absent);
    fs::write(record.file(".out"), output).unwrap();
    fs::write(record.file(".xyz"), XYZ).unwrap();
}

#[test]
pub fn chain_runs_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = job(dir.path(), "a", None);
    let b = job(dir.path(), "b", Some("a"));
    let mut runner = runner(dir.path(), vec![a.clone(), b.clone()]);

    let summary = runner.tick().unwrap();
    assert_eq!(summary.submitted, 1);
    assert_eq!(status(&runner, &a), Status::Pending);
    assert_eq!(status(&runner, &b), Status::NotStarted);
    assert!(!runner.is_done());

    runner.executor().set_queue(1001, QueueState::Running);
    runner.tick().unwrap();
    assert_eq!(status(&runner, &a), Status::Running);
    assert_eq!(runner.executor().submissions().len(), 1);

    complete(&runner, &a, ORCA_SUCCESS);
    let summary = runner.tick().unwrap();
    assert_eq!(summary.finished, 1);
    assert_eq!(summary.submitted, 1);
    assert_eq!(status(&runner, &a), Status::Succeeded);
    assert_eq!(status(&runner, &b), Status::Pending);

    // the artifact is copied next to the consumer and referenced by its input
    assert!(b.directory.join("a.xyz").is_file());
    let input = fs::read_to_string(b.file(".inp")).unwrap();
    assert!(input.contains("* xyzfile 0 1 a.xyz"));

    complete(&runner, &b, ORCA_SUCCESS);
    runner.tick().unwrap();
    assert_eq!(status(&runner, &b), Status::Succeeded);
    assert!(runner.is_done());
    assert_eq!(runner.active_harnesses(), 0);

    let persisted = Ledger::load(&dir.path().join("__ledger__.csv")).unwrap();
    assert_eq!(persisted.records(), runner.ledger().records());
}

#[test]
pub fn failure_breaks_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let a = job(dir.path(), "a", None);
    let b = job(dir.path(), "b", Some("a"));
    let c = job(dir.path(), "c", Some("b"));
    let mut runner = runner(dir.path(), vec![a.clone(), b.clone(), c.clone()]);

    runner.tick().unwrap();
    complete(&runner, &a, ORCA_FAILURE);

    let summary = runner.tick().unwrap();
    assert_eq!(status(&runner, &a), Status::Failed);
    assert_eq!(summary.broken, 1);
    assert_eq!(status(&runner, &b), Status::BrokenDependency);
    assert_eq!(status(&runner, &c), Status::NotStarted);
    assert!(!runner.is_done());

    // one hop per tick
    runner.tick().unwrap();
    assert_eq!(status(&runner, &c), Status::BrokenDependency);
    assert!(runner.is_done());
    assert_eq!(runner.executor().submissions().len(), 1);

    // the failed attempt is kept in the quarantine
    let snapshot = dir.path().join("fail_output").join("a");
    assert!(snapshot.join("a.out").is_file());
}

#[test]
pub fn run_stops_when_nothing_can_progress() {
    let dir = tempfile::tempdir().unwrap();
    let a = job(dir.path(), "a", None);
    let b = job(dir.path(), "b", Some("a"));
    fs::write(a.file(".out"), ORCA_FAILURE).unwrap();
    let mut runner = runner(dir.path(), vec![a.clone(), b.clone()]);

    runner.run().unwrap();

    // the existing output is interpreted instead of submitted
    assert!(runner.executor().submissions().is_empty());
    assert_eq!(status(&runner, &a), Status::Failed);
    assert_eq!(status(&runner, &b), Status::BrokenDependency);
    assert_eq!(runner.ticks(), 2);
}

#[test]
pub fn finished_job_is_not_resubmitted() {
    let dir = tempfile::tempdir().unwrap();
    let a = job(dir.path(), "a", None);
    succeeded_orca(&a.directory, "a");
    let mut runner = runner(dir.path(), vec![a.clone()]);

    runner.tick().unwrap();

    assert_eq!(status(&runner, &a), Status::Succeeded);
    assert_eq!(runner.ledger().get(&a.key()).unwrap().external_id, Some(42));
    assert!(runner.executor().submissions().is_empty());
    assert!(runner.is_done());
}

#[test]
pub fn respects_concurrency_cap() {
    let dir = tempfile::tempdir().unwrap();
    let records: Vec<JobRecord> = ["a", "b", "c"]
        .into_iter()
        .map(|name| job(dir.path(), name, None))
        .collect();
    let mut runner = runner(dir.path(), records.clone());

    let summary = runner.tick().unwrap();
    assert_eq!(summary.submitted, 2);
    assert_eq!(runner.ledger().active_count(), 2);
    assert_eq!(status(&runner, &records[2]), Status::NotStarted);

    runner.tick().unwrap();
    assert_eq!(runner.executor().submissions().len(), 2);

    complete(&runner, &records[0], ORCA_SUCCESS);
    runner.tick().unwrap();
    assert_eq!(status(&runner, &records[0]), Status::Succeeded);
    assert_eq!(status(&runner, &records[2]), Status::Pending);
    assert_eq!(runner.ledger().active_count(), 2);
}

#[test]
pub fn survives_unreachable_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let a = job(dir.path(), "a", None);
    let mut runner = runner(dir.path(), vec![a.clone()]);

    runner.tick().unwrap();
    runner.executor().fail_next_queries(10);

    for _ in 0..3 {
        runner.tick().unwrap();
        assert_eq!(status(&runner, &a), Status::Pending);
    }
    assert_eq!(runner.executor().submissions().len(), 1);
}

#[test]
pub fn rejected_submission_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let a = job(dir.path(), "a", None);
    let b = job(dir.path(), "b", None);
    let mut runner = runner(dir.path(), vec![a.clone(), b.clone()]);
    runner.executor().reject(&a.directory);

    let summary = runner.tick().unwrap();

    assert_eq!(status(&runner, &a), Status::Failed);
    assert_eq!(status(&runner, &b), Status::Pending);
    assert_eq!(summary.submitted, 1);
    assert!(dir.path().join("fail_output").join("a").is_dir());
}

#[test]
pub fn unsatisfiable_dependency_is_stuck() {
    let dir = tempfile::tempdir().unwrap();
    let b = job(dir.path(), "b", Some("elsewhere"));
    let mut runner = runner(dir.path(), vec![b.clone()]);

    assert_eq!(runner.stuck(), vec![b.key()]);
    assert!(runner.is_done());

    runner.run().unwrap();
    assert_eq!(runner.ticks(), 1);
    assert_eq!(status(&runner, &b), Status::NotStarted);
}

#[test]
pub fn automatic_restart_requeues() {
    let dir = tempfile::tempdir().unwrap();
    let a = job(dir.path(), "a", None);
    let b = job(dir.path(), "b", Some("a"));

    let mut config = test_util::config();
    config.restart.automatic = true;
    let mut runner = BatchRunner::new(
        config,
        FakeExecutor::new(),
        dir.path(),
        Ledger::new(vec![a.clone(), b.clone()]).unwrap(),
        dir.path().join("__ledger__.csv"),
    )
    .unwrap();

    runner.tick().unwrap();
    runner.executor().set_accounting(1001, AccountingState::Timeout);
    complete(&runner, &a, ORCA_FAILURE);

    runner.tick().unwrap();

    assert_eq!(status(&runner, &a), Status::Pending);
    assert_eq!(status(&runner, &b), Status::NotStarted);
    assert_eq!(runner.executor().submissions_in(&a.directory), 2);
    assert_eq!(runner.ledger().get(&a.key()).unwrap().external_id, Some(1002));

    assert!(dir.path().join("a_history_0").join("a.out").is_file());
    assert!(dir.path().join("fail_output").join("a").join("a.out").is_file());
    let script = fs::read_to_string(a.file(".sh")).unwrap();
    assert!(script.contains("--time=2-00:00:00"));
}

fn write_batch(root: &Path) -> PathBuf {
    orca_job(&root.join("a"), "a");
    orca_job(&root.join("b"), "b");

    let path = root.join("batch.txt");
    fs::write(
        &path,
        format!(
            "root={}\njob_basename|job_directory|program|pipe\na|a|orca|\nb|b|orca|coords{{../a,}}\n",
            root.to_string_lossy()
        ),
    )
    .unwrap();

    path
}

#[test]
pub fn resumes_from_previous_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let batch = write_batch(dir.path());

    let runner = BatchRunner::from_batch(&batch, test_util::config(), FakeExecutor::new(), false).unwrap();
    assert_eq!(runner.ledger().len(), 2);
    assert!(runner
        .ledger()
        .records()
        .iter()
        .all(|record| record.status == Status::NotStarted));

    let mut previous = runner.ledger().clone();
    let a = previous.records()[0].key();
    previous.get_mut(&a).unwrap().status = Status::Running;
    previous.get_mut(&a).unwrap().external_id = Some(77);
    previous.persist(&dir.path().join("__ledger__.csv")).unwrap();

    let resumed = BatchRunner::from_batch(&batch, test_util::config(), FakeExecutor::new(), false).unwrap();
    let record = resumed.ledger().get(&a).unwrap();
    assert_eq!(record.status, Status::Running);
    assert_eq!(record.external_id, Some(77));
    assert_eq!(resumed.ledger().records()[1].dependency.as_ref().unwrap().artifact, "a.xyz");

    let fresh = BatchRunner::from_batch(&batch, test_util::config(), FakeExecutor::new(), true).unwrap();
    assert_eq!(fresh.ledger().get(&a).unwrap().status, Status::NotStarted);
}
