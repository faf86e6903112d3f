use crate::{
    config::ProgramOverride,
    executors::{fake::FakeExecutor, QueueState},
    harness::{latest_log_id, Harness, HarnessError},
    ingest::ParsedOutput,
    job::{JobRecord, Program, Status},
    run_info::RunInfo,
    test_util::{self, orca_job, ORCA_FAILURE, ORCA_SUCCESS, XYZ},
};
use std::{fs, os::unix::fs::PermissionsExt};

fn orca_record(dir: &std::path::Path) -> JobRecord {
    orca_job(dir, "opt");
    JobRecord::new("opt", dir, Program::Orca)
}

#[test]
pub fn submit_records_id() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let mut harness = Harness::new(&orca_record(dir.path()), &test_util::config()).unwrap();

    let id = harness.submit(&executor).unwrap();

    assert_eq!(id, 1001);
    assert_eq!(harness.status(), Status::Pending);
    assert_eq!(executor.submissions(), vec![(dir.path().to_path_buf(), "opt.sh".to_owned(), 1001)]);

    let info = RunInfo::read(dir.path()).unwrap().unwrap();
    assert_eq!(info.status, Status::Pending);
    assert_eq!(info.external_id, 1001);
    assert_eq!(info.ruleset, "builtin:orca");
}

#[test]
pub fn follows_queue_to_success() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let mut harness = Harness::new(&orca_record(dir.path()), &test_util::config()).unwrap();
    let id = harness.submit(&executor).unwrap();

    executor.set_queue(id, QueueState::Running);
    assert_eq!(harness.update_status(&executor).unwrap(), Status::Running);

    // requeued jobs stay running
    executor.set_queue(id, QueueState::Pending);
    assert_eq!(harness.update_status(&executor).unwrap(), Status::Running);

    executor.set_queue(id, QueueState::Absent);
    fs::write(harness.output_path(), ORCA_SUCCESS).unwrap();
    fs::write(dir.path().join("opt.xyz"), XYZ).unwrap();

    assert_eq!(harness.update_status(&executor).unwrap(), Status::Succeeded);
    assert_eq!(RunInfo::status_of(dir.path()), Some(Status::Succeeded));

    let stored = ParsedOutput::read(&ParsedOutput::path_for(dir.path(), "opt")).unwrap();
    assert!(stored.flag("success"));
}

#[test]
pub fn failed_output() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let mut harness = Harness::new(&orca_record(dir.path()), &test_util::config()).unwrap();
    let id = harness.submit(&executor).unwrap();

    executor.set_queue(id, QueueState::Absent);
    fs::write(harness.output_path(), ORCA_FAILURE).unwrap();

    assert_eq!(harness.update_status(&executor).unwrap(), Status::Failed);
}

#[test]
pub fn vanished_output_fails_after_poll_limit() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let mut config = test_util::config();
    config.harness.parse_fail_threshold = 2;
    config.harness.vanished_output_polls = 3;

    let mut harness = Harness::new(&orca_record(dir.path()), &config).unwrap();
    let id = harness.submit(&executor).unwrap();
    executor.set_queue(id, QueueState::Absent);

    // more polls than parse failures allowed, the job is still waited on
    assert_eq!(harness.update_status(&executor).unwrap(), Status::Pending);
    assert_eq!(harness.update_status(&executor).unwrap(), Status::Pending);
    assert_eq!(harness.vanished_polls(), 2);
    assert_eq!(harness.parse_failures(), 0);

    let result = harness.update_status(&executor);
    assert!(matches!(result, Err(HarnessError::OutputNeverAppeared { polls: 3, .. })));

    // the counter is durable
    let info = RunInfo::read(dir.path()).unwrap().unwrap();
    assert_eq!(info.vanished_polls, 3);
}

#[test]
pub fn late_output_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let mut harness = Harness::new(&orca_record(dir.path()), &test_util::config()).unwrap();
    let id = harness.submit(&executor).unwrap();
    executor.set_queue(id, QueueState::Absent);

    for _ in 0..5 {
        assert_eq!(harness.update_status(&executor).unwrap(), Status::Pending);
    }

    fs::write(harness.output_path(), ORCA_SUCCESS).unwrap();
    fs::write(dir.path().join("opt.xyz"), XYZ).unwrap();

    assert_eq!(harness.update_status(&executor).unwrap(), Status::Succeeded);
}

#[test]
pub fn unparseable_output_exhausts_parse_failures() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let parser = dir.path().join("parser.sh");
    fs::write(&parser, "#!/bin/sh
echo garbled >&2
exit 1
").unwrap();
    fs::set_permissions(&parser, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = test_util::config();
    config.harness.parse_fail_threshold = 2;
    config.programs.insert(
        Program::Orca,
        ProgramOverride {
            parser: Some(parser),
            ..ProgramOverride::default()
        },
    );

    let mut harness = Harness::new(&orca_record(dir.path()), &config).unwrap();
    let id = harness.submit(&executor).unwrap();
    executor.set_queue(id, QueueState::Absent);
    fs::write(harness.output_path(), ORCA_SUCCESS).unwrap();

    assert_eq!(harness.update_status(&executor).unwrap(), Status::Pending);
    assert_eq!(harness.parse_failures(), 1);

    let result = harness.update_status(&executor);
    assert!(matches!(result, Err(HarnessError::ParseFailureExceeded { failures: 2, .. })));
    assert_eq!(RunInfo::read(dir.path()).unwrap().unwrap().parse_failures, 2);
}

#[test]
pub fn tolerates_unreachable_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let mut harness = Harness::new(&orca_record(dir.path()), &test_util::config()).unwrap();
    let id = harness.submit(&executor).unwrap();
    executor.set_queue(id, QueueState::Running);

    // retried within the tick
    executor.fail_next_queries(2);
    assert_eq!(harness.update_status(&executor).unwrap(), Status::Running);

    executor.set_queue(id, QueueState::Absent);
    executor.fail_next_queries(3);
    assert_eq!(harness.update_status(&executor).unwrap(), Status::Running);
    assert_eq!(harness.parse_failures(), 0);
}

#[test]
pub fn existing_output_is_not_resubmitted() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let record = orca_record(dir.path());
    fs::write(dir.path().join("opt.out"), ORCA_SUCCESS).unwrap();
    fs::write(dir.path().join("opt.xyz"), XYZ).unwrap();

    let mut harness = Harness::new(&record, &test_util::config()).unwrap();

    assert!(harness.resume_existing(&executor).unwrap());
    assert_eq!(harness.status(), Status::Succeeded);
    assert!(executor.submissions().is_empty());
}

#[test]
pub fn fresh_job_is_submitted() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let mut harness = Harness::new(&orca_record(dir.path()), &test_util::config()).unwrap();

    assert!(!harness.resume_existing(&executor).unwrap());
    assert_eq!(harness.status(), Status::NotStarted);
}

#[test]
pub fn restores_from_run_info() {
    let dir = tempfile::tempdir().unwrap();
    let executor = FakeExecutor::new();
    let record = orca_record(dir.path());
    RunInfo {
        basename: "opt".to_owned(),
        program: Program::Orca,
        status: Status::Running,
        external_id: 77,
        ruleset: "builtin:orca".to_owned(),
        parse_failures: 2,
        vanished_polls: 0,
        host: None,
    }
    .write(dir.path())
    .unwrap();

    let mut harness = Harness::new(&record, &test_util::config()).unwrap();

    assert_eq!(harness.status(), Status::Running);
    assert_eq!(harness.external_id(), Some(77));
    assert_eq!(harness.parse_failures(), 2);

    // the crashed process had submitted already
    executor.set_queue(77, QueueState::Running);
    assert!(harness.resume_existing(&executor).unwrap());
    assert!(executor.submissions().is_empty());
}

#[test]
pub fn run_info_of_other_job_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let record = orca_record(dir.path());
    RunInfo {
        basename: "other".to_owned(),
        program: Program::Orca,
        status: Status::Running,
        external_id: 77,
        ruleset: "builtin:orca".to_owned(),
        parse_failures: 5,
        vanished_polls: 0,
        host: None,
    }
    .write(dir.path())
    .unwrap();

    let harness = Harness::new(&record, &test_util::config()).unwrap();

    assert_eq!(harness.status(), Status::NotStarted);
    assert_eq!(harness.external_id(), None);
    assert_eq!(harness.parse_failures(), 0);
}

#[test]
pub fn recovers_id_from_scheduler_logs() {
    let dir = tempfile::tempdir().unwrap();
    let mut record = orca_record(dir.path());
    record.status = Status::Pending;
    fs::write(dir.path().join("slurm-123.out"), "").unwrap();
    fs::write(dir.path().join("slurm-456.out"), "").unwrap();

    let harness = Harness::new(&record, &test_util::config()).unwrap();

    assert_eq!(harness.external_id(), Some(456));
}

#[test]
pub fn log_ids() {
    let dir = tempfile::tempdir().unwrap();
    assert_eq!(latest_log_id(dir.path(), "slurm-*.out"), None);

    fs::write(dir.path().join("slurm-9.out"), "").unwrap();
    fs::write(dir.path().join("slurm-10.out"), "").unwrap();
    fs::write(dir.path().join("opt-99.out"), "").unwrap();

    assert_eq!(latest_log_id(dir.path(), "slurm-*.out"), Some(10));
}
