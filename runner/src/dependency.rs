//! Dependency resolution over ledger rows.
//!
//! Nothing here is cached: the runner recomputes both predicates on every tick.
//! Breakage therefore travels one dependency hop per tick, a chain of depth `n`
//! is fully flagged after `n` ticks, i.e. `n * tick_interval`.

use crate::{
    job::{JobRecord, Status},
    ledger::Ledger,
    run_info::RunInfo,
};
use tracing::trace;

/// True if no dependency is declared, otherwise iff the upstream's own run info
/// says `succeeded` and the declared artifact exists in its directory. Reading
/// the run info instead of the ledger tolerates a ledger that lags behind.
pub fn satisfied(record: &JobRecord) -> bool {
    let Some(ref dependency) = record.dependency else {
        return true;
    };

    let upstream_succeeded = RunInfo::status_of(&dependency.directory) == Some(Status::Succeeded);
    let artifact_exists = dependency.artifact_path().is_file();

    trace!(
        job = %record.key(),
        upstream_succeeded,
        artifact_exists,
        "Checked dependency"
    );

    upstream_succeeded && artifact_exists
}

/// True iff a dependency is declared and an upstream row in the ledger is
/// `failed`, `permanently_failed` or itself `broken_dependency`.
pub fn broken(record: &JobRecord, ledger: &Ledger) -> bool {
    let Some(ref dependency) = record.dependency else {
        return false;
    };

    ledger
        .in_directory(&dependency.directory)
        .any(|upstream| upstream.status.breaks_dependents())
}

/// True if the row waits on something that can still change: its upstream is
/// known to the ledger and not yet terminal.
pub fn waiting(record: &JobRecord, ledger: &Ledger) -> bool {
    let Some(ref dependency) = record.dependency else {
        return false;
    };

    ledger
        .in_directory(&dependency.directory)
        .any(|upstream| !upstream.status.is_terminal())
}

#[cfg(test)]
#[path = "dependency_test.rs"]
mod dependency_test;
