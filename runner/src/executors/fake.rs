//! Scriptable stand-in for the cluster scheduler

use super::{AccountingState, Executor, ExecutorError, QueueState};
use crate::job::ExternalId;
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    path::{Path, PathBuf},
};

#[derive(Debug, Default)]
struct State {
    next_id: ExternalId,
    submissions: Vec<(PathBuf, String, ExternalId)>,
    queue: BTreeMap<ExternalId, QueueState>,
    accounting: BTreeMap<ExternalId, AccountingState>,
    /// errors returned by the next queries, before consulting `queue`
    query_errors: VecDeque<String>,
    rejected: Vec<PathBuf>,
}

#[derive(Debug)]
pub struct FakeExecutor {
    state: RefCell<State>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(State {
                next_id: 1000,
                ..State::default()
            }),
        }
    }

    pub fn set_queue(&self, id: ExternalId, state: QueueState) {
        self.state.borrow_mut().queue.insert(id, state);
    }

    pub fn set_accounting(&self, id: ExternalId, state: AccountingState) {
        self.state.borrow_mut().accounting.insert(id, state);
    }

    pub fn fail_next_queries(&self, count: usize) {
        let mut state = self.state.borrow_mut();
        for _ in 0..count {
            state.query_errors.push_back("slurm_load_jobs error: Socket timed out".to_owned());
        }
    }

    pub fn reject(&self, directory: &Path) {
        self.state.borrow_mut().rejected.push(directory.to_path_buf());
    }

    pub fn submissions(&self) -> Vec<(PathBuf, String, ExternalId)> {
        self.state.borrow().submissions.clone()
    }

    pub fn submissions_in(&self, directory: &Path) -> usize {
        self.state
            .borrow()
            .submissions
            .iter()
            .filter(|(submitted, _, _)| submitted == directory)
            .count()
    }

    pub fn id_for(&self, directory: &Path) -> Option<ExternalId> {
        self.state
            .borrow()
            .submissions
            .iter()
            .rev()
            .find(|(submitted, _, _)| submitted == directory)
            .map(|(_, _, id)| *id)
    }
}

impl Executor for FakeExecutor {
    fn submit(&self, directory: &Path, script: &str) -> Result<ExternalId, ExecutorError> {
        let mut state = self.state.borrow_mut();

        if state.rejected.iter().any(|rejected| rejected == directory) {
            return Err(ExecutorError::Submission {
                directory: directory.to_string_lossy().into_owned(),
                output: "sbatch: error: Batch job submission failed".to_owned(),
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state
            .submissions
            .push((directory.to_path_buf(), script.to_owned(), id));
        state.queue.insert(id, QueueState::Pending);

        Ok(id)
    }

    fn query(&self, id: ExternalId) -> Result<QueueState, ExecutorError> {
        let mut state = self.state.borrow_mut();

        if let Some(error) = state.query_errors.pop_front() {
            return Err(ExecutorError::Transient(error));
        }

        Ok(state.queue.get(&id).cloned().unwrap_or(QueueState::Absent))
    }

    fn account(&self, id: ExternalId) -> Result<AccountingState, ExecutorError> {
        Ok(self
            .state
            .borrow()
            .accounting
            .get(&id)
            .cloned()
            .unwrap_or(AccountingState::Unknown))
    }
}
