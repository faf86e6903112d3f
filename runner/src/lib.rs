//! Dependency aware orchestration of computational chemistry jobs on a
//! cluster scheduler.
//!
//! A batch definition declares jobs and their coordinate pipes, the
//! [`runner::BatchRunner`] submits them under a concurrency cap, tracks them in
//! a [`ledger::Ledger`] and propagates failures to dependent jobs.

pub mod batch;
pub mod config;
pub mod dependency;
pub mod editor;
pub mod executors;
pub mod harness;
pub mod ingest;
pub mod job;
pub mod ledger;
pub mod quarantine;
pub mod restart;
pub mod run_info;
pub mod runner;

#[cfg(test)]
mod test_util;
