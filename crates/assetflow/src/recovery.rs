//! Startup recovery: re-primes both pipelines from persisted state.
//!
//! Runs once, before the engine accepts requests. Every project, asset and
//! process is handled on its own; a failure is logged and counted and the
//! pass moves on.

use log::{error, info, warn};
use serde::Serialize;

use crate::db::{process_repo, project_repo, Database};
use crate::error::WorkerError;

/// Where recovered work is sent.
pub trait RecoverySink {
    fn submit_extraction(&self, asset_id: i64) -> Result<(), WorkerError>;
    fn submit_process(&self, process_id: i64) -> Result<(), WorkerError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Placeholder content rows created for assets that had none.
    pub placeholders_created: usize,
    pub assets_resubmitted: usize,
    pub processes_resubmitted: usize,
    /// Items skipped because of an error.
    pub failures: usize,
}

pub fn run_startup_recovery(db: &Database, sink: &dyn RecoverySink) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    recover_content(db, sink, &mut report);
    recover_processes(db, sink, &mut report);

    info!(
        "Startup recovery: {} placeholder(s), {} asset(s) and {} process(es) resubmitted, {} failure(s)",
        report.placeholders_created,
        report.assets_resubmitted,
        report.processes_resubmitted,
        report.failures
    );
    report
}

fn recover_content(db: &Database, sink: &dyn RecoverySink, report: &mut RecoveryReport) {
    // An empty content table means a fresh database; nothing to backfill.
    match project_repo::count_asset_contents(db) {
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            error!("Content recovery skipped, cannot count content rows: {}", e);
            report.failures += 1;
            return;
        }
    }

    let projects = match project_repo::get_all_projects(db) {
        Ok(projects) => projects,
        Err(e) => {
            error!("Content recovery skipped, cannot list projects: {}", e);
            report.failures += 1;
            return;
        }
    };

    for project in projects {
        match project_repo::get_assets_without_content(db, project.id) {
            Ok(assets) => {
                for asset in assets {
                    match project_repo::add_asset_content(db, asset.id, None) {
                        Ok(()) => report.placeholders_created += 1,
                        Err(e) => {
                            warn!("Failed to create placeholder for asset {}: {}", asset.id, e);
                            report.failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Failed to list assets of project {}: {}", project.id, e);
                report.failures += 1;
            }
        }

        let incomplete = match project_repo::get_assets_content_incomplete(db, project.id) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to list incomplete content of project {}: {}", project.id, e);
                report.failures += 1;
                continue;
            }
        };

        for row in incomplete {
            match sink.submit_extraction(row.asset_id) {
                Ok(()) => report.assets_resubmitted += 1,
                Err(e) => {
                    warn!("Failed to resubmit asset {}: {}", row.asset_id, e);
                    report.failures += 1;
                }
            }
        }
    }
}

fn recover_processes(db: &Database, sink: &dyn RecoverySink, report: &mut RecoveryReport) {
    match process_repo::count_processes(db) {
        Ok(0) => return,
        Ok(_) => {}
        Err(e) => {
            error!("Process recovery skipped, cannot count processes: {}", e);
            report.failures += 1;
            return;
        }
    }

    let processes = match process_repo::get_all_pending_processes(db) {
        Ok(processes) => processes,
        Err(e) => {
            error!("Process recovery skipped, cannot list pending processes: {}", e);
            report.failures += 1;
            return;
        }
    };

    for process in processes {
        match sink.submit_process(process.id) {
            Ok(()) => report.processes_resubmitted += 1,
            Err(e) => {
                warn!("Failed to resubmit process {}: {}", process.id, e);
                report.failures += 1;
            }
        }
    }
}
