//! Process repository: processes and their ordered steps.
//!
//! The stored `processes.status` column is a cached projection of the step
//! statuses. It is only written inside the same transaction as the step
//! change that caused it, via [`refresh_process_status`].

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{encode_json, get_json, get_parsed, now_timestamp, Database, DatabaseError};
use crate::process::state::{
    derive_status, CompletionPolicy, ProcessProgress, ProcessStatus, StepStatus,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRow {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub process_type: String,
    pub status: ProcessStatus,
    pub details: Option<serde_json::Value>,
    pub allow_partial: bool,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ProcessRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            name: row.get("name")?,
            process_type: row.get("type")?,
            status: get_parsed(row, "status")?,
            details: get_json(row, "details")?,
            allow_partial: row.get("allow_partial")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn policy(&self) -> CompletionPolicy {
        CompletionPolicy::from_allow_partial(self.allow_partial)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStepRow {
    pub id: i64,
    pub process_id: i64,
    pub asset_id: i64,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl ProcessStepRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            process_id: row.get("process_id")?,
            asset_id: row.get("asset_id")?,
            status: get_parsed(row, "status")?,
            output: get_json(row, "output")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Fields for creating a process. One PENDING step is created per asset,
/// in the given order.
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub name: String,
    pub process_type: String,
    pub details: Option<serde_json::Value>,
    pub allow_partial: bool,
    pub asset_ids: Vec<i64>,
}

/// Result of a step transition, including the refreshed aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepTransition {
    pub process_id: i64,
    pub step_id: i64,
    pub step_status: StepStatus,
    pub process_status: ProcessStatus,
}

pub fn create_process(
    db: &Database,
    project_id: i64,
    process: &NewProcess,
) -> Result<ProcessRow, DatabaseError> {
    let details = encode_json("details", process.details.as_ref())?;
    db.with_tx(|tx| {
        let now = now_timestamp();
        tx.execute(
            "INSERT INTO processes (project_id, name, type, status, details, allow_partial,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                project_id,
                process.name,
                process.process_type,
                ProcessStatus::Pending.as_str(),
                details,
                process.allow_partial,
                now,
            ],
        )?;
        let process_id = tx.last_insert_rowid();

        for asset_id in &process.asset_ids {
            tx.execute(
                "INSERT INTO process_steps (process_id, asset_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                params![process_id, asset_id, StepStatus::Pending.as_str(), now],
            )?;
        }

        find_process(tx, process_id)?.ok_or(DatabaseError::Sqlite(
            rusqlite::Error::QueryReturnedNoRows,
        ))
    })
}

pub fn get_process(db: &Database, process_id: i64) -> Result<Option<ProcessRow>, DatabaseError> {
    db.with_conn(|conn| find_process(conn, process_id))
}

fn find_process(conn: &Connection, process_id: i64) -> Result<Option<ProcessRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM processes WHERE id = ?1 AND deleted_at IS NULL",
            params![process_id],
            ProcessRow::from_row,
        )
        .optional()?)
}

/// Steps of a process in creation order.
pub fn get_steps(db: &Database, process_id: i64) -> Result<Vec<ProcessStepRow>, DatabaseError> {
    db.with_conn(|conn| find_steps(conn, process_id))
}

fn find_steps(conn: &Connection, process_id: i64) -> Result<Vec<ProcessStepRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM process_steps WHERE process_id = ?1 AND deleted_at IS NULL ORDER BY id",
    )?;
    let rows = stmt
        .query_map(params![process_id], ProcessStepRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A project's processes newest first, each with its completed step count.
///
/// Status and count are derived from the steps like [`get_progress`], so a
/// process that was never advanced lists the same status it reports.
pub fn list_processes(
    db: &Database,
    project_id: i64,
) -> Result<Vec<(ProcessRow, u64)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM processes
             WHERE project_id = ?1 AND deleted_at IS NULL
             ORDER BY id DESC",
        )?;
        let processes = stmt
            .query_map(params![project_id], ProcessRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        processes
            .into_iter()
            .map(|mut process| {
                let steps = find_steps(conn, process.id)?;
                let progress = ProcessProgress::from_steps(
                    process.id,
                    process.status,
                    steps.iter().map(|s| s.status),
                    process.policy(),
                );
                process.status = progress.status;
                Ok((process, progress.completed_step_count))
            })
            .collect()
    })
}

/// Aggregate status and step counts, derived from the steps on every call.
pub fn get_progress(db: &Database, process_id: i64) -> Result<Option<ProcessProgress>, DatabaseError> {
    db.with_conn(|conn| {
        let Some(process) = find_process(conn, process_id)? else {
            return Ok(None);
        };
        let steps = find_steps(conn, process_id)?;
        Ok(Some(ProcessProgress::from_steps(
            process.id,
            process.status,
            steps.iter().map(|s| s.status),
            process.policy(),
        )))
    })
}

/// Moves a step along the lattice and refreshes the process aggregate in the
/// same transaction. Stamps `started_at` on the first step start and
/// `completed_at` when the aggregate becomes terminal.
///
/// Starting a step of a STOPPED process fails with
/// [`DatabaseError::ProcessStopped`]; finishing one that already runs does not.
pub fn transition_step(
    db: &Database,
    step_id: i64,
    to: StepStatus,
    output: Option<&serde_json::Value>,
) -> Result<StepTransition, DatabaseError> {
    let output = encode_json("output", output)?;
    db.with_tx(|tx| {
        let step = tx
            .query_row(
                "SELECT * FROM process_steps WHERE id = ?1 AND deleted_at IS NULL",
                params![step_id],
                ProcessStepRow::from_row,
            )
            .optional()?
            .ok_or(DatabaseError::Sqlite(rusqlite::Error::QueryReturnedNoRows))?;

        if !step.status.can_transition_to(to) {
            return Err(DatabaseError::InvalidTransition {
                step_id,
                from: step.status.as_str(),
                to: to.as_str(),
            });
        }

        if to == StepStatus::InProgress {
            let stopped = find_process(tx, step.process_id)?
                .is_some_and(|p| p.status == ProcessStatus::Stopped);
            if stopped {
                return Err(DatabaseError::ProcessStopped {
                    process_id: step.process_id,
                });
            }
        }

        let now = now_timestamp();
        tx.execute(
            "UPDATE process_steps SET status = ?2, output = ?3, updated_at = ?4 WHERE id = ?1",
            params![step_id, to.as_str(), output, now],
        )?;

        if to == StepStatus::InProgress {
            tx.execute(
                "UPDATE processes SET started_at = COALESCE(started_at, ?2) WHERE id = ?1",
                params![step.process_id, now],
            )?;
        }

        let process_status = refresh_process_status(tx, step.process_id)?;

        Ok(StepTransition {
            process_id: step.process_id,
            step_id,
            step_status: to,
            process_status,
        })
    })
}

/// Recomputes and stores the aggregate status of a process. Only a change
/// is written; a stopped process keeps its status.
fn refresh_process_status(
    conn: &Connection,
    process_id: i64,
) -> Result<ProcessStatus, DatabaseError> {
    let process = find_process(conn, process_id)?
        .ok_or(DatabaseError::Sqlite(rusqlite::Error::QueryReturnedNoRows))?;
    if process.status == ProcessStatus::Stopped {
        return Ok(ProcessStatus::Stopped);
    }

    let steps = find_steps(conn, process_id)?;
    let status = derive_status(steps.iter().map(|s| s.status), process.policy());
    if status == process.status {
        return Ok(status);
    }
    let now = now_timestamp();

    if status.is_terminal() {
        conn.execute(
            "UPDATE processes SET status = ?2, updated_at = ?3,
               completed_at = COALESCE(completed_at, ?3)
             WHERE id = ?1",
            params![process_id, status.as_str(), now],
        )?;
    } else {
        conn.execute(
            "UPDATE processes SET status = ?2, updated_at = ?3, completed_at = NULL
             WHERE id = ?1",
            params![process_id, status.as_str(), now],
        )?;
    }

    Ok(status)
}

/// Re-derives and stores the aggregate status without touching any step.
pub fn sync_process_status(db: &Database, process_id: i64) -> Result<ProcessStatus, DatabaseError> {
    db.with_tx(|tx| refresh_process_status(tx, process_id))
}

/// Live processes that have not reached a terminal status.
pub fn get_all_pending_processes(db: &Database) -> Result<Vec<ProcessRow>, DatabaseError> {
    db.with_conn(|conn| {
        let [pending, in_progress] = ProcessStatus::NON_TERMINAL;
        let mut stmt = conn.prepare(
            "SELECT * FROM processes
             WHERE deleted_at IS NULL AND status IN (?1, ?2)
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map(
                params![pending.as_str(), in_progress.as_str()],
                ProcessRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn count_processes(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM processes", [], |r| r.get(0))?))
}

/// Resets steps left IN_PROGRESS by an interrupted run back to PENDING.
///
/// This is the one move outside the lattice; it is only valid while no
/// worker is executing the process.
pub fn reset_interrupted_steps(db: &Database, process_id: i64) -> Result<usize, DatabaseError> {
    db.with_tx(|tx| {
        let now = now_timestamp();
        let reset = tx.execute(
            "UPDATE process_steps SET status = ?2, updated_at = ?4
             WHERE process_id = ?1 AND status = ?3 AND deleted_at IS NULL",
            params![
                process_id,
                StepStatus::Pending.as_str(),
                StepStatus::InProgress.as_str(),
                now
            ],
        )?;
        if reset > 0 {
            refresh_process_status(tx, process_id)?;
        }
        Ok(reset)
    })
}

/// Puts FAILED steps back to PENDING so the process can be resubmitted.
/// Stopped processes are left alone. Returns the number of steps requeued.
pub fn retry_failed_steps(db: &Database, process_id: i64) -> Result<usize, DatabaseError> {
    db.with_tx(|tx| {
        let Some(process) = find_process(tx, process_id)? else {
            return Ok(0);
        };
        if process.status == ProcessStatus::Stopped {
            return Ok(0);
        }

        let now = now_timestamp();
        let requeued = tx.execute(
            "UPDATE process_steps SET status = ?2, output = NULL, updated_at = ?4
             WHERE process_id = ?1 AND status = ?3 AND deleted_at IS NULL",
            params![
                process_id,
                StepStatus::Pending.as_str(),
                StepStatus::Failed.as_str(),
                now
            ],
        )?;
        if requeued > 0 {
            refresh_process_status(tx, process_id)?;
        }
        Ok(requeued)
    })
}

/// Marks a non-terminal process STOPPED. The runner checks this before
/// starting each pending step.
pub fn stop_process(db: &Database, process_id: i64) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let [pending, in_progress] = ProcessStatus::NON_TERMINAL;
        let now = now_timestamp();
        let updated = conn.execute(
            "UPDATE processes SET status = ?2, updated_at = ?3, completed_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL AND status IN (?4, ?5)",
            params![
                process_id,
                ProcessStatus::Stopped.as_str(),
                now,
                pending.as_str(),
                in_progress.as_str()
            ],
        )?;
        Ok(updated > 0)
    })
}

/// Soft-deletes a process and its steps together.
pub fn soft_delete_process(db: &Database, process_id: i64) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let now = now_timestamp();
        let updated = tx.execute(
            "UPDATE processes SET deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND deleted_at IS NULL",
            params![process_id, now],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE process_steps SET deleted_at = ?2, updated_at = ?2
             WHERE process_id = ?1 AND deleted_at IS NULL",
            params![process_id, now],
        )?;
        Ok(true)
    })
}
