//! Advances a process through its pending steps.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

use serde_json::json;
use tracing::{debug, error, info, info_span, warn};

use crate::broadcast::{ProgressBroadcaster, ProgressEvent};
use crate::db::process_repo::{self, ProcessRow, ProcessStepRow};
use crate::db::{Database, DatabaseError};
use crate::error::{AssetflowError, Result, StepError};
use crate::process::state::{CompletionPolicy, ProcessStatus, StepStatus};
use crate::process::step::{HandlerRegistry, StepContext, StepHandler};
use crate::worker::pool::panic_message;
use crate::worker::JobHandler;

/// What a call to [`ProcessRunner::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Steps were advanced; carries the status the process ended in.
    Advanced(ProcessStatus),
    /// The process was already terminal.
    AlreadyTerminal(ProcessStatus),
    /// Another worker is advancing the process right now.
    AlreadyRunning,
}

pub struct ProcessRunner {
    db: Database,
    handlers: HandlerRegistry,
    progress: ProgressBroadcaster,
    /// Processes being advanced, with a flag set when the process was
    /// resubmitted during the run.
    in_flight: Mutex<HashMap<i64, bool>>,
}

/// Removes the process from the in-flight set unless already released.
struct InFlight<'a> {
    runner: &'a ProcessRunner,
    process_id: i64,
    released: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.runner.in_flight().remove(&self.process_id);
        }
    }
}

impl ProcessRunner {
    pub fn new(db: Database, handlers: HandlerRegistry, progress: ProgressBroadcaster) -> Self {
        Self {
            db,
            handlers,
            progress,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<i64, bool>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| {
            warn!("In-flight process set was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Claims the process for this worker. If another worker holds it, asks
    /// that worker for one more pass instead.
    fn claim(&self, process_id: i64) -> Option<InFlight<'_>> {
        match self.in_flight().entry(process_id) {
            Entry::Occupied(mut entry) => {
                entry.insert(true);
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(false);
                Some(InFlight {
                    runner: self,
                    process_id,
                    released: false,
                })
            }
        }
    }

    /// Releases the claim, unless a rerun was requested meanwhile.
    fn release_or_rerun(&self, claim: &mut InFlight<'_>) -> bool {
        let mut in_flight = self.in_flight();
        if in_flight.get(&claim.process_id).copied().unwrap_or(false) {
            in_flight.insert(claim.process_id, false);
            true
        } else {
            in_flight.remove(&claim.process_id);
            claim.released = true;
            false
        }
    }

    pub fn is_running(&self, process_id: i64) -> bool {
        self.in_flight().contains_key(&process_id)
    }

    /// Runs every pending step of the process in creation order.
    ///
    /// Before each step the stored status is re-read: a STOPPED process, or
    /// a FAILED one under fail-fast, is not advanced any further. A stop that
    /// lands after that read is still caught when the step is started. A process
    /// submitted again while it runs gets one more pass from the same worker.
    pub fn run(&self, process_id: i64) -> Result<RunOutcome> {
        let _span = info_span!("process", process_id).entered();

        let Some(mut claim) = self.claim(process_id) else {
            debug!("Process {} is already being advanced", process_id);
            return Ok(RunOutcome::AlreadyRunning);
        };

        let mut outcome = self.advance(process_id)?;
        while self.release_or_rerun(&mut claim) {
            debug!("Process {} was resubmitted while running, advancing again", process_id);
            outcome = self.advance(process_id)?;
        }
        Ok(outcome)
    }

    fn advance(&self, process_id: i64) -> Result<RunOutcome> {
        let process = self.load(process_id)?;
        if process.status.is_terminal() {
            debug!(
                "Process {} is already {}, nothing to do",
                process_id, process.status
            );
            return Ok(RunOutcome::AlreadyTerminal(process.status));
        }

        let reset = process_repo::reset_interrupted_steps(&self.db, process_id)?;
        if reset > 0 {
            info!(
                "Reset {} interrupted step(s) of process {}",
                reset, process_id
            );
        }

        let handler = self.handlers.get(&process.process_type);
        if handler.is_none() {
            warn!(
                "No handler for process type '{}', failing steps of process {}",
                process.process_type, process_id
            );
        }

        let steps = process_repo::get_steps(&self.db, process_id)?;
        for step in steps.iter().filter(|s| s.status == StepStatus::Pending) {
            let Some(current) = process_repo::get_process(&self.db, process_id)? else {
                info!("Process {} was deleted, stopping", process_id);
                break;
            };
            if should_stop(&current) {
                info!(
                    "Process {} is {}, not starting further steps",
                    process_id, current.status
                );
                break;
            }

            match self.run_step(&current, step, handler.as_deref()) {
                Ok(()) => {}
                Err(AssetflowError::Database(DatabaseError::ProcessStopped { .. })) => {
                    info!("Process {} was stopped, not starting step {}", process_id, step.id);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let status = process_repo::sync_process_status(&self.db, process_id)?;
        // STOPPED is announced by whoever stopped the process.
        if status.is_terminal() && status != ProcessStatus::Stopped {
            info!("Process {} finished as {}", process_id, status);
            self.progress
                .send(ProgressEvent::process_finished(process_id, status));
        }

        Ok(RunOutcome::Advanced(status))
    }

    fn load(&self, process_id: i64) -> Result<ProcessRow> {
        process_repo::get_process(&self.db, process_id)?.ok_or(AssetflowError::NotFound {
            entity: "process",
            id: process_id,
        })
    }

    fn run_step(
        &self,
        process: &ProcessRow,
        step: &ProcessStepRow,
        handler: Option<&dyn StepHandler>,
    ) -> Result<()> {
        let _span = info_span!("process_step", step_id = step.id, asset_id = step.asset_id).entered();

        let started = process_repo::transition_step(&self.db, step.id, StepStatus::InProgress, None)?;
        self.progress.send(ProgressEvent::step_changed(
            step.asset_id,
            started.process_id,
            step.id,
            started.step_status,
            started.process_status,
        ));

        let ctx = StepContext { process, step };
        let result = match handler {
            Some(handler) => execute_isolated(handler, &ctx),
            None => Err(StepError::UnknownProcessType(process.process_type.clone())),
        };

        let finished = match result {
            Ok(output) => {
                debug!("Step {} completed", step.id);
                process_repo::transition_step(
                    &self.db,
                    step.id,
                    StepStatus::Completed,
                    Some(&output),
                )?
            }
            Err(e) => {
                error!("Step {} of process {} failed: {}", step.id, process.id, e);
                process_repo::transition_step(
                    &self.db,
                    step.id,
                    StepStatus::Failed,
                    Some(&json!({ "error": e.to_string() })),
                )?
            }
        };

        self.progress.send(ProgressEvent::step_changed(
            step.asset_id,
            finished.process_id,
            step.id,
            finished.step_status,
            finished.process_status,
        ));
        Ok(())
    }
}

fn should_stop(process: &ProcessRow) -> bool {
    match process.status {
        ProcessStatus::Stopped => true,
        ProcessStatus::Failed => process.policy() == CompletionPolicy::FailFast,
        _ => false,
    }
}

fn execute_isolated(
    handler: &dyn StepHandler,
    ctx: &StepContext<'_>,
) -> std::result::Result<serde_json::Value, StepError> {
    panic::catch_unwind(AssertUnwindSafe(|| handler.execute(ctx)))
        .unwrap_or_else(|payload| Err(StepError::Panicked(panic_message(payload.as_ref()))))
}

impl JobHandler for ProcessRunner {
    type Job = i64;

    fn handle(&self, process_id: i64) {
        if let Err(e) = self.run(process_id) {
            error!("Failed to advance process {}: {}", process_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::process_repo::NewProcess;
    use crate::db::project_repo::{self, NewAsset};
    use serde_json::Value;
    use std::sync::Arc;

    /// Fails for the asset ids it is given, panics for `panic_on`.
    struct ScriptedHandler {
        fail: Vec<i64>,
        panic_on: Option<i64>,
    }

    impl StepHandler for ScriptedHandler {
        fn execute(&self, ctx: &StepContext<'_>) -> std::result::Result<Value, StepError> {
            if self.panic_on == Some(ctx.step.asset_id) {
                panic!("handler blew up");
            }
            if self.fail.contains(&ctx.step.asset_id) {
                return Err(StepError::Handler("scripted failure".to_string()));
            }
            Ok(json!({ "asset": ctx.step.asset_id }))
        }
    }

    fn seed(db: &Database, assets: usize, process_type: &str, allow_partial: bool) -> (ProcessRow, Vec<i64>) {
        let project = project_repo::create_project(db, "p", "").unwrap();
        let asset_ids: Vec<i64> = (0..assets)
            .map(|i| {
                project_repo::create_asset(db, project.id, &NewAsset::file(format!("{i}"), format!("/{i}")))
                    .unwrap()
                    .id
            })
            .collect();
        let process = process_repo::create_process(
            db,
            project.id,
            &NewProcess {
                name: "run".to_string(),
                process_type: process_type.to_string(),
                details: None,
                allow_partial,
                asset_ids: asset_ids.clone(),
            },
        )
        .unwrap();
        (process, asset_ids)
    }

    fn runner(db: &Database, handler: ScriptedHandler) -> ProcessRunner {
        let mut registry = HandlerRegistry::new();
        registry.register("scripted", Arc::new(handler));
        ProcessRunner::new(db.clone(), registry, ProgressBroadcaster::default())
    }

    fn statuses(db: &Database, process_id: i64) -> Vec<StepStatus> {
        process_repo::get_steps(db, process_id)
            .unwrap()
            .into_iter()
            .map(|s| s.status)
            .collect()
    }

    #[test]
    fn test_all_steps_complete() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 3, "scripted", false);
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::Advanced(ProcessStatus::Completed));
        assert_eq!(statuses(&db, process.id), vec![StepStatus::Completed; 3]);
        let stored = process_repo::get_process(&db, process.id).unwrap().unwrap();
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        let steps = process_repo::get_steps(&db, process.id).unwrap();
        assert_eq!(steps[0].output, Some(json!({ "asset": steps[0].asset_id })));
    }

    #[test]
    fn test_fail_fast_stops_remaining_steps() {
        let db = Database::open_in_memory().unwrap();
        let (process, assets) = seed(&db, 3, "scripted", false);
        let runner = runner(&db, ScriptedHandler { fail: vec![assets[0]], panic_on: None });

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::Advanced(ProcessStatus::Failed));
        assert_eq!(
            statuses(&db, process.id),
            vec![StepStatus::Failed, StepStatus::Pending, StepStatus::Pending]
        );
        let steps = process_repo::get_steps(&db, process.id).unwrap();
        assert_eq!(steps[0].output, Some(json!({ "error": "Step handler failed: scripted failure" })));
    }

    #[test]
    fn test_allow_partial_runs_every_step() {
        let db = Database::open_in_memory().unwrap();
        let (process, assets) = seed(&db, 3, "scripted", true);
        let runner = runner(&db, ScriptedHandler { fail: vec![assets[1]], panic_on: None });

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::Advanced(ProcessStatus::Completed));
        let progress = process_repo::get_progress(&db, process.id).unwrap().unwrap();
        assert_eq!(progress.completed_step_count, 2);
        assert_eq!(progress.failed_step_count, 1);
    }

    #[test]
    fn test_handler_panic_fails_step() {
        let db = Database::open_in_memory().unwrap();
        let (process, assets) = seed(&db, 2, "scripted", true);
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: Some(assets[0]) });

        runner.run(process.id).unwrap();

        assert_eq!(
            statuses(&db, process.id),
            vec![StepStatus::Failed, StepStatus::Completed]
        );
        assert!(!runner.is_running(process.id));
    }

    #[test]
    fn test_unknown_process_type_fails_steps() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 2, "summarize", true);
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::Advanced(ProcessStatus::Failed));
        assert_eq!(statuses(&db, process.id), vec![StepStatus::Failed; 2]);
    }

    #[test]
    fn test_terminal_process_is_noop() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 2, "scripted", false);
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });
        runner.run(process.id).unwrap();
        let before = process_repo::get_process(&db, process.id).unwrap().unwrap();

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::AlreadyTerminal(ProcessStatus::Completed));
        let after = process_repo::get_process(&db, process.id).unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);
        assert_eq!(before.completed_at, after.completed_at);
    }

    #[test]
    fn test_stopped_process_is_not_advanced() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 2, "scripted", false);
        process_repo::stop_process(&db, process.id).unwrap();
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::AlreadyTerminal(ProcessStatus::Stopped));
        assert_eq!(statuses(&db, process.id), vec![StepStatus::Pending; 2]);
    }

    /// Stops its own process while the first step runs.
    struct StopDuringFirstStep {
        db: Database,
    }

    impl StepHandler for StopDuringFirstStep {
        fn execute(&self, ctx: &StepContext<'_>) -> std::result::Result<Value, StepError> {
            process_repo::stop_process(&self.db, ctx.process.id)
                .map_err(|e| StepError::Handler(e.to_string()))?;
            Ok(json!({ "asset": ctx.step.asset_id }))
        }
    }

    #[test]
    fn test_stop_during_run_skips_remaining_steps() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 3, "stopping", false);
        let mut registry = HandlerRegistry::new();
        registry.register("stopping", Arc::new(StopDuringFirstStep { db: db.clone() }));
        let runner = ProcessRunner::new(db.clone(), registry, ProgressBroadcaster::default());
        let mut events = runner.progress.subscribe();

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::Advanced(ProcessStatus::Stopped));
        assert_eq!(
            statuses(&db, process.id),
            vec![StepStatus::Completed, StepStatus::Pending, StepStatus::Pending]
        );
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event.kind, crate::broadcast::ProgressKind::ProcessFinished { .. }),
                "runner must not announce a stop it did not make"
            );
        }
    }

    #[test]
    fn test_stop_after_status_read_prevents_step_start() {
        let db = Database::open_in_memory().unwrap();
        let (process, assets) = seed(&db, 1, "scripted", false);
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: Some(assets[0]) });
        let stale = process_repo::get_process(&db, process.id).unwrap().unwrap();
        let step = process_repo::get_steps(&db, process.id).unwrap().remove(0);
        process_repo::stop_process(&db, process.id).unwrap();

        let handler = runner.handlers.get("scripted");
        let err = runner.run_step(&stale, &step, handler.as_deref()).unwrap_err();

        assert!(matches!(
            err,
            AssetflowError::Database(DatabaseError::ProcessStopped { .. })
        ));
        assert_eq!(statuses(&db, process.id), vec![StepStatus::Pending]);
    }

    #[test]
    fn test_interrupted_steps_are_rerun() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 2, "scripted", false);
        let steps = process_repo::get_steps(&db, process.id).unwrap();
        process_repo::transition_step(&db, steps[0].id, StepStatus::InProgress, None).unwrap();
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });

        let outcome = runner.run(process.id).unwrap();

        assert_eq!(outcome, RunOutcome::Advanced(ProcessStatus::Completed));
        assert_eq!(statuses(&db, process.id), vec![StepStatus::Completed; 2]);
    }

    #[test]
    fn test_claimed_process_is_not_run_twice() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 1, "scripted", false);
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });

        let claim = runner.claim(process.id).unwrap();
        assert_eq!(runner.run(process.id).unwrap(), RunOutcome::AlreadyRunning);
        assert_eq!(statuses(&db, process.id), vec![StepStatus::Pending]);

        drop(claim);
        assert!(!runner.is_running(process.id));
        assert_eq!(
            runner.run(process.id).unwrap(),
            RunOutcome::Advanced(ProcessStatus::Completed)
        );
    }

    #[test]
    fn test_resubmission_during_run_requests_rerun() {
        let db = Database::open_in_memory().unwrap();
        let (process, _) = seed(&db, 1, "scripted", false);
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });

        let mut claim = runner.claim(process.id).unwrap();
        assert!(runner.claim(process.id).is_none());

        assert!(runner.release_or_rerun(&mut claim));
        assert!(runner.is_running(process.id));
        assert!(!runner.release_or_rerun(&mut claim));
        assert!(!runner.is_running(process.id));
    }

    #[test]
    fn test_missing_process_is_not_found() {
        let db = Database::open_in_memory().unwrap();
        let runner = runner(&db, ScriptedHandler { fail: vec![], panic_on: None });
        assert!(matches!(
            runner.run(42),
            Err(AssetflowError::NotFound { entity: "process", id: 42 })
        ));
        assert!(!runner.is_running(42));
    }

    #[test]
    fn test_retry_after_failure_completes() {
        let db = Database::open_in_memory().unwrap();
        let (process, assets) = seed(&db, 2, "scripted", false);
        runner(&db, ScriptedHandler { fail: vec![assets[1]], panic_on: None })
            .run(process.id)
            .unwrap();
        assert_eq!(
            process_repo::get_process(&db, process.id).unwrap().unwrap().status,
            ProcessStatus::Failed
        );

        assert_eq!(process_repo::retry_failed_steps(&db, process.id).unwrap(), 1);
        let outcome = runner(&db, ScriptedHandler { fail: vec![], panic_on: None })
            .run(process.id)
            .unwrap();

        assert_eq!(outcome, RunOutcome::Advanced(ProcessStatus::Completed));
    }
}
