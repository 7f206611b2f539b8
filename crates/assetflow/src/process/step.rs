//! Step handlers: the work done for one ProcessStep.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::db::process_repo::{ProcessRow, ProcessStepRow};
use crate::db::{project_repo, Database};
use crate::error::StepError;
use crate::extraction::ExtractionWorker;

/// Process type handled by [`ExtractionStep`].
pub const EXTRACT_PROCESS_TYPE: &str = "extract";

/// What a handler sees about the step it runs.
pub struct StepContext<'a> {
    pub process: &'a ProcessRow,
    pub step: &'a ProcessStepRow,
}

/// Executes one step. The returned value is stored as the step output.
pub trait StepHandler: Send + Sync {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<Value, StepError>;
}

/// Makes sure the step's asset has content, extracting inline when needed.
///
/// Output: `{"content_length": <bytes>}`.
pub struct ExtractionStep {
    db: Database,
    worker: Arc<ExtractionWorker>,
}

impl ExtractionStep {
    pub fn new(db: Database, worker: Arc<ExtractionWorker>) -> Self {
        Self { db, worker }
    }
}

impl StepHandler for ExtractionStep {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<Value, StepError> {
        let asset_id = ctx.step.asset_id;
        let existing = project_repo::get_asset_content(&self.db, asset_id)
            .map_err(|e| StepError::Extraction(e.into()))?
            .and_then(|row| row.content);

        let content = match existing {
            Some(content) => content,
            None => self.worker.extract(asset_id)?,
        };

        Ok(json!({ "content_length": content.len() }))
    }
}

/// Step handlers keyed by process type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, process_type: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(process_type.into(), handler);
    }

    pub fn get(&self, process_type: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(process_type).cloned()
    }

    pub fn process_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
