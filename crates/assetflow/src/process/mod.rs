pub mod runner;
pub mod state;
pub mod step;

pub use runner::{ProcessRunner, RunOutcome};
pub use state::{derive_status, CompletionPolicy, ProcessProgress, ProcessStatus, StepStatus};
pub use step::{ExtractionStep, HandlerRegistry, StepContext, StepHandler, EXTRACT_PROCESS_TYPE};
