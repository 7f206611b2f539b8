//! In-process event streaming for extraction and process progress.

pub mod progress;

pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressKind};
