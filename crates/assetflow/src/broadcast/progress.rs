//! Progress broadcaster for real-time extraction and process status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::process::state::{ProcessStatus, StepStatus};

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressKind {
    ExtractionCompleted { content_length: usize },
    ExtractionFailed { error: String },
    StepChanged {
        process_id: i64,
        step_id: i64,
        step_status: StepStatus,
        process_status: ProcessStatus,
    },
    ProcessFinished {
        process_id: i64,
        status: ProcessStatus,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Asset the event concerns, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<i64>,
    #[serde(flatten)]
    pub kind: ProgressKind,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn extraction_completed(asset_id: i64, content_length: usize) -> Self {
        Self {
            asset_id: Some(asset_id),
            kind: ProgressKind::ExtractionCompleted { content_length },
            timestamp: Utc::now(),
        }
    }

    pub fn extraction_failed(asset_id: i64, error: &str) -> Self {
        Self {
            asset_id: Some(asset_id),
            kind: ProgressKind::ExtractionFailed {
                error: error.to_string(),
            },
            timestamp: Utc::now(),
        }
    }

    pub fn step_changed(
        asset_id: i64,
        process_id: i64,
        step_id: i64,
        step_status: StepStatus,
        process_status: ProcessStatus,
    ) -> Self {
        Self {
            asset_id: Some(asset_id),
            kind: ProgressKind::StepChanged {
                process_id,
                step_id,
                step_status,
                process_status,
            },
            timestamp: Utc::now(),
        }
    }

    pub fn process_finished(process_id: i64, status: ProcessStatus) -> Self {
        Self {
            asset_id: None,
            kind: ProgressKind::ProcessFinished { process_id, status },
            timestamp: Utc::now(),
        }
    }
}

/// Fans progress events out to any number of subscribers. Sending with no
/// subscriber is not an error.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
