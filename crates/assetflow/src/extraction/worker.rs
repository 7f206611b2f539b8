use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, info_span, warn};

use crate::broadcast::{ProgressBroadcaster, ProgressEvent};
use crate::db::{project_repo, Database};
use crate::error::ExtractionError;
use crate::extraction::credentials::CredentialProvider;
use crate::extraction::extractor::{ExtractionSource, TextExtractor};
use crate::worker::JobHandler;

/// How often a failed extraction call is repeated. Only the call to the
/// extractor is retried; storage errors and missing assets are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        max_retries: 0,
        backoff: Duration::ZERO,
    };

    pub fn new(max_retries: u32, backoff_ms: u64) -> Self {
        Self {
            max_retries,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

/// Turns one asset into stored text.
///
/// Each storage access takes the database lock for that access only; the
/// extractor always runs with the lock released.
pub struct ExtractionWorker {
    db: Database,
    credentials: Arc<dyn CredentialProvider>,
    extractor: Arc<dyn TextExtractor>,
    retry: RetryPolicy,
    progress: ProgressBroadcaster,
}

impl ExtractionWorker {
    pub fn new(
        db: Database,
        credentials: Arc<dyn CredentialProvider>,
        extractor: Arc<dyn TextExtractor>,
        retry: RetryPolicy,
        progress: ProgressBroadcaster,
    ) -> Self {
        Self {
            db,
            credentials,
            extractor,
            retry,
            progress,
        }
    }

    /// Extracts and stores the content of one asset, returning the text.
    ///
    /// A missing asset fails before anything is written. On any failure the
    /// content row is left as it was.
    pub fn extract(&self, asset_id: i64) -> Result<String, ExtractionError> {
        let asset = project_repo::get_asset(&self.db, asset_id)?
            .ok_or(ExtractionError::AssetNotFound(asset_id))?;
        let source = ExtractionSource::from_asset(&asset)?;
        let api_key = self.credentials.api_key()?;

        let text = self.call_with_retry(&api_key, &source)?;

        project_repo::add_asset_content(&self.db, asset_id, Some(&text))?;
        Ok(text)
    }

    fn call_with_retry(
        &self,
        api_key: &secrecy::SecretString,
        source: &ExtractionSource,
    ) -> Result<String, ExtractionError> {
        let mut attempt = 0;
        loop {
            match self.extractor.extract_text(api_key, source) {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Extraction of asset {} failed ({}), retry {}/{} in {:?}",
                        source.asset_id, e, attempt, self.retry.max_retries, delay
                    );
                    thread::sleep(delay);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs [`extract`](Self::extract) and absorbs the outcome into logs and
    /// progress events. Nothing is returned to the submitter.
    pub fn run(&self, asset_id: i64) {
        let _span = info_span!("extract_asset", asset_id).entered();
        debug!("Extracting asset {}", asset_id);

        match self.extract(asset_id) {
            Ok(text) => {
                info!("Extracted {} bytes from asset {}", text.len(), asset_id);
                self.progress
                    .send(ProgressEvent::extraction_completed(asset_id, text.len()));
            }
            Err(e @ ExtractionError::AssetNotFound(_)) => {
                warn!("Skipping extraction: {}", e);
                self.progress
                    .send(ProgressEvent::extraction_failed(asset_id, &e.to_string()));
            }
            Err(e) => {
                error!("Failed to extract asset {}: {}", asset_id, e);
                self.progress
                    .send(ProgressEvent::extraction_failed(asset_id, &e.to_string()));
            }
        }
    }
}

impl JobHandler for ExtractionWorker {
    type Job = i64;

    fn handle(&self, asset_id: i64) {
        self.run(asset_id);
    }
}
