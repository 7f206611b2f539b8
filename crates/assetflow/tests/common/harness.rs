//! Test harness for engine-level integration tests.
//!
//! The `TestHarness` struct provides:
//! - A temporary directory holding the SQLite database and stored documents
//! - A scriptable `FakeExtractor` that records call concurrency
//! - Polling helpers, since submissions are fire-and-forget

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use secrecy::SecretString;
use tempfile::TempDir;

use assetflow::db::project_repo::{self, AssetRow, NewAsset, ProjectRow};
use assetflow::db::Database;
use assetflow::engine::{Engine, EngineBuilder, EngineOptions};
use assetflow::extraction::{ExtractionSource, StaticCredentials, TextExtractor};
use assetflow::ExtractionError;

/// How long `wait_until` polls before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Scripted response for one file name.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    Fail(String),
}

/// Extractor whose answers are set per file name. Unscripted files return
/// their stored bytes as text.
pub struct FakeExtractor {
    replies: Mutex<HashMap<String, Reply>>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            delay,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn reply(&self, filename: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(filename.to_string(), reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

impl TextExtractor for FakeExtractor {
    fn extract_text(
        &self,
        _api_key: &SecretString,
        source: &ExtractionSource,
    ) -> Result<String, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        let reply = self.replies.lock().unwrap().get(&source.filename).cloned();
        let result = match reply {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Fail(message)) => Err(ExtractionError::Request(message)),
            None => std::fs::read_to_string(&source.path).map_err(|e| {
                ExtractionError::ReadDocument {
                    path: source.path.clone(),
                    source: e,
                }
            }),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Isolated environment: a file-backed database in a temp dir plus a fake
/// extractor shared with every engine built from it.
pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub db: Database,
    pub extractor: Arc<FakeExtractor>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_extractor(FakeExtractor::new())
    }

    pub fn with_extractor(extractor: FakeExtractor) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("assetflow.db");
        let db = Database::open(&db_path).expect("Failed to open database");

        Self {
            temp_dir,
            db_path,
            db,
            extractor: Arc::new(extractor),
        }
    }

    /// Opens a second handle on the same database file, as a restarted
    /// process would.
    pub fn reopen(&self) -> Database {
        Database::open(&self.db_path).expect("Failed to reopen database")
    }

    pub fn engine(&self) -> Engine {
        self.engine_with(EngineOptions::default())
    }

    pub fn engine_with(&self, options: EngineOptions) -> Engine {
        self.engine_builder()
            .options(options)
            .build()
            .expect("Failed to build engine")
    }

    /// Builder wired to this harness' database, extractor and a static key.
    pub fn engine_builder(&self) -> EngineBuilder {
        Engine::builder(self.db.clone(), self.extractor.clone()).credentials(Arc::new(
            StaticCredentials::new(SecretString::from("pk-test")),
        ))
    }

    /// Writes a document into the temp dir and returns its path.
    pub fn write_document(&self, filename: &str, content: &str) -> String {
        let dir = self.temp_dir.path().join("files");
        std::fs::create_dir_all(&dir).expect("Failed to create files dir");
        let path = dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write document");
        path.to_string_lossy().to_string()
    }

    pub fn project(&self, name: &str) -> ProjectRow {
        project_repo::create_project(&self.db, name, "").expect("Failed to create project")
    }

    /// Inserts a file asset without submitting it.
    pub fn asset(&self, project_id: i64, filename: &str, content: &str) -> AssetRow {
        let path = self.write_document(filename, content);
        project_repo::create_asset(&self.db, project_id, &NewAsset::file(filename, path))
            .expect("Failed to create asset")
    }

    pub fn content_of(&self, asset_id: i64) -> Option<String> {
        project_repo::get_asset_content(&self.db, asset_id)
            .expect("Failed to read content")
            .and_then(|row| row.content)
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
