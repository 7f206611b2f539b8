use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AssetflowError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Failed to resolve API key: {0}")]
    Secret(#[from] crate::secrets::SecretError),
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Asset {0} not found")]
    AssetNotFound(i64),

    #[error("No extraction credential available: {0}")]
    Credential(#[from] CredentialError),

    #[error("Failed to read document '{path}': {source}")]
    ReadDocument {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Extraction service request failed: {0}")]
    Request(String),

    #[error("Extraction service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("Unsupported asset source: {0}")]
    UnsupportedSource(String),

    #[error("Storage failed during extraction: {0}")]
    Storage(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("No API key configured")]
    Missing,

    #[error("Failed to load API key: {0}")]
    Storage(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Worker queue is full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },
}

#[derive(Error, Debug)]
pub enum StepError {
    #[error("No step handler registered for process type '{0}'")]
    UnknownProcessType(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Step handler failed: {0}")]
    Handler(String),

    #[error("Step handler panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, AssetflowError>;
