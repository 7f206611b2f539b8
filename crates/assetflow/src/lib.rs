pub mod broadcast;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod logging;
pub mod process;
pub mod recovery;
pub mod secrets;
pub mod worker;

pub use broadcast::{ProgressBroadcaster, ProgressEvent, ProgressKind};
pub use config::{load_config, Config};
pub use db::Database;
pub use engine::{Engine, EngineBuilder, EngineOptions, ProcessSummary};
pub use error::{
    AssetflowError, ConfigError, CredentialError, ExtractionError, Result, StepError, WorkerError,
};
pub use extraction::{CredentialProvider, ExtractionSource, RetryPolicy, TextExtractor};
pub use process::{ProcessProgress, ProcessStatus, StepHandler, StepStatus};
pub use recovery::RecoveryReport;
pub use secrets::{resolve_secret, resolve_secret_optional, SecretError};
