//! Asset text extraction: backends, credentials and the pooled worker.

pub mod credentials;
pub mod extractor;
pub mod worker;

pub use credentials::{seed_api_key, CredentialProvider, DatabaseCredentials, StaticCredentials};
pub use extractor::{
    build_extractor, ExtractionSource, HttpExtractor, LocalFileExtractor, TextExtractor,
};
pub use worker::{ExtractionWorker, RetryPolicy};
