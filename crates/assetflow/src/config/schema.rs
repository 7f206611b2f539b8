use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// SQLite database file. Defaults to `~/.assetflow/data/assetflow.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            workers: WorkersConfig::default(),
            extraction: ExtractionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersConfig {
    /// Concurrent extractions.
    #[serde(default = "default_worker_count")]
    pub extraction: usize,
    /// Concurrently advanced processes.
    #[serde(default = "default_worker_count")]
    pub process: usize,
    /// Maximum queued jobs per pool. Unbounded when absent; a full queue
    /// rejects new submissions.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

fn default_worker_count() -> usize {
    5
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            extraction: default_worker_count(),
            process: default_worker_count(),
            queue_capacity: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionConfig {
    #[serde(default)]
    pub backend: ExtractorBackend,
    /// Extra attempts after a failed extraction call. 0 disables retries.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            backend: ExtractorBackend::default(),
            max_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            api_key: None,
            api_key_file: None,
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ExtractorBackend {
    /// Remote extraction service.
    Http {
        #[serde(rename = "serverUrl")]
        server_url: String,
        #[serde(rename = "timeoutSecs", default = "default_timeout_secs")]
        timeout_secs: u64,
    },
    /// Reads UTF-8 text straight from the stored file.
    Local,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for ExtractorBackend {
    fn default() -> Self {
        ExtractorBackend::Local
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
