//! Config loading from disk, including secret resolution.

use std::io::Write;

use secrecy::ExposeSecret;
use serial_test::serial;
use tempfile::NamedTempFile;

use assetflow::config::{load_config, ExtractorBackend};
use assetflow::engine::EngineOptions;
use assetflow::ConfigError;

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_http_backend_config() {
    let file = write_config(
        r#"{
            "databasePath": "/var/lib/assetflow/assetflow.db",
            "workers": { "extraction": 8, "process": 2 },
            "extraction": {
                "backend": { "kind": "http", "serverUrl": "http://localhost:8080", "timeoutSecs": 30 },
                "maxRetries": 3,
                "retryBackoffMs": 250
            }
        }"#,
    );

    let config = load_config(file.path()).unwrap();

    assert_eq!(
        config.extraction.backend,
        ExtractorBackend::Http {
            server_url: "http://localhost:8080".to_string(),
            timeout_secs: 30,
        }
    );
    let options = EngineOptions::from_config(&config);
    assert_eq!(options.extraction_workers, 8);
    assert_eq!(options.process_workers, 2);
    assert_eq!(options.queue_capacity, None);
    assert_eq!(options.retry.max_retries, 3);
    assert_eq!(options.retry.backoff.as_millis(), 250);
}

#[test]
#[serial]
fn test_api_key_from_env() {
    std::env::set_var("ASSETFLOW_IT_API_KEY", "pk-from-env");
    let file = write_config(r#"{ "extraction": { "apiKeyEnv": "ASSETFLOW_IT_API_KEY" } }"#);

    let config = load_config(file.path()).unwrap();
    let key = config.api_key().unwrap().unwrap();

    assert_eq!(key.expose_secret(), "pk-from-env");
    std::env::remove_var("ASSETFLOW_IT_API_KEY");
}

#[test]
#[serial]
fn test_api_key_env_missing_is_error() {
    std::env::remove_var("ASSETFLOW_IT_MISSING_KEY");
    let file = write_config(r#"{ "extraction": { "apiKeyEnv": "ASSETFLOW_IT_MISSING_KEY" } }"#);

    let config = load_config(file.path()).unwrap();

    assert!(matches!(config.api_key(), Err(ConfigError::Secret(_))));
}

#[test]
fn test_api_key_from_file() {
    let mut key_file = NamedTempFile::new().unwrap();
    writeln!(key_file, "pk-from-file").unwrap();
    let json = format!(
        r#"{{ "extraction": {{ "apiKeyFile": "{}" }} }}"#,
        key_file.path().display()
    );
    let file = write_config(&json);

    let config = load_config(file.path()).unwrap();

    assert_eq!(
        config.api_key().unwrap().unwrap().expose_secret(),
        "pk-from-file"
    );
}
