use std::path::{Path, PathBuf};

use secrecy::SecretString;

use crate::config::schema::{Config, ExtractorBackend};
use crate::error::ConfigError;
use crate::secrets::resolve_secret_optional;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.workers.extraction == 0 {
        return Err(ConfigError::Validation {
            message: "workers.extraction must be greater than 0".to_string(),
        });
    }
    if config.workers.process == 0 {
        return Err(ConfigError::Validation {
            message: "workers.process must be greater than 0".to_string(),
        });
    }
    if config.workers.queue_capacity == Some(0) {
        return Err(ConfigError::Validation {
            message: "workers.queueCapacity must be greater than 0 when set".to_string(),
        });
    }

    if let ExtractorBackend::Http {
        server_url,
        timeout_secs,
    } = &config.extraction.backend
    {
        if !(server_url.starts_with("http://") || server_url.starts_with("https://")) {
            return Err(ConfigError::Validation {
                message: format!("Invalid extraction server URL: {}", server_url),
            });
        }
        if *timeout_secs == 0 {
            return Err(ConfigError::Validation {
                message: "extraction timeoutSecs must be greater than 0".to_string(),
            });
        }
    }

    Ok(())
}

impl Config {
    /// Configured database path, or the per-user default.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(path) => Ok(PathBuf::from(path)),
            None => crate::db::default_database_path().ok_or_else(|| ConfigError::Validation {
                message: "No databasePath configured and no home directory found".to_string(),
            }),
        }
    }

    /// Resolves the configured API key, if any source is set.
    pub fn api_key(&self) -> Result<Option<SecretString>, ConfigError> {
        let extraction = &self.extraction;
        Ok(resolve_secret_optional(
            extraction.api_key.as_deref(),
            extraction.api_key_file.as_deref(),
            extraction.api_key_env.as_deref(),
        )?)
    }
}
