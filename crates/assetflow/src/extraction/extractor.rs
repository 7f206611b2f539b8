//! Text extraction backends.
//!
//! The engine only depends on [`TextExtractor`]; which backend runs is a
//! configuration choice ([`build_extractor`]).

use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use reqwest::blocking::{multipart, Client};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::ExtractorBackend;
use crate::db::project_repo::{AssetRow, AssetType};
use crate::error::ExtractionError;

/// Error bodies from the service are cut to this length before logging.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Everything an extractor needs to know about one stored asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionSource {
    pub asset_id: i64,
    pub path: PathBuf,
    pub filename: String,
    pub asset_type: AssetType,
    /// Original location of `url` assets. The fetched page is at `path`.
    pub url: Option<String>,
}

impl ExtractionSource {
    pub fn from_asset(asset: &AssetRow) -> Result<Self, ExtractionError> {
        let url = match asset.asset_type {
            AssetType::File => None,
            AssetType::Url => Some(asset.source_url().map(str::to_string).ok_or_else(|| {
                ExtractionError::UnsupportedSource(format!(
                    "url asset {} has no source url",
                    asset.id
                ))
            })?),
        };

        Ok(Self {
            asset_id: asset.id,
            path: PathBuf::from(&asset.path),
            filename: asset.filename.clone(),
            asset_type: asset.asset_type,
            url,
        })
    }
}

/// Turns a stored document into plain text.
pub trait TextExtractor: Send + Sync {
    fn extract_text(
        &self,
        api_key: &SecretString,
        source: &ExtractionSource,
    ) -> Result<String, ExtractionError>;
}

pub fn build_extractor(backend: &ExtractorBackend) -> Result<Box<dyn TextExtractor>, ExtractionError> {
    match backend {
        ExtractorBackend::Http {
            server_url,
            timeout_secs,
        } => Ok(Box::new(HttpExtractor::new(
            server_url,
            Duration::from_secs(*timeout_secs),
        )?)),
        ExtractorBackend::Local => Ok(Box::new(LocalFileExtractor)),
    }
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    content: String,
}

/// Remote extraction service client.
///
/// Uploads the stored file to `POST {server_url}/v1/parse` as multipart
/// field `file`, with the asset type and, for `url` assets, the source URL
/// as extra fields. Authenticates with a bearer API key and expects
/// `{"content": "..."}` back.
pub struct HttpExtractor {
    client: Client,
    endpoint: String,
}

impl HttpExtractor {
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::Request(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/v1/parse", server_url.trim_end_matches('/')),
        })
    }

    fn build_form(&self, source: &ExtractionSource) -> Result<multipart::Form, ExtractionError> {
        let bytes = std::fs::read(&source.path).map_err(|e| ExtractionError::ReadDocument {
            path: source.path.clone(),
            source: e,
        })?;
        let mime = mime_guess::from_path(&source.path).first_or_octet_stream();

        let part = multipart::Part::bytes(bytes)
            .file_name(source.filename.clone())
            .mime_str(mime.essence_str())
            .map_err(|e| ExtractionError::Request(e.to_string()))?;

        let mut form = multipart::Form::new()
            .part("file", part)
            .text("type", source.asset_type.as_str().to_string());
        if let Some(url) = &source.url {
            form = form.text("url", url.clone());
        }
        Ok(form)
    }
}

impl TextExtractor for HttpExtractor {
    fn extract_text(
        &self,
        api_key: &SecretString,
        source: &ExtractionSource,
    ) -> Result<String, ExtractionError> {
        let form = self.build_form(source)?;
        debug!("Uploading asset {} to {}", source.asset_id, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key.expose_secret())
            .multipart(form)
            .send()
            .map_err(|e| ExtractionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ExtractionError::Service {
                status: status.as_u16(),
                body: truncate_body(&body),
            });
        }

        let parsed: ExtractResponse = response
            .json()
            .map_err(|e| ExtractionError::Request(format!("invalid response body: {}", e)))?;
        Ok(parsed.content)
    }
}

fn truncate_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Reads the stored file as UTF-8 text. Needs no service, the API key is
/// accepted and ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileExtractor;

impl TextExtractor for LocalFileExtractor {
    fn extract_text(
        &self,
        _api_key: &SecretString,
        source: &ExtractionSource,
    ) -> Result<String, ExtractionError> {
        std::fs::read_to_string(&source.path).map_err(|e| ExtractionError::ReadDocument {
            path: source.path.clone(),
            source: e,
        })
    }
}
