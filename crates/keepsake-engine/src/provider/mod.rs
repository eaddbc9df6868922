mod hosted;
mod legacy;
mod stub;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use keepsake_contracts::generation::{sanitize_payload, GenerationKind, StyleParams};
use keepsake_contracts::jobs::TrainingStatusReport;
use keepsake_contracts::providers::{ProviderCapabilities, ProviderKind};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{Map, Value};
use tracing::debug;

use crate::blob::{generated_key, BlobStore};
use crate::error::truncate_text;

pub use hosted::{parse_training_status, HostedProvider};
pub use legacy::LegacyProvider;
pub use stub::StubProvider;

/// What the router hands a provider for one synchronous generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderGenerateRequest {
    pub owner_id: String,
    pub kind: GenerationKind,
    pub prompt: String,
    pub style: StyleParams,
    /// Presigned URLs the provider can fetch.
    pub reference_images: Vec<String>,
    /// Who each reference shows, by position.
    pub reference_labels: Vec<String>,
    pub adapter_uri: Option<String>,
    pub panels: u32,
    pub metadata: Map<String, Value>,
}

impl ProviderGenerateRequest {
    /// Prompt for backends that only take one text field.
    pub fn flattened_prompt(&self) -> String {
        [self.prompt.trim(), self.style.style_prompt.trim()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTrainingRequest {
    pub owner_id: String,
    pub adapter_id: String,
    pub training_images_uri: String,
    pub params: Map<String, Value>,
}

/// A backend that renders images and, when capable, trains style adapters.
///
/// Adapters return `anyhow` errors with context; the router turns them into
/// typed engine errors.
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProviderKind;
    fn capabilities(&self) -> ProviderCapabilities;
    /// Renders the request and returns the BlobStore URI of the result.
    fn generate(&self, request: &ProviderGenerateRequest) -> Result<String>;
    /// Starts a remote training job and returns its provider job id.
    fn start_training(&self, request: &ProviderTrainingRequest) -> Result<String>;
    fn poll_training(&self, job_id: &str) -> Result<TrainingStatusReport>;
    fn health(&self, timeout: Duration) -> bool;
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    debug!(provider, payload = %sanitize_payload(&parsed), "provider response");
    Ok(parsed)
}

/// Where a generation response put its image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ImageReference {
    /// Already a BlobStore URI.
    Stored(String),
    /// Plain HTTP(S) URL that has to be downloaded.
    Remote(String),
    Inline(Vec<u8>),
}

/// Accepts `{image_uri}` and the `{data: [{s3_uri|url|b64_json}]}` shape.
pub(crate) fn extract_image_reference(provider: &str, payload: &Value) -> Result<ImageReference> {
    let first_data = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first());

    let uri = payload
        .get("image_uri")
        .or_else(|| first_data.and_then(|row| row.get("s3_uri")))
        .or_else(|| first_data.and_then(|row| row.get("url")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(uri) = uri {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(ImageReference::Remote(uri.to_string()));
        }
        return Ok(ImageReference::Stored(uri.to_string()));
    }

    if let Some(encoded) = first_data
        .and_then(|row| row.get("b64_json"))
        .and_then(Value::as_str)
    {
        let bytes = BASE64
            .decode(encoded.trim())
            .with_context(|| format!("{provider} returned undecodable b64_json"))?;
        return Ok(ImageReference::Inline(bytes));
    }

    Err(anyhow!(
        "{provider} response carried no image: {}",
        truncate_text(&sanitize_payload(payload).to_string(), 512)
    ))
}

/// Turns an image reference into a BlobStore URI, storing bytes if needed.
pub(crate) fn store_image_reference(
    provider: &str,
    http: &HttpClient,
    blobs: &Arc<dyn BlobStore>,
    reference: ImageReference,
    request: &ProviderGenerateRequest,
    timeout: Duration,
) -> Result<String> {
    let bytes = match reference {
        ImageReference::Stored(uri) => return Ok(uri),
        ImageReference::Inline(bytes) => bytes,
        ImageReference::Remote(url) => {
            let response = http
                .get(&url)
                .timeout(timeout)
                .send()
                .with_context(|| format!("failed downloading {provider} image ({url})"))?;
            if !response.status().is_success() {
                let code = response.status().as_u16();
                let body = response.text().unwrap_or_default();
                bail!(
                    "{provider} image download failed ({code}): {}",
                    truncate_text(&body, 512)
                );
            }
            response
                .bytes()
                .with_context(|| format!("failed reading {provider} image bytes"))?
                .to_vec()
        }
    };
    blobs
        .put(&bytes, &generated_key(&request.owner_id, request.kind.as_str()))
        .with_context(|| format!("failed storing {provider} image"))
}
