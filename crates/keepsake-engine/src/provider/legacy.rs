use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use keepsake_contracts::jobs::TrainingStatusReport;
use keepsake_contracts::providers::{ProviderCapabilities, ProviderKind};
use reqwest::blocking::Client as HttpClient;
use serde_json::json;

use super::{
    extract_image_reference, response_json_or_error, store_image_reference, GenerationProvider,
    ProviderGenerateRequest, ProviderTrainingRequest,
};
use crate::blob::BlobStore;
use crate::config::EngineConfig;

/// Older single-prompt diffusion server, only used as a generation fallback.
pub struct LegacyProvider {
    api_base: String,
    http: HttpClient,
    blobs: Arc<dyn BlobStore>,
    generation_timeout: Duration,
    request_timeout: Duration,
}

impl LegacyProvider {
    pub fn new(config: &EngineConfig, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            api_base: config.legacy_api_base.trim_end_matches('/').to_string(),
            http: HttpClient::new(),
            blobs,
            generation_timeout: Duration::from_secs_f64(config.generation_timeout_seconds),
            request_timeout: Duration::from_secs_f64(config.request_timeout_seconds),
        }
    }
}

impl GenerationProvider for LegacyProvider {
    fn name(&self) -> &str {
        "legacy"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Legacy
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::generation_only()
    }

    fn generate(&self, request: &ProviderGenerateRequest) -> Result<String> {
        let endpoint = format!("{}/v1/images/generations", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .timeout(self.generation_timeout)
            .json(&json!({ "prompt": request.flattened_prompt() }))
            .send()
            .with_context(|| format!("legacy generate request failed ({endpoint})"))?;
        let body = response_json_or_error("legacy generate", response)?;
        let reference = extract_image_reference("legacy", &body)?;
        store_image_reference(
            "legacy",
            &self.http,
            &self.blobs,
            reference,
            request,
            self.request_timeout,
        )
    }

    fn start_training(&self, _request: &ProviderTrainingRequest) -> Result<String> {
        bail!("legacy backend cannot train adapters")
    }

    fn poll_training(&self, job_id: &str) -> Result<TrainingStatusReport> {
        bail!("legacy backend has no training job {job_id}")
    }

    fn health(&self, timeout: Duration) -> bool {
        self.http
            .get(format!("{}/health", self.api_base))
            .timeout(timeout)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }
}
