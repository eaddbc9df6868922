use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use keepsake_contracts::generation::sanitize_payload;
use keepsake_contracts::jobs::{JobStatus, TrainingStatusReport};
use keepsake_contracts::providers::{ProviderCapabilities, ProviderKind};
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{json, Value};

use super::{
    extract_image_reference, response_json_or_error, store_image_reference, GenerationProvider,
    ProviderGenerateRequest, ProviderTrainingRequest,
};
use crate::blob::BlobStore;
use crate::config::EngineConfig;

/// Primary backend: hosted diffusion service that also trains adapters.
pub struct HostedProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    blobs: Arc<dyn BlobStore>,
    generation_timeout: Duration,
    request_timeout: Duration,
}

impl HostedProvider {
    pub fn new(config: &EngineConfig, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            api_base: config.primary_api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http: HttpClient::new(),
            blobs,
            generation_timeout: Duration::from_secs_f64(config.generation_timeout_seconds),
            request_timeout: Duration::from_secs_f64(config.request_timeout_seconds),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.api_key.as_deref() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

impl GenerationProvider for HostedProvider {
    fn name(&self) -> &str {
        "hosted"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Hosted
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::full()
    }

    fn generate(&self, request: &ProviderGenerateRequest) -> Result<String> {
        let endpoint = self.endpoint("/v1/images/generations");
        let payload = json!({
            "owner_id": request.owner_id,
            "prompt": request.prompt,
            "negative_prompt": request.style.negative_prompt,
            "style_prompt": request.style.style_prompt,
            "reference_images": request.reference_images,
            "reference_labels": request.reference_labels,
            "adapter_uri": request.adapter_uri,
            "panels": request.panels,
            "num_inference_steps": request.style.num_inference_steps,
            "ip_adapter_scale": request.style.ip_adapter_scale,
            "metadata": request.metadata,
        });
        let response = self
            .authorized(self.http.post(&endpoint))
            .timeout(self.generation_timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("hosted generate request failed ({endpoint})"))?;
        let body = response_json_or_error("hosted generate", response)?;
        let reference = extract_image_reference("hosted", &body)?;
        store_image_reference(
            "hosted",
            &self.http,
            &self.blobs,
            reference,
            request,
            self.request_timeout,
        )
    }

    fn start_training(&self, request: &ProviderTrainingRequest) -> Result<String> {
        let endpoint = self.endpoint("/v1/training");
        let payload = json!({
            "owner_id": request.owner_id,
            "adapter_id": request.adapter_id,
            "training_data_uri": request.training_images_uri,
            "params": request.params,
        });
        let response = self
            .authorized(self.http.post(&endpoint))
            .timeout(self.request_timeout)
            .json(&payload)
            .send()
            .with_context(|| format!("hosted training start failed ({endpoint})"))?;
        let body = response_json_or_error("hosted training start", response)?;
        let job_id = body
            .get("job_id")
            .or_else(|| body.get("id"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty());
        match job_id {
            Some(job_id) => Ok(job_id.to_string()),
            None => bail!(
                "hosted training start returned no job_id: {}",
                sanitize_payload(&body)
            ),
        }
    }

    fn poll_training(&self, job_id: &str) -> Result<TrainingStatusReport> {
        let endpoint = self.endpoint(&format!("/v1/training/{job_id}"));
        let response = self
            .authorized(self.http.get(&endpoint))
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("hosted training poll failed ({endpoint})"))?;
        let body = response_json_or_error("hosted training poll", response)?;
        parse_training_status(&body)
    }

    fn health(&self, timeout: Duration) -> bool {
        self.http
            .get(self.endpoint("/health"))
            .timeout(timeout)
            .send()
            .map(|response| response.status().is_success())
            .unwrap_or(false)
    }
}

/// Reads `{status, result_uri?, error_message?}`.
pub fn parse_training_status(payload: &Value) -> Result<TrainingStatusReport> {
    let raw_status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let Some(status) = JobStatus::parse(raw_status) else {
        bail!("unknown training status {raw_status:?}");
    };
    let text_field = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| payload.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    };

    Ok(match status {
        JobStatus::Pending => TrainingStatusReport::Pending,
        JobStatus::Training => TrainingStatusReport::Training,
        JobStatus::Completed => TrainingStatusReport::Completed {
            result_uri: text_field(&["result_uri", "output"]),
        },
        JobStatus::Failed => TrainingStatusReport::Failed {
            error_message: text_field(&["error_message", "error"])
                .unwrap_or_else(|| format!("training {raw_status}")),
        },
    })
}
