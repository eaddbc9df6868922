use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;
use keepsake_contracts::generation::{
    GenerationKind, GenerationOutcome, GenerationRequest, MULTI_ANGLE_PANELS,
};
use keepsake_contracts::jobs::JobStatus;
use keepsake_contracts::providers::RouteCapabilities;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::blob::{avatar_key, generated_key, reference_grid_key, subject_key, BlobStore};
use crate::compositor::{self, Layout};
use crate::error::{error_chain_text, EngineError, EngineResult};
use crate::orchestrator::JobOrchestrator;
use crate::provider::ProviderGenerateRequest;
use crate::router::ProviderRouter;

const BLOB_ERROR_LIMIT: usize = 512;

/// A reference grid written to the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StitchedReference {
    pub uri: String,
    pub layout: Layout,
    pub description: String,
    /// Inputs that could not be loaded or decoded.
    pub skipped: Vec<String>,
}

/// Avatar and illustration generation on top of the blob store, the
/// compositor and the routed provider.
pub struct AvatarService {
    blobs: Arc<dyn BlobStore>,
    orchestrator: Arc<JobOrchestrator>,
    canvas_size: u32,
    presign_ttl: Duration,
}

impl AvatarService {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        orchestrator: Arc<JobOrchestrator>,
        canvas_size: u32,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            blobs,
            orchestrator,
            canvas_size,
            presign_ttl,
        }
    }

    fn router(&self) -> &ProviderRouter {
        self.orchestrator.router()
    }

    /// Loads every URI, skipping the ones that fail, and stores one grid.
    pub fn stitch_reference_images(
        &self,
        owner_id: &str,
        uris: &[String],
        labels: &[String],
    ) -> EngineResult<StitchedReference> {
        let mut images: Vec<DynamicImage> = Vec::new();
        let mut kept_labels: Vec<String> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        for (index, uri) in uris.iter().enumerate() {
            let loaded = self
                .blobs
                .get(uri)
                .map_err(|err| error_chain_text(&err, BLOB_ERROR_LIMIT))
                .and_then(|bytes| compositor::decode(&bytes).map_err(|err| err.to_string()));
            match loaded {
                Ok(image) => {
                    images.push(image);
                    kept_labels.push(labels.get(index).cloned().unwrap_or_default());
                }
                Err(error) => {
                    warn!(uri = %uri, error = %error, "skipping unreadable reference image");
                    skipped.push(uri.clone());
                }
            }
        }

        let (grid, layout) = compositor::stitch(&images, self.canvas_size)?;
        let bytes = compositor::encode_png(&grid)?;
        let uri = self.put(&bytes, &reference_grid_key(owner_id))?;
        Ok(StitchedReference {
            uri,
            layout,
            description: compositor::describe_layout(&layout, &kept_labels),
            skipped,
        })
    }

    /// Resolves the style adapter, presigns references and generates through
    /// the router.
    pub fn generate_with_fallback(
        &self,
        request: &GenerationRequest,
    ) -> EngineResult<GenerationOutcome> {
        let owner_id = request.owner_id.trim();
        if owner_id.is_empty() {
            return Err(EngineError::Validation("owner id is required".to_string()));
        }
        let capabilities = self.router().capabilities();
        if request.kind == GenerationKind::MultiAngle {
            ensure_multi_angle(&capabilities)?;
        }
        if !request.reference_images.is_empty()
            && capabilities.primary_enabled
            && !capabilities.features.reference_images
        {
            return Err(EngineError::Unsupported(format!(
                "reference images on the {} backend",
                capabilities.primary
            )));
        }

        let adapter_uri = self.resolve_adapter(owner_id, request.adapter_id.as_deref())?;
        let reference_images = request
            .reference_images
            .iter()
            .map(|uri| self.presign(uri))
            .collect::<EngineResult<Vec<_>>>()?;

        let mut metadata = request.metadata.clone();
        if let Some(adapter_id) = request.adapter_id.as_ref() {
            metadata.insert("adapter_id".to_string(), json!(adapter_id));
        }
        let provider_request = ProviderGenerateRequest {
            owner_id: owner_id.to_string(),
            kind: request.kind,
            prompt: request.prompt.clone().unwrap_or_default(),
            style: request.style.clone(),
            reference_images,
            reference_labels: request.reference_labels.clone(),
            adapter_uri,
            panels: request.kind.panels(),
            metadata,
        };
        let outcome = self.router().generate(&provider_request)?;
        info!(
            owner_id,
            kind = request.kind.as_str(),
            provider = %outcome.provider,
            "generation finished"
        );
        Ok(outcome)
    }

    /// Illustrates the owner's uploaded subject photo.
    pub fn generate_subject(&self, owner_id: &str) -> EngineResult<GenerationOutcome> {
        let reference = self.require_reference(&subject_key(owner_id), "subject image")?;
        self.generate_with_fallback(&GenerationRequest::subject(owner_id).with_references(vec![reference]))
    }

    /// Illustrates a memory with the owner's avatar as reference.
    pub fn generate_memory(&self, owner_id: &str, prompt: &str) -> EngineResult<GenerationOutcome> {
        if prompt.trim().is_empty() {
            return Err(EngineError::Validation("memory prompt is required".to_string()));
        }
        let reference = self.require_reference(&avatar_key(owner_id), "avatar")?;
        self.generate_with_fallback(
            &GenerationRequest::memory(owner_id, prompt.trim()).with_references(vec![reference]),
        )
    }

    /// Stitches the references, asks for a left/front/right strip and keeps
    /// the front view.
    pub fn generate_multi_angle(
        &self,
        owner_id: &str,
        uris: &[String],
        labels: &[String],
    ) -> EngineResult<GenerationOutcome> {
        ensure_multi_angle(&self.router().capabilities())?;
        let stitched = self.stitch_reference_images(owner_id, uris, labels)?;
        let mut request = GenerationRequest::multi_angle(owner_id, vec![stitched.uri.clone()]);
        request.prompt = Some(stitched.description.clone());
        request.reference_labels = labels.to_vec();
        request
            .metadata
            .insert("reference_grid".to_string(), json!(stitched.uri));

        let outcome = self.generate_with_fallback(&request)?;
        let front = self.extract_primary_angle(owner_id, &outcome.image_uri, MULTI_ANGLE_PANELS)?;
        Ok(GenerationOutcome {
            image_uri: front,
            ..outcome
        })
    }

    /// Cuts the centre panel out of a stored strip and stores it.
    pub fn extract_primary_angle(
        &self,
        owner_id: &str,
        uri: &str,
        total_panels: u32,
    ) -> EngineResult<String> {
        let bytes = self
            .blobs
            .get(uri)
            .map_err(|err| EngineError::Blob(error_chain_text(&err, BLOB_ERROR_LIMIT)))?;
        let strip = compositor::decode(&bytes)?;
        let front = compositor::extract_center_panel(&strip, total_panels)?;
        let encoded = compositor::encode_png(&front)?;
        self.put(&encoded, &generated_key(owner_id, "avatar"))
    }

    fn resolve_adapter(
        &self,
        owner_id: &str,
        adapter_id: Option<&str>,
    ) -> EngineResult<Option<String>> {
        let Some(adapter_id) = adapter_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(self
                .orchestrator
                .most_recent_completed(owner_id)?
                .and_then(|job| job.result_uri));
        };
        let job = self
            .orchestrator
            .get_job(adapter_id)?
            .ok_or_else(|| EngineError::NotFound(format!("adapter {adapter_id}")))?;
        if job.status != JobStatus::Completed {
            return Err(EngineError::Validation(format!(
                "adapter {adapter_id} is {}, not completed",
                job.status
            )));
        }
        Ok(job.result_uri)
    }

    fn require_reference(&self, key: &str, what: &str) -> EngineResult<String> {
        let uri = self.blobs.uri_for(key);
        if self.blobs.presign(&uri, self.presign_ttl).is_err() {
            return Err(EngineError::NotFound(format!("{what} at {uri}")));
        }
        Ok(uri)
    }

    fn presign(&self, uri: &str) -> EngineResult<String> {
        self.blobs
            .presign(uri, self.presign_ttl)
            .map_err(|err| EngineError::Blob(error_chain_text(&err, BLOB_ERROR_LIMIT)))
    }

    fn put(&self, bytes: &[u8], key: &str) -> EngineResult<String> {
        self.blobs
            .put(bytes, key)
            .map_err(|err| EngineError::Blob(error_chain_text(&err, BLOB_ERROR_LIMIT)))
    }
}

/// A disabled primary is reported before any missing feature.
fn ensure_multi_angle(capabilities: &RouteCapabilities) -> EngineResult<()> {
    if !capabilities.primary_enabled {
        return Err(EngineError::ProviderDisabled(format!(
            "{} backend is disabled",
            capabilities.primary
        )));
    }
    if !capabilities.supports_multi_angle() {
        return Err(EngineError::Unsupported(
            "multi-angle generation".to_string(),
        ));
    }
    Ok(())
}
