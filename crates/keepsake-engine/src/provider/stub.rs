use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, Rgb, RgbImage};
use keepsake_contracts::jobs::TrainingStatusReport;
use keepsake_contracts::providers::{ProviderCapabilities, ProviderKind};
use sha2::{Digest, Sha256};

use super::{GenerationProvider, ProviderGenerateRequest, ProviderTrainingRequest};
use crate::blob::{generated_key, BlobStore};
use crate::compositor::{encode_png, stitch_horizontal};

const STUB_PANEL_SIZE: u32 = 256;

/// Offline provider: renders flat colour panels derived from the prompt and
/// completes every training job after a fixed number of polls.
pub struct StubProvider {
    blobs: Arc<dyn BlobStore>,
    polls_until_complete: u32,
    panel_size: u32,
    polls: Mutex<HashMap<String, u32>>,
}

impl StubProvider {
    pub fn new(blobs: Arc<dyn BlobStore>, polls_until_complete: u32) -> Self {
        Self {
            blobs,
            polls_until_complete,
            panel_size: STUB_PANEL_SIZE,
            polls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_panel_size(mut self, panel_size: u32) -> Self {
        self.panel_size = panel_size.max(1);
        self
    }

    fn render(&self, request: &ProviderGenerateRequest) -> Result<DynamicImage> {
        let prompt = request.flattened_prompt();
        let panels: Vec<DynamicImage> = (0..request.panels.max(1))
            .map(|index| {
                let (r, g, b) = color_from_prompt(&prompt, &request.owner_id, index);
                DynamicImage::ImageRgb8(RgbImage::from_pixel(
                    self.panel_size,
                    self.panel_size,
                    Rgb([r, g, b]),
                ))
            })
            .collect();
        if panels.len() == 1 {
            return panels
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("stub rendered no panels"));
        }
        Ok(stitch_horizontal(&panels)?)
    }
}

impl GenerationProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Stub
    }

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::full()
    }

    fn generate(&self, request: &ProviderGenerateRequest) -> Result<String> {
        let image = self.render(request)?;
        let bytes = encode_png(&image)?;
        self.blobs
            .put(&bytes, &generated_key(&request.owner_id, request.kind.as_str()))
            .context("stub failed storing its image")
    }

    fn start_training(&self, request: &ProviderTrainingRequest) -> Result<String> {
        let job_id = format!("stub-{}", short_id(&request.adapter_id));
        self.polls
            .lock()
            .map_err(|_| anyhow!("stub poll counter lock poisoned"))?
            .insert(job_id.clone(), 0);
        Ok(job_id)
    }

    fn poll_training(&self, job_id: &str) -> Result<TrainingStatusReport> {
        let seen = {
            let mut polls = self
                .polls
                .lock()
                .map_err(|_| anyhow!("stub poll counter lock poisoned"))?;
            let count = polls.entry(job_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if seen < self.polls_until_complete {
            return Ok(TrainingStatusReport::Training);
        }
        let result_uri = self
            .blobs
            .put(job_id.as_bytes(), &format!("adapters/{job_id}.safetensors"))
            .context("stub failed storing adapter weights")?;
        self.polls
            .lock()
            .map_err(|_| anyhow!("stub poll counter lock poisoned"))?
            .remove(job_id);
        Ok(TrainingStatusReport::Completed {
            result_uri: Some(result_uri),
        })
    }

    fn health(&self, _timeout: Duration) -> bool {
        true
    }
}

fn short_id(adapter_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(adapter_id.as_bytes());
    hex::encode(&hasher.finalize()[..6])
}

fn color_from_prompt(prompt: &str, owner_id: &str, panel: u32) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(owner_id.as_bytes());
    hasher.update(panel.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
