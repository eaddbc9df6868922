pub mod avatar;
pub mod blob;
pub mod compositor;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keepsake_contracts::events::EventWriter;
use keepsake_contracts::jobs::{JobRecordStore, JsonFileJobStore};

pub use avatar::{AvatarService, StitchedReference};
pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use config::{EngineConfig, PollSettings, TrainingDefaults};
pub use error::{CompositeError, EngineError, EngineResult};
pub use orchestrator::{JobOrchestrator, PollExit, ReconcileReport};
pub use provider::GenerationProvider;
pub use router::{ProviderRouter, RouterSettings};

/// Everything wired from one [`EngineConfig`]: file-backed job store, event
/// log, directory blob store and the configured provider route.
pub struct KeepsakeEngine {
    config: EngineConfig,
    events: EventWriter,
    blobs: Arc<dyn BlobStore>,
    orchestrator: Arc<JobOrchestrator>,
    avatars: AvatarService,
}

impl KeepsakeEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("failed creating {}", config.data_dir.display()))?;

        let events = EventWriter::new(config.events_path(), "keepsake");
        let blobs: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::new(config.blob_root(), config.blob_bucket.clone()));
        let store: Arc<dyn JobRecordStore> = Arc::new(JsonFileJobStore::new(config.jobs_path()));
        let router = ProviderRouter::from_config(&config, Arc::clone(&blobs), events.clone());
        let orchestrator = Arc::new(
            JobOrchestrator::new(store, Arc::new(router), events.clone(), config.poll_settings())
                .with_training_defaults(config.training.clone()),
        );
        let avatars = AvatarService::new(
            Arc::clone(&blobs),
            Arc::clone(&orchestrator),
            config.canvas_size_pixels,
            Duration::from_secs(config.presign_ttl_seconds),
        );
        Ok(Self {
            config,
            events,
            blobs,
            orchestrator,
            avatars,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn orchestrator(&self) -> &JobOrchestrator {
        &self.orchestrator
    }

    pub fn router(&self) -> &ProviderRouter {
        self.orchestrator.router()
    }

    pub fn avatars(&self) -> &AvatarService {
        &self.avatars
    }
}

#[cfg(test)]
mod tests {
    use keepsake_contracts::events::read_events;
    use keepsake_contracts::jobs::{JobStatus, TrainingRequest};

    use super::{EngineConfig, KeepsakeEngine};

    #[test]
    fn stub_mode_trains_end_to_end_on_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let config = EngineConfig {
            stub_mode: true,
            poll_interval_seconds: 0.005,
            max_poll_attempts: 20,
            data_dir: temp.path().to_path_buf(),
            ..EngineConfig::default()
        };
        let engine = KeepsakeEngine::new(config)?;

        let uploads = engine.blobs().put(b"zip", "uploads/u1.zip")?;
        let adapter_id = engine
            .orchestrator()
            .start_training(TrainingRequest::new("u1", uploads))?;
        let job = engine.orchestrator().join(&adapter_id)?;

        assert_eq!(job.status, JobStatus::Completed);
        let result_uri = job.result_uri.unwrap_or_default();
        assert!(result_uri.starts_with("fs://keepsake/adapters/"));
        assert!(temp.path().join("jobs.json").is_file());

        let reopened = KeepsakeEngine::new(engine.config().clone())?;
        let latest = reopened.orchestrator().most_recent_completed("u1")?;
        assert_eq!(latest.map(|job| job.adapter_id), Some(adapter_id));
        assert!(!read_events(&temp.path().join("events.jsonl")).is_empty());
        Ok(())
    }
}
