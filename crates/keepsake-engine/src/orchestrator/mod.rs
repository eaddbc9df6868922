mod poller;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keepsake_contracts::events::{EventPayload, EventWriter};
use keepsake_contracts::jobs::{
    JobRecordStore, JobStatus, StatusFields, TrainingJob, TrainingRequest, TrainingStatusReport,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PollSettings, TrainingDefaults};
use crate::error::{EngineError, EngineResult, POLLING_TIMEOUT_MESSAGE};
use crate::provider::ProviderTrainingRequest;
use crate::router::ProviderRouter;

pub use poller::PollExit;
use poller::{report_transition, PollContext, PollSupervisor};

/// Outcome of a restart reconciliation, by adapter id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Fresh records that got a polling worker again.
    pub resumed: Vec<String>,
    /// Stale records the provider had already finished.
    pub finalized: Vec<String>,
    /// Stale records marked failed with the polling timeout.
    pub timed_out: Vec<String>,
    /// Records whose worker is still alive in this process.
    pub already_polling: Vec<String>,
}

/// Owns the training-job state machine and one polling worker per job.
pub struct JobOrchestrator {
    ctx: Arc<PollContext>,
    training_defaults: TrainingDefaults,
    supervisor: PollSupervisor,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobRecordStore>,
        router: Arc<ProviderRouter>,
        events: EventWriter,
        settings: PollSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(PollContext {
                store,
                router,
                events,
                settings,
            }),
            training_defaults: TrainingDefaults::default(),
            supervisor: PollSupervisor::default(),
        }
    }

    pub fn with_training_defaults(mut self, defaults: TrainingDefaults) -> Self {
        self.training_defaults = defaults;
        self
    }

    pub fn router(&self) -> &Arc<ProviderRouter> {
        &self.ctx.router
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.ctx.settings
    }

    /// Starts a remote training job and returns its adapter id without
    /// waiting for the job.
    pub fn start_training(&self, request: TrainingRequest) -> EngineResult<String> {
        let owner_id = request.owner_id.trim();
        if owner_id.is_empty() {
            return Err(EngineError::Validation("owner id is required".to_string()));
        }
        let training_images_uri = request.training_images_uri.trim();
        if training_images_uri.is_empty() {
            return Err(EngineError::Validation(
                "training data uri is required".to_string(),
            ));
        }

        let adapter_id = match request
            .adapter_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(adapter_id) => {
                if self.ctx.store.find_by_adapter_id(adapter_id)?.is_some() {
                    return Err(EngineError::DuplicateAdapterId(adapter_id.to_string()));
                }
                adapter_id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        let mut params = request.params.clone();
        self.training_defaults.fill(&mut params);
        if let Some(name) = request.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
            params.insert("name".to_string(), Value::String(name.to_string()));
        }

        let job_id = self.ctx.router.start_training(&ProviderTrainingRequest {
            owner_id: owner_id.to_string(),
            adapter_id: adapter_id.clone(),
            training_images_uri: training_images_uri.to_string(),
            params: params.clone(),
        })?;

        let record = match self.ctx.store.create(TrainingJob::pending(
            job_id.as_str(),
            adapter_id.as_str(),
            owner_id,
            params,
        )) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    adapter_id = %adapter_id,
                    job_id = %job_id,
                    error = %err,
                    "remote training job left without a record"
                );
                let mut payload = EventPayload::new();
                payload.insert("adapter_id".to_string(), json!(adapter_id));
                payload.insert("job_id".to_string(), json!(job_id));
                payload.insert("owner_id".to_string(), json!(owner_id));
                payload.insert("error".to_string(), json!(err.to_string()));
                self.ctx.emit("job_orphaned", payload);
                return Err(err.into());
            }
        };
        info!(adapter_id = %record.adapter_id, job_id = %record.job_id, "training job created");
        let mut payload = EventPayload::new();
        payload.insert("adapter_id".to_string(), json!(record.adapter_id));
        payload.insert("job_id".to_string(), json!(record.job_id));
        payload.insert("owner_id".to_string(), json!(record.owner_id));
        payload.insert("training_images_uri".to_string(), json!(training_images_uri));
        self.ctx.emit("job_created", payload);

        self.supervisor
            .spawn(&self.ctx, &record, self.ctx.settings.max_attempts)?;
        Ok(adapter_id)
    }

    pub fn get_job(&self, adapter_id: &str) -> EngineResult<Option<TrainingJob>> {
        Ok(self.ctx.store.find_by_adapter_id(adapter_id)?)
    }

    /// Most recent first.
    pub fn list_jobs(&self, owner_id: &str) -> EngineResult<Vec<TrainingJob>> {
        Ok(self.ctx.store.find_by_owner(owner_id)?)
    }

    /// The newest completed adapter, ignoring anything that failed later.
    pub fn most_recent_completed(&self, owner_id: &str) -> EngineResult<Option<TrainingJob>> {
        Ok(self
            .list_jobs(owner_id)?
            .into_iter()
            .find(|job| job.status == JobStatus::Completed))
    }

    pub fn is_polling(&self, adapter_id: &str) -> EngineResult<bool> {
        match self.get_job(adapter_id)? {
            Some(job) => self.supervisor.is_polling(&job.job_id),
            None => Ok(false),
        }
    }

    /// Restart recovery for records left in `pending`/`training`.
    ///
    /// Records untouched for longer than the whole polling budget get one
    /// final poll; anything short of a terminal answer fails them with the
    /// polling timeout. Younger records resume polling with the attempts
    /// they have left.
    pub fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let settings = self.ctx.settings;
        let max_duration = settings.max_duration();
        let now = Utc::now();
        let mut report = ReconcileReport::default();

        for job in self.ctx.store.find_unfinished()? {
            if self.supervisor.is_polling(&job.job_id)? {
                report.already_polling.push(job.adapter_id);
                continue;
            }
            let age = (now - job.updated_at).to_std().unwrap_or(Duration::ZERO);
            if age >= max_duration {
                if self.finalize_stale(&job)? {
                    report.finalized.push(job.adapter_id);
                } else {
                    report.timed_out.push(job.adapter_id);
                }
                continue;
            }

            let remaining = remaining_attempts(settings, age);
            if self.supervisor.spawn(&self.ctx, &job, remaining)? {
                info!(adapter_id = %job.adapter_id, remaining, "resumed polling");
                report.resumed.push(job.adapter_id);
            } else {
                report.already_polling.push(job.adapter_id);
            }
        }

        let mut payload = EventPayload::new();
        payload.insert("resumed".to_string(), json!(report.resumed));
        payload.insert("finalized".to_string(), json!(report.finalized));
        payload.insert("timed_out".to_string(), json!(report.timed_out));
        payload.insert("already_polling".to_string(), json!(report.already_polling));
        self.ctx.emit("jobs_reconciled", payload);
        Ok(report)
    }

    /// Returns `true` if the provider had a terminal answer for the job.
    fn finalize_stale(&self, job: &TrainingJob) -> EngineResult<bool> {
        let answer = match self.ctx.router.poll_training(&job.job_id) {
            Ok(report @ (TrainingStatusReport::Completed { .. } | TrainingStatusReport::Failed { .. })) => {
                report_transition(report)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(adapter_id = %job.adapter_id, error = %err, "final poll of stale job failed");
                None
            }
        };
        if let Some((status, fields)) = answer {
            self.ctx.transition(job, status, fields)?;
            return Ok(true);
        }

        warn!(adapter_id = %job.adapter_id, "stale training job marked as timed out");
        self.ctx.transition(
            job,
            JobStatus::Failed,
            StatusFields::failed(POLLING_TIMEOUT_MESSAGE),
        )?;
        let mut payload = EventPayload::new();
        payload.insert("adapter_id".to_string(), json!(job.adapter_id));
        payload.insert("job_id".to_string(), json!(job.job_id));
        payload.insert("reason".to_string(), json!("stale on reconcile"));
        self.ctx.emit("job_timed_out", payload);
        Ok(false)
    }

    /// Waits for the job's polling worker, if any, and returns the record.
    pub fn join(&self, adapter_id: &str) -> EngineResult<TrainingJob> {
        let job = self
            .get_job(adapter_id)?
            .ok_or_else(|| EngineError::NotFound(format!("training job {adapter_id}")))?;
        self.supervisor.join(&job.job_id)?;
        self.get_job(adapter_id)?
            .ok_or_else(|| EngineError::NotFound(format!("training job {adapter_id}")))
    }

    /// Stops every polling worker without touching their records; the next
    /// `reconcile` picks them up.
    pub fn shutdown(&self) -> usize {
        let stopped = self.supervisor.shutdown();
        if stopped > 0 {
            info!(stopped, "polling workers stopped");
        }
        stopped
    }
}

fn remaining_attempts(settings: PollSettings, elapsed: Duration) -> u32 {
    let interval = settings.interval.as_secs_f64();
    if interval <= 0.0 {
        return settings.max_attempts.max(1);
    }
    let used = (elapsed.as_secs_f64() / interval).floor();
    let used = if used >= f64::from(settings.max_attempts) {
        settings.max_attempts
    } else {
        used as u32
    };
    settings.max_attempts.saturating_sub(used).max(1)
}
