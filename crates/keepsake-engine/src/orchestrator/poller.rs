use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use keepsake_contracts::events::{EventPayload, EventWriter};
use keepsake_contracts::jobs::{
    JobRecordStore, JobStatus, StatusFields, StoreError, TrainingJob, TrainingStatusReport,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::PollSettings;
use crate::error::{EngineError, EngineResult, POLLING_TIMEOUT_MESSAGE};
use crate::router::ProviderRouter;

pub(crate) const MISSING_RESULT_MESSAGE: &str =
    "provider reported completion without a result uri";

/// Everything a polling worker needs; shared by all workers of one
/// orchestrator.
pub(crate) struct PollContext {
    pub store: Arc<dyn JobRecordStore>,
    pub router: Arc<ProviderRouter>,
    pub events: EventWriter,
    pub settings: PollSettings,
}

impl PollContext {
    pub(crate) fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.events.emit(event_type, payload) {
            warn!(event_type, error = %err, "failed to record event");
        }
    }

    /// Writes a forward transition and logs it. Non-forward moves are skipped.
    pub(crate) fn transition(
        &self,
        record: &TrainingJob,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<Option<TrainingJob>, StoreError> {
        if !record.status.can_advance_to(status) {
            return Ok(None);
        }
        let Some(updated) = self.store.update_status(&record.job_id, status, fields)? else {
            return Ok(None);
        };
        info!(
            adapter_id = %updated.adapter_id,
            from = %record.status,
            to = %updated.status,
            "training job status changed"
        );
        let mut payload = EventPayload::new();
        payload.insert("adapter_id".to_string(), json!(updated.adapter_id));
        payload.insert("job_id".to_string(), json!(updated.job_id));
        payload.insert("owner_id".to_string(), json!(updated.owner_id));
        payload.insert("from".to_string(), json!(record.status.as_str()));
        payload.insert("to".to_string(), json!(updated.status.as_str()));
        if let Some(uri) = updated.result_uri.as_ref() {
            payload.insert("result_uri".to_string(), json!(uri));
        }
        if let Some(message) = updated.error_message.as_ref() {
            payload.insert("error_message".to_string(), json!(message));
        }
        self.emit("job_status_changed", payload);
        Ok(Some(updated))
    }
}

/// Status write implied by a provider report; `None` means nothing to write.
pub(crate) fn report_transition(report: TrainingStatusReport) -> Option<(JobStatus, StatusFields)> {
    match report {
        TrainingStatusReport::Pending => None,
        TrainingStatusReport::Training => Some((JobStatus::Training, StatusFields::default())),
        TrainingStatusReport::Completed {
            result_uri: Some(result_uri),
        } => Some((JobStatus::Completed, StatusFields::completed(result_uri))),
        TrainingStatusReport::Completed { result_uri: None } => Some((
            JobStatus::Failed,
            StatusFields::failed(MISSING_RESULT_MESSAGE),
        )),
        TrainingStatusReport::Failed { error_message } => {
            Some((JobStatus::Failed, StatusFields::failed(error_message)))
        }
    }
}

/// Why a polling worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollExit {
    /// The worker wrote this terminal status.
    Finished(JobStatus),
    /// Someone else had already finished the record.
    AlreadyTerminal(JobStatus),
    TimedOut,
    /// The record disappeared from the store.
    Vanished,
    Stopped,
    Panicked,
}

enum PollCommand {
    Stop,
}

struct PollWorkerHandle {
    sender: mpsc::Sender<PollCommand>,
    stop_flag: Arc<AtomicBool>,
    handle: thread::JoinHandle<PollExit>,
}

impl PollWorkerHandle {
    fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let _ = self.sender.send(PollCommand::Stop);
    }

    fn join(self) -> PollExit {
        self.handle.join().unwrap_or(PollExit::Panicked)
    }
}

/// Owns one polling thread per live job id and refuses to start a second.
#[derive(Default)]
pub(crate) struct PollSupervisor {
    workers: Mutex<HashMap<String, PollWorkerHandle>>,
}

impl PollSupervisor {
    /// Starts a worker with `max_attempts` polls. `Ok(false)` when a live
    /// worker already owns the job.
    pub(crate) fn spawn(
        &self,
        ctx: &Arc<PollContext>,
        record: &TrainingJob,
        max_attempts: u32,
    ) -> EngineResult<bool> {
        let mut workers = self.lock()?;
        reap_finished(&mut workers);
        if workers.contains_key(&record.job_id) {
            return Ok(false);
        }

        let (sender, receiver) = mpsc::channel();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let worker = PollWorker {
            ctx: Arc::clone(ctx),
            job_id: record.job_id.clone(),
            adapter_id: record.adapter_id.clone(),
            max_attempts: max_attempts.max(1),
            stop_flag: Arc::clone(&stop_flag),
        };
        let handle = thread::Builder::new()
            .name(thread_name(&record.adapter_id))
            .spawn(move || worker.run(receiver))
            .map_err(|err| EngineError::Worker(format!("poll thread spawn failed: {err}")))?;
        debug!(job_id = %record.job_id, max_attempts, "polling worker started");
        workers.insert(
            record.job_id.clone(),
            PollWorkerHandle {
                sender,
                stop_flag,
                handle,
            },
        );
        Ok(true)
    }

    pub(crate) fn is_polling(&self, job_id: &str) -> EngineResult<bool> {
        let mut workers = self.lock()?;
        reap_finished(&mut workers);
        Ok(workers.contains_key(job_id))
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.workers.lock().map(|workers| workers.len()).unwrap_or(0)
    }

    /// Blocks until the worker for `job_id` ends. `None` if there is none.
    pub(crate) fn join(&self, job_id: &str) -> EngineResult<Option<PollExit>> {
        let worker = self.lock()?.remove(job_id);
        Ok(worker.map(PollWorkerHandle::join))
    }

    /// Stops every worker and waits for them. Records are left as they are.
    pub(crate) fn shutdown(&self) -> usize {
        let drained: Vec<PollWorkerHandle> = match self.workers.lock() {
            Ok(mut workers) => workers.drain().map(|(_, worker)| worker).collect(),
            Err(_) => return 0,
        };
        for worker in &drained {
            worker.request_stop();
        }
        let count = drained.len();
        for worker in drained {
            let _ = worker.join();
        }
        count
    }

    fn lock(&self) -> EngineResult<std::sync::MutexGuard<'_, HashMap<String, PollWorkerHandle>>> {
        self.workers
            .lock()
            .map_err(|_| EngineError::Worker("poll supervisor lock poisoned".to_string()))
    }
}

/// Joins and drops every worker whose thread has already returned.
fn reap_finished(workers: &mut HashMap<String, PollWorkerHandle>) {
    let finished: Vec<String> = workers
        .iter()
        .filter(|(_, worker)| worker.handle.is_finished())
        .map(|(job_id, _)| job_id.clone())
        .collect();
    for job_id in finished {
        if let Some(worker) = workers.remove(&job_id) {
            let exit = worker.join();
            debug!(job_id = %job_id, ?exit, "polling worker reaped");
        }
    }
}

fn thread_name(adapter_id: &str) -> String {
    let short: String = adapter_id.chars().take(8).collect();
    format!("keepsake-poll-{short}")
}

struct PollWorker {
    ctx: Arc<PollContext>,
    job_id: String,
    adapter_id: String,
    max_attempts: u32,
    stop_flag: Arc<AtomicBool>,
}

impl PollWorker {
    fn run(self, rx: mpsc::Receiver<PollCommand>) -> PollExit {
        for attempt in 1..=self.max_attempts {
            if self.wait_interval(&rx) {
                debug!(job_id = %self.job_id, attempt, "polling worker stopped");
                return PollExit::Stopped;
            }
            if let Some(exit) = self.tick(attempt) {
                return exit;
            }
        }
        self.time_out()
    }

    /// Sleeps one interval; `true` when asked to stop.
    fn wait_interval(&self, rx: &mpsc::Receiver<PollCommand>) -> bool {
        if self.stop_flag.load(Ordering::SeqCst) {
            return true;
        }
        match rx.recv_timeout(self.ctx.settings.interval) {
            Ok(PollCommand::Stop) => true,
            Err(mpsc::RecvTimeoutError::Timeout) => self.stop_flag.load(Ordering::SeqCst),
            Err(mpsc::RecvTimeoutError::Disconnected) => true,
        }
    }

    fn current_record(&self) -> Result<Option<TrainingJob>, StoreError> {
        Ok(self
            .ctx
            .store
            .find_by_adapter_id(&self.adapter_id)?
            .filter(|record| record.job_id == self.job_id))
    }

    fn tick(&self, attempt: u32) -> Option<PollExit> {
        let record = match self.current_record() {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(adapter_id = %self.adapter_id, "training job record vanished; polling stops");
                return Some(PollExit::Vanished);
            }
            Err(err) => {
                self.poll_error(attempt, &err.to_string());
                return None;
            }
        };
        if record.status.is_terminal() {
            return Some(PollExit::AlreadyTerminal(record.status));
        }

        let report = match self.ctx.router.poll_training(&self.job_id) {
            Ok(report) => report,
            Err(err) => {
                self.poll_error(attempt, &err.to_string());
                return None;
            }
        };
        let (status, fields) = report_transition(report)?;
        match self.ctx.transition(&record, status, fields) {
            Ok(_) if status.is_terminal() => Some(PollExit::Finished(status)),
            Ok(_) => None,
            Err(err) => {
                self.poll_error(attempt, &err.to_string());
                None
            }
        }
    }

    fn time_out(&self) -> PollExit {
        let record = match self.current_record() {
            Ok(Some(record)) => record,
            Ok(None) => return PollExit::Vanished,
            Err(err) => {
                warn!(adapter_id = %self.adapter_id, error = %err, "could not record polling timeout");
                return PollExit::TimedOut;
            }
        };
        if record.status.is_terminal() {
            return PollExit::AlreadyTerminal(record.status);
        }
        let timeout = EngineError::PollingTimeout {
            attempts: self.max_attempts,
        };
        warn!(adapter_id = %self.adapter_id, error = %timeout, "training job timed out");
        if let Err(err) = self.ctx.transition(
            &record,
            JobStatus::Failed,
            StatusFields::failed(POLLING_TIMEOUT_MESSAGE),
        ) {
            warn!(adapter_id = %self.adapter_id, error = %err, "could not record polling timeout");
        }
        let mut payload = EventPayload::new();
        payload.insert("adapter_id".to_string(), json!(self.adapter_id));
        payload.insert("job_id".to_string(), json!(self.job_id));
        payload.insert("attempts".to_string(), json!(self.max_attempts));
        payload.insert("error".to_string(), json!(timeout.to_string()));
        self.ctx.emit("job_timed_out", payload);
        PollExit::TimedOut
    }

    fn poll_error(&self, attempt: u32, error: &str) {
        warn!(adapter_id = %self.adapter_id, attempt, error, "training poll failed; retrying");
        let mut payload = EventPayload::new();
        payload.insert("adapter_id".to_string(), json!(self.adapter_id));
        payload.insert("job_id".to_string(), json!(self.job_id));
        payload.insert("attempt".to_string(), json!(attempt));
        payload.insert("error".to_string(), json!(error));
        self.ctx.emit("poll_error", payload);
    }
}
