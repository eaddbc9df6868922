pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use store::{InMemoryJobStore, JobRecordStore, JsonFileJobStore, StoreError};

/// Lifecycle of a style-adapter training job.
///
/// Ordered `pending < training < completed | failed`; the two terminal states
/// share a rank so neither can replace the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Training,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Training => "training",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" | "starting" => Some(Self::Pending),
            "training" | "processing" | "running" => Some(Self::Training),
            "completed" | "succeeded" => Some(Self::Completed),
            "failed" | "canceled" | "cancelled" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Training => 1,
            Self::Completed | Self::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` is a real, forward transition.
    ///
    /// Same-state moves are not transitions: callers treat them as no-ops.
    pub fn can_advance_to(self, next: Self) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional fields written together with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFields {
    pub result_uri: Option<String>,
    pub error_message: Option<String>,
}

impl StatusFields {
    pub fn completed(result_uri: impl Into<String>) -> Self {
        Self {
            result_uri: Some(result_uri.into()),
            error_message: None,
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            result_uri: None,
            error_message: Some(error_message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJob {
    pub job_id: String,
    pub adapter_id: String,
    pub owner_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub training_params: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrainingJob {
    pub fn pending(
        job_id: impl Into<String>,
        adapter_id: impl Into<String>,
        owner_id: impl Into<String>,
        training_params: Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            adapter_id: adapter_id.into(),
            owner_id: owner_id.into(),
            status: JobStatus::Pending,
            result_uri: None,
            error_message: None,
            training_params,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a status write and keeps `result_uri`/`error_message` bound to
    /// the status they belong to.
    pub fn apply(&mut self, status: JobStatus, fields: StatusFields, at: DateTime<Utc>) {
        self.status = status;
        match status {
            JobStatus::Completed => {
                if fields.result_uri.is_some() {
                    self.result_uri = fields.result_uri;
                }
                self.error_message = None;
            }
            JobStatus::Failed => {
                if fields.error_message.is_some() {
                    self.error_message = fields.error_message;
                }
                self.result_uri = None;
            }
            JobStatus::Pending | JobStatus::Training => {
                self.result_uri = None;
                self.error_message = None;
            }
        }
        self.updated_at = at;
    }

    pub fn normalized(mut self) -> Self {
        let fields = StatusFields {
            result_uri: self.result_uri.take(),
            error_message: self.error_message.take(),
        };
        let at = self.updated_at;
        self.apply(self.status, fields, at);
        self
    }
}

/// Caller input for starting a training job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub owner_id: String,
    pub training_images_uri: String,
    #[serde(default)]
    pub adapter_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl TrainingRequest {
    pub fn new(owner_id: impl Into<String>, training_images_uri: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            training_images_uri: training_images_uri.into(),
            ..Self::default()
        }
    }
}

/// What a provider reports for one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainingStatusReport {
    Pending,
    Training,
    Completed { result_uri: Option<String> },
    Failed { error_message: String },
}

impl TrainingStatusReport {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Training => JobStatus::Training,
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
        }
    }
}
