use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use fs4::fs_std::FileExt;
use indexmap::IndexMap;
use tempfile::NamedTempFile;
use thiserror::Error;

use super::{JobStatus, StatusFields, TrainingJob};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("adapter id already exists: {0}")]
    DuplicateAdapterId(String),
    #[error("job store I/O failed ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("job store file is not valid JSON ({path}): {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("job store lock poisoned")]
    Poisoned,
}

/// Durable persistence of training-job records.
///
/// Implementations must allow concurrent `update_status` calls for different
/// jobs. They do not check state-machine legality; the orchestrator is the
/// only writer and does that itself.
pub trait JobRecordStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateAdapterId`] if the adapter id is taken.
    fn create(&self, record: TrainingJob) -> Result<TrainingJob, StoreError>;

    /// Applies `status` and `fields` in one write. `Ok(None)` when no record
    /// carries `job_id`.
    fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<Option<TrainingJob>, StoreError>;

    /// Records for one owner, most recent first.
    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<TrainingJob>, StoreError>;

    fn find_by_adapter_id(&self, adapter_id: &str) -> Result<Option<TrainingJob>, StoreError>;

    /// Records still in `pending` or `training`, oldest first.
    fn find_unfinished(&self) -> Result<Vec<TrainingJob>, StoreError>;
}

type JobMap = IndexMap<String, TrainingJob>;

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<JobMap>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut JobMap) -> T) -> Result<T, StoreError> {
        let mut guard = self.jobs.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut guard))
    }
}

impl JobRecordStore for InMemoryJobStore {
    fn create(&self, record: TrainingJob) -> Result<TrainingJob, StoreError> {
        self.with_jobs(|jobs| insert_new(jobs, record))?
    }

    fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<Option<TrainingJob>, StoreError> {
        self.with_jobs(|jobs| apply_status(jobs, job_id, status, fields).map(|(_, job)| job))
    }

    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<TrainingJob>, StoreError> {
        self.with_jobs(|jobs| owned_most_recent_first(jobs, owner_id))
    }

    fn find_by_adapter_id(&self, adapter_id: &str) -> Result<Option<TrainingJob>, StoreError> {
        self.with_jobs(|jobs| jobs.get(adapter_id).cloned())
    }

    fn find_unfinished(&self) -> Result<Vec<TrainingJob>, StoreError> {
        self.with_jobs(|jobs| unfinished_oldest_first(jobs))
    }
}

/// Job store backed by one pretty-printed JSON object keyed by adapter id.
///
/// Every write holds an exclusive lock on a sibling `.lock` file for the
/// whole read-modify-write, so handles in other threads or processes never
/// clobber each other. The file is replaced through a uniquely named temp
/// file and a rename, so readers never see a partial write and take no lock.
#[derive(Debug)]
pub struct JsonFileJobStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = OsString::from(path.as_os_str());
        lock_name.push(".lock");
        Self {
            lock_path: PathBuf::from(lock_name),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_modify<T>(
        &self,
        f: impl FnOnce(&mut JobMap) -> Result<(Option<String>, T), StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = StoreLock::acquire(&self.lock_path)?;
        let mut jobs = read_jobs(&self.path)?;
        let (dirty_key, out) = f(&mut jobs)?;
        if dirty_key.is_some() {
            write_jobs(&self.path, &jobs)?;
        }
        Ok(out)
    }

    fn read_only<T>(&self, f: impl FnOnce(&JobMap) -> T) -> Result<T, StoreError> {
        let jobs = read_jobs(&self.path)?;
        Ok(f(&jobs))
    }
}

/// Exclusive advisory lock, released on drop.
struct StoreLock {
    file: File,
}

impl StoreLock {
    fn acquire(path: &Path) -> Result<Self, StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        std::fs::create_dir_all(parent_dir(path)).map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        FileExt::lock_exclusive(&file).map_err(io_err)?;
        Ok(Self { file })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl JobRecordStore for JsonFileJobStore {
    fn create(&self, record: TrainingJob) -> Result<TrainingJob, StoreError> {
        self.read_modify(|jobs| {
            let created = insert_new(jobs, record)?;
            Ok((Some(created.adapter_id.clone()), created))
        })
    }

    fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
        fields: StatusFields,
    ) -> Result<Option<TrainingJob>, StoreError> {
        self.read_modify(|jobs| match apply_status(jobs, job_id, status, fields) {
            Some((key, job)) => Ok((Some(key), Some(job))),
            None => Ok((None, None)),
        })
    }

    fn find_by_owner(&self, owner_id: &str) -> Result<Vec<TrainingJob>, StoreError> {
        self.read_only(|jobs| owned_most_recent_first(jobs, owner_id))
    }

    fn find_by_adapter_id(&self, adapter_id: &str) -> Result<Option<TrainingJob>, StoreError> {
        self.read_only(|jobs| jobs.get(adapter_id).cloned())
    }

    fn find_unfinished(&self) -> Result<Vec<TrainingJob>, StoreError> {
        self.read_only(unfinished_oldest_first)
    }
}

fn insert_new(jobs: &mut JobMap, record: TrainingJob) -> Result<TrainingJob, StoreError> {
    if jobs.contains_key(&record.adapter_id) {
        return Err(StoreError::DuplicateAdapterId(record.adapter_id));
    }
    let record = record.normalized();
    jobs.insert(record.adapter_id.clone(), record.clone());
    Ok(record)
}

fn apply_status(
    jobs: &mut JobMap,
    job_id: &str,
    status: JobStatus,
    fields: StatusFields,
) -> Option<(String, TrainingJob)> {
    let (key, record) = jobs
        .iter_mut()
        .find(|(_, record)| record.job_id == job_id)?;
    record.apply(status, fields, Utc::now());
    Some((key.clone(), record.clone()))
}

fn owned_most_recent_first(jobs: &JobMap, owner_id: &str) -> Vec<TrainingJob> {
    // Reverse insertion order first so equal timestamps list the newest insert first.
    let mut owned = jobs
        .values()
        .rev()
        .filter(|record| record.owner_id == owner_id)
        .cloned()
        .collect::<Vec<_>>();
    owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    owned
}

fn unfinished_oldest_first(jobs: &JobMap) -> Vec<TrainingJob> {
    let mut open = jobs
        .values()
        .filter(|record| !record.status.is_terminal())
        .cloned()
        .collect::<Vec<_>>();
    open.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
    open
}

fn read_jobs(path: &Path) -> Result<JobMap, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(JobMap::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if raw.trim().is_empty() {
        return Ok(JobMap::new());
    }
    serde_json::from_str(&raw).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_jobs(path: &Path, jobs: &JobMap) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir).map_err(io_err)?;
    let body = serde_json::to_string_pretty(jobs).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(body.as_bytes()).map_err(io_err)?;
    tmp.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}
