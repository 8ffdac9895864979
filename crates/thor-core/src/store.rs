pub mod data;

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use fs2::FileExt;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobRecord, JobStatus, LogEntry, LogLevel, Params};
use data::{JobDb, Loaded};

/// JSON-file job store.
///
/// The file is the only state. Every operation takes the in-process lock and
/// an exclusive lock on `<path>.lock`, reads the whole document, and for
/// mutations writes it back atomically before releasing. Separate processes
/// opening the same path therefore see each other's changes.
pub struct JobStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

/// Held for the duration of one operation.
struct StoreLock<'a> {
    _guard: MutexGuard<'a, ()>,
    file: File,
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl JobStore {
    /// Opens the store at `path`, (re)initialising it when the file is missing
    /// or its top-level shape is invalid.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Write {
                path: path.clone(),
                source,
            })?;
        }

        let store = Self {
            lock_path: data::sibling(&path, ".lock"),
            path,
            lock: Mutex::new(()),
        };

        let lock = store.lock()?;
        let jobs = match JobDb::load(&store.path)? {
            Loaded::Ok(db) => db.jobs.len(),
            Loaded::Reset(reason) => {
                warn!("Resetting job store at {} ({reason})", store.path.display());
                JobDb::default().persist(&store.path)?;
                0
            }
        };
        drop(lock);

        info!("Opened job store at {} with {jobs} jobs", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<StoreLock<'_>, StoreError> {
        let guard = self.lock.lock().map_err(|_| StoreError::LockPoisoned)?;
        let lock_err = |source| StoreError::Lock {
            path: self.lock_path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(lock_err)?;
        file.lock_exclusive().map_err(lock_err)?;
        Ok(StoreLock {
            _guard: guard,
            file,
        })
    }

    /// Current document. A file that vanished or was mangled since `open`
    /// reads as empty.
    fn load(&self) -> Result<JobDb, StoreError> {
        match JobDb::load(&self.path)? {
            Loaded::Ok(db) => Ok(db),
            Loaded::Reset(reason) => {
                warn!("Job store {} unusable ({reason})", self.path.display());
                Ok(JobDb::default())
            }
        }
    }

    /// Reads the document under the lock and hands it to `f`.
    fn read<T>(&self, f: impl FnOnce(&JobDb) -> T) -> Result<T, StoreError> {
        let _lock = self.lock()?;
        Ok(f(&self.load()?))
    }

    /// Reads the document, runs `f` on it and writes it back if anything
    /// changed. The lock is held from the read until the rename has completed.
    fn mutate<T>(&self, f: impl FnOnce(&mut JobDb) -> T) -> Result<T, StoreError> {
        let _lock = self.lock()?;
        let mut db = self.load()?;
        let before = db.clone();
        let out = f(&mut db);
        if db != before {
            db.persist(&self.path)?;
        }
        Ok(out)
    }

    /// Creates a `pending` job and returns its id.
    pub fn add_job(&self, job_type: &str, params: Params) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let record = JobRecord::new(id.clone(), job_type.to_string(), params, Utc::now());

        self.mutate(|db| {
            db.logs.entry(id.clone()).or_default();
            db.jobs.push(record);
        })?;

        debug!("Added {job_type} job {id}");
        Ok(id)
    }

    /// Appends a log line to a job. Missing jobs are ignored and persistence
    /// failures are only reported through the application log.
    pub fn add_log(&self, id: &str, msg: impl Into<String>, level: LogLevel) {
        let entry = LogEntry {
            ts: Utc::now(),
            level,
            msg: msg.into(),
        };

        let result = self.mutate(|db| {
            if db.find(id).is_none() {
                return false;
            }
            db.logs.entry(id.to_string()).or_default().push(entry);
            true
        });

        match result {
            Ok(true) => {}
            Ok(false) => debug!("Dropping log line for unknown job {id}"),
            Err(e) => warn!("Failed to append log for job {id}: {e}"),
        }
    }

    pub fn get_logs(&self, id: &str) -> Result<Vec<LogEntry>, StoreError> {
        self.read(|db| db.logs.get(id).cloned().unwrap_or_default())
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.read(|db| db.find(id).cloned())
    }

    /// Overwrites a job's status. `error_msg` is kept only for `error`.
    /// Returns `false` when the job does not exist.
    pub fn set_status(
        &self,
        id: &str,
        status: JobStatus,
        error_msg: Option<String>,
    ) -> Result<bool, StoreError> {
        self.mutate(|db| {
            let Some(job) = db.find_mut(id) else {
                return false;
            };
            job.status = status;
            job.updated_at = Utc::now();
            job.error_msg = match status {
                JobStatus::Error => error_msg.filter(|m| !m.is_empty()),
                _ => None,
            };
            true
        })
    }

    /// Claims the oldest pending job, marking it `running`. `None` means the
    /// queue is empty.
    pub fn pop_next_pending(&self) -> Result<Option<JobRecord>, StoreError> {
        self.mutate(|db| {
            // min_by_key keeps the first of equal keys, i.e. insertion order.
            let job = db
                .jobs
                .iter_mut()
                .filter(|j| j.status == JobStatus::Pending)
                .min_by_key(|j| j.created_at)?;
            job.status = JobStatus::Running;
            job.updated_at = Utc::now();
            Some(job.clone())
        })
    }

    /// All jobs, newest first, optionally restricted to one status.
    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs: Vec<JobRecord> = self.read(|db| {
            db.jobs
                .iter()
                .rev()
                .filter(|j| status.is_none_or(|s| j.status == s))
                .cloned()
                .collect()
        })?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    pub fn counts_by_status(&self) -> Result<BTreeMap<JobStatus, usize>, StoreError> {
        self.read(|db| {
            let mut counts: BTreeMap<JobStatus, usize> =
                JobStatus::ALL.into_iter().map(|s| (s, 0)).collect();
            for job in &db.jobs {
                *counts.entry(job.status).or_default() += 1;
            }
            counts
        })
    }

    /// Deletes every job in `status` together with its logs.
    pub fn clear_by_status(&self, status: JobStatus) -> Result<usize, StoreError> {
        let removed = self.mutate(|db| {
            let (gone, kept): (Vec<_>, Vec<_>) =
                db.jobs.drain(..).partition(|j| j.status == status);
            db.jobs = kept;
            for job in &gone {
                db.logs.remove(&job.id);
            }
            gone.len()
        })?;

        if removed > 0 {
            info!("Cleared {removed} {status} jobs");
        }
        Ok(removed)
    }

    /// Moves every job in `status` back to `pending`.
    ///
    /// Requeueing `running` is accepted here but is an operator-only action: a
    /// worker that is still executing the job will finish it and the job will
    /// then run again.
    pub fn requeue_from_status(&self, status: JobStatus) -> Result<usize, StoreError> {
        let now = Utc::now();
        let changed = self.mutate(|db| {
            let mut n = 0;
            for job in db.jobs.iter_mut().filter(|j| j.status == status) {
                job.status = JobStatus::Pending;
                job.error_msg = None;
                job.updated_at = now;
                n += 1;
            }
            n
        })?;

        if changed > 0 {
            info!("Requeued {changed} {status} jobs");
        }
        Ok(changed)
    }

    /// Cancels a job only while it is still `pending`.
    pub fn cancel_job(&self, id: &str) -> Result<bool, StoreError> {
        self.mutate(|db| {
            let Some(job) = db
                .find_mut(id)
                .filter(|j| j.status == JobStatus::Pending)
            else {
                return false;
            };
            job.status = JobStatus::Canceled;
            job.error_msg = None;
            job.updated_at = Utc::now();
            true
        })
    }

    /// Marks jobs left `running` by a previous process as failed.
    pub fn fail_interrupted(&self, reason: &str) -> Result<usize, StoreError> {
        let now = Utc::now();
        let failed = self.mutate(|db| {
            let mut failed = Vec::new();
            for job in db.jobs.iter_mut().filter(|j| j.status == JobStatus::Running) {
                job.status = JobStatus::Error;
                job.error_msg = Some(reason.to_string());
                job.updated_at = now;
                failed.push(job.id.clone());
            }
            for id in &failed {
                db.logs.entry(id.clone()).or_default().push(LogEntry {
                    ts: now,
                    level: LogLevel::Error,
                    msg: reason.to_string(),
                });
            }
            failed
        })?;

        if !failed.is_empty() {
            warn!("Marked {} interrupted jobs as failed: {failed:?}", failed.len());
        }
        Ok(failed.len())
    }
}
