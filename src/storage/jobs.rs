//! File-backed retry job store.
//!
//! Jobs are written as `{job_id}.json` under the spool directory via a
//! temp-file-and-rename so a crash mid-write never leaves a torn file.
//! Abandoned jobs append one line to `abandoned.jsonl`; that file is the
//! one artifact that must survive a crash, since it is the record an
//! operator follows up on.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::retry::job::{RetryJob, RetryJobStatus};

/// Errors that can occur during job storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Audit record appended when a job is abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbandonRecord {
    /// Identifier of the abandoned job.
    pub job_id: Uuid,
    /// PMIDs of every item the job still held.
    pub pmids: Vec<String>,
    /// Why the job was abandoned.
    pub reason: String,
    /// Background passes that had been attempted.
    pub retry_count: u32,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
    /// When the job was abandoned.
    pub abandoned_at: DateTime<Utc>,
}

/// Filesystem mirror of retry jobs.
pub struct JobStore {
    dir: PathBuf,
    audit_path: PathBuf,
}

impl JobStore {
    /// Creates a store rooted at the given spool directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let audit_path = dir.join("abandoned.jsonl");
        Self { dir, audit_path }
    }

    /// Spool directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).await?;
        }
        Ok(())
    }

    fn job_path(&self, job_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Writes or updates a job's mirror file.
    pub async fn persist(&self, job: &RetryJob) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let path = self.job_path(job.job_id);
        let tmp = self.dir.join(format!("{}.json.tmp", job.job_id));
        let data = serde_json::to_vec_pretty(job)?;

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Removes a job's mirror file. Missing files are not an error; the
    /// mirror is best-effort and may never have been written.
    pub async fn remove(&self, job_id: Uuid) -> Result<(), StorageError> {
        match fs::remove_file(self.job_path(job_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads every job that should resume processing after a restart.
    ///
    /// Jobs found in `processing` state were interrupted mid-pass and are
    /// reset to `pending`. Unparseable files are skipped with a warning
    /// rather than failing recovery.
    pub async fn load_pending(&self) -> Result<Vec<RetryJob>, StorageError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let data = match fs::read(&path).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable job file");
                    continue;
                }
            };

            match serde_json::from_slice::<RetryJob>(&data) {
                Ok(mut job) => {
                    if job.status == RetryJobStatus::Processing {
                        job.status = RetryJobStatus::Pending;
                    }
                    if matches!(job.status, RetryJobStatus::Pending) {
                        jobs.push(job);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unparseable job file");
                }
            }
        }

        Ok(jobs)
    }

    /// Appends an abandonment record to the audit log.
    pub async fn append_abandoned(&self, record: &AbandonRecord) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads the abandonment audit log, oldest first.
    pub async fn read_abandoned(&self) -> Result<Vec<AbandonRecord>, StorageError> {
        let data = match fs::read_to_string(&self.audit_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(error = %e, "Skipping unparseable audit line"),
            }
        }
        Ok(records)
    }
}
