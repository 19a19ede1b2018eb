use std::ffi::OsStr;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tracing::{debug, error, info};

use crate::error::JobError;
use crate::models::{JobId, JobSnapshot, JobStatus, WorkItem};
use crate::queue::WorkQueue;
use crate::registry::JobRegistry;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub status: JobStatus,
}

/// Owns the job registry and the work queue. Built once at startup and
/// shared by the HTTP handlers and every worker.
pub struct JobService {
    registry: JobRegistry,
    queue: WorkQueue,
    output_dir: PathBuf,
}

impl JobService {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry: JobRegistry::new(),
            queue: WorkQueue::new(),
            output_dir: output_dir.into(),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn is_used(&self, id: &str) -> bool {
        self.registry.is_used(id)
    }

    /// Admits a job and queues its input. Returns as soon as the item is
    /// queued; processing happens on the worker pool.
    pub fn submit(&self, id: &str, input: PathBuf) -> Result<SubmitReceipt, JobError> {
        let item = WorkItem {
            job_id: id.to_owned(),
            input,
        };

        if let Err(err) = self.registry.admit(id, || self.queue.push(item)) {
            error!(job_id = id, error = %err, "job rejected");
            return Err(err);
        }

        info!(job_id = id, backlog = self.queue.pending(), "job queued for processing");

        Ok(SubmitReceipt {
            job_id: id.to_owned(),
            status: JobStatus::Waiting,
        })
    }

    pub fn status(&self, id: &str) -> Result<JobSnapshot, JobError> {
        let snapshot = self.registry.snapshot(id, Utc::now()).map_err(|err| {
            error!(job_id = id, "job not found in status query");
            err
        })?;

        debug!(job_id = id, status = %snapshot.status, "status queried");
        Ok(snapshot)
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        self.registry.list(Utc::now())
    }

    pub fn result_ref(&self, id: &str) -> Result<PathBuf, JobError> {
        self.registry.result_ref(id)
    }

    /// Resolves the result file for download. `expected_name`, when given,
    /// must match the result's file name. A recorded result that has since
    /// disappeared from disk is reported as `ResultMissing`.
    pub async fn result_file(
        &self,
        id: &str,
        expected_name: Option<&str>,
    ) -> Result<PathBuf, JobError> {
        let path = self.registry.result_ref(id).map_err(|err| {
            error!(job_id = id, error = %err, "download refused");
            err
        })?;

        if let Some(name) = expected_name {
            if path.file_name() != Some(OsStr::new(name)) {
                error!(job_id = id, requested = name, "requested file name does not match result");
                return Err(JobError::NotFound(id.to_owned()));
            }
        }

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            Ok(_) => Err(JobError::ResultMissing {
                job_id: id.to_owned(),
                path,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                error!(job_id = id, path = %path.display(), "result file not found");
                Err(JobError::ResultMissing {
                    job_id: id.to_owned(),
                    path,
                })
            }
            Err(err) => Err(JobError::Io(err)),
        }
    }
}
