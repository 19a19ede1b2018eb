use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::{JobError, TransitionError};
use crate::models::{JobId, JobRecord, JobSnapshot, JobStatus};

#[derive(Default)]
struct Jobs {
    records: HashMap<JobId, JobRecord>,
    /// Every id ever admitted. Never shrinks, so an id stays retired even if
    /// its record is dropped from `records`.
    used_ids: HashSet<JobId>,
}

/// Shared store of job records, touched by the admission path and every
/// worker. All access goes through one lock.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<Jobs>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_used(&self, id: &str) -> bool {
        let jobs = self.jobs.lock();
        jobs.used_ids.contains(id) || jobs.records.contains_key(id)
    }

    /// Retires `id`, records it as `Waiting` and runs `enqueue`, all under the
    /// registry lock. Nobody can observe the waiting record before its work
    /// item is queued, and a failed enqueue leaves no trace.
    pub fn admit<F>(&self, id: &str, enqueue: F) -> Result<(), JobError>
    where
        F: FnOnce() -> Result<(), JobError>,
    {
        let mut jobs = self.jobs.lock();

        if jobs.used_ids.contains(id) || jobs.records.contains_key(id) {
            return Err(JobError::DuplicateJobId(id.to_owned()));
        }

        enqueue()?;

        jobs.used_ids.insert(id.to_owned());
        jobs.records.insert(id.to_owned(), JobRecord::Waiting);

        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<JobRecord> {
        self.jobs.lock().records.get(id).cloned()
    }

    pub fn snapshot(&self, id: &str, now: DateTime<Utc>) -> Result<JobSnapshot, JobError> {
        let jobs = self.jobs.lock();
        let record = jobs
            .records
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_owned()))?;

        Ok(JobSnapshot::new(id, record, now))
    }

    pub fn list(&self, now: DateTime<Utc>) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock();
        let mut snapshots: Vec<JobSnapshot> = jobs
            .records
            .iter()
            .map(|(id, record)| JobSnapshot::new(id, record, now))
            .collect();
        snapshots.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        snapshots
    }

    pub fn result_ref(&self, id: &str) -> Result<PathBuf, JobError> {
        let jobs = self.jobs.lock();
        let record = jobs
            .records
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_owned()))?;

        match record.result() {
            Some(path) => Ok(path.to_path_buf()),
            None => Err(JobError::NotReady(id.to_owned())),
        }
    }

    pub fn mark_started(&self, id: &str, at: DateTime<Utc>) -> Result<JobRecord, JobError> {
        self.update(id, |record| record.start(at))
    }

    pub fn mark_finished(
        &self,
        id: &str,
        at: DateTime<Utc>,
        result: PathBuf,
    ) -> Result<JobRecord, JobError> {
        self.update(id, |record| record.finish(at, result))
    }

    pub fn mark_failed(
        &self,
        id: &str,
        at: DateTime<Utc>,
        error: String,
    ) -> Result<JobRecord, JobError> {
        self.update(id, |record| record.fail(at, error))
    }

    /// Fails the job unless it already reached a terminal state. Returns
    /// whether anything changed.
    pub fn fail_if_live(&self, id: &str, at: DateTime<Utc>, error: String) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.records.get_mut(id) {
            Some(record) if !record.status().is_terminal() => match record.fail(at, error) {
                Ok(failed) => {
                    *record = failed;
                    true
                }
                Err(_) => false,
            },
            _ => false,
        }
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .records
            .values()
            .filter(|record| record.status() == status)
            .count()
    }

    fn update<F>(&self, id: &str, transition: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&JobRecord) -> Result<JobRecord, TransitionError>,
    {
        let mut jobs = self.jobs.lock();
        let record = jobs
            .records
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_owned()))?;

        let next = transition(&*record)?;
        *record = next.clone();

        Ok(next)
    }
}
