use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::TransitionError;

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Waiting,
    Started,
    Finished,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Started => "STARTED",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(text)
    }
}

/// State of a single job. Each variant carries exactly the fields that are
/// meaningful in that state, so a finished job always has a result and a
/// failed job always has an error.
///
/// ```text
///   Waiting ──→ Started ──→ Finished
///      │           │
///      └───────────┴──→ Failed
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum JobRecord {
    Waiting,
    Started {
        started_at: DateTime<Utc>,
    },
    Finished {
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        result: PathBuf,
    },
    /// `started_at` is absent when the job failed schema validation before
    /// it was ever started.
    Failed {
        started_at: Option<DateTime<Utc>>,
        ended_at: DateTime<Utc>,
        error: String,
    },
}

impl JobRecord {
    pub fn status(&self) -> JobStatus {
        match self {
            JobRecord::Waiting => JobStatus::Waiting,
            JobRecord::Started { .. } => JobStatus::Started,
            JobRecord::Finished { .. } => JobStatus::Finished,
            JobRecord::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobRecord::Waiting => None,
            JobRecord::Started { started_at } | JobRecord::Finished { started_at, .. } => {
                Some(*started_at)
            }
            JobRecord::Failed { started_at, .. } => *started_at,
        }
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        match self {
            JobRecord::Finished { ended_at, .. } | JobRecord::Failed { ended_at, .. } => {
                Some(*ended_at)
            }
            _ => None,
        }
    }

    pub fn result(&self) -> Option<&Path> {
        match self {
            JobRecord::Finished { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobRecord::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// `ended_at - started_at` for terminal jobs, `now - started_at` for
    /// running ones, nothing for jobs that never started.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let started_at = self.started_at()?;
        Some(self.ended_at().unwrap_or(now) - started_at)
    }

    pub fn start(&self, at: DateTime<Utc>) -> Result<JobRecord, TransitionError> {
        match self {
            JobRecord::Waiting => Ok(JobRecord::Started { started_at: at }),
            other => Err(TransitionError::new(other.status(), JobStatus::Started)),
        }
    }

    pub fn finish(&self, at: DateTime<Utc>, result: PathBuf) -> Result<JobRecord, TransitionError> {
        match self {
            JobRecord::Started { started_at } => Ok(JobRecord::Finished {
                started_at: *started_at,
                ended_at: at,
                result,
            }),
            other => Err(TransitionError::new(other.status(), JobStatus::Finished)),
        }
    }

    pub fn fail(&self, at: DateTime<Utc>, error: String) -> Result<JobRecord, TransitionError> {
        match self {
            JobRecord::Waiting | JobRecord::Started { .. } => Ok(JobRecord::Failed {
                started_at: self.started_at(),
                ended_at: at,
                error,
            }),
            other => Err(TransitionError::new(other.status(), JobStatus::Failed)),
        }
    }
}

/// A queued unit of work. Created once at admission and consumed by exactly
/// one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub job_id: JobId,
    pub input: PathBuf,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: JobStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Seconds.
    pub processing_time: Option<f64>,
    pub download_url: Option<String>,
    pub direct_download_url: Option<String>,
}

impl JobSnapshot {
    pub fn new(job_id: &str, record: &JobRecord, now: DateTime<Utc>) -> Self {
        let processing_time = record
            .elapsed(now)
            .map(|elapsed| elapsed.num_milliseconds() as f64 / 1000.0);

        let (download_url, direct_download_url) = match record.result() {
            Some(path) => {
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                (
                    Some(format!("/download/{job_id}/{file_name}")),
                    Some(format!("/download/{job_id}")),
                )
            }
            None => (None, None),
        };

        JobSnapshot {
            job_id: job_id.to_owned(),
            status: record.status(),
            result: record.result().map(|path| path.display().to_string()),
            error: record.error().map(str::to_owned),
            processing_time,
            download_url,
            direct_download_url,
        }
    }
}

pub fn build_output_path(output_dir: &Path, now: DateTime<Utc>) -> PathBuf {
    output_dir.join(format!(
        "department_sales_{}_{}.csv",
        now.format("%Y%m%dT%H%M%S"),
        Uuid::new_v4().simple()
    ))
}

/// Uploads are stored under a fresh uuid so two jobs sending the same file
/// name never share a path.
pub fn build_upload_path(upload_dir: &Path, file_name: &str) -> PathBuf {
    let base = Path::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let sanitized: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();

    let sanitized = if sanitized.trim_matches(|c| c == '.' || c == '_').is_empty() {
        "upload.csv".to_owned()
    } else {
        sanitized
    };

    upload_dir.join(format!("{}_{sanitized}", Uuid::new_v4().simple()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_forward_transitions() {
        let started = JobRecord::Waiting.start(at(0)).unwrap();
        assert_eq!(started.status(), JobStatus::Started);

        let finished = started.finish(at(5), PathBuf::from("out.csv")).unwrap();
        assert_eq!(finished.status(), JobStatus::Finished);
        assert_eq!(finished.result(), Some(Path::new("out.csv")));
        assert_eq!(finished.error(), None);
        assert_eq!(finished.elapsed(at(100)), Some(chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_no_backward_transitions() {
        let started = JobRecord::Waiting.start(at(0)).unwrap();
        assert!(started.start(at(1)).is_err());

        let failed = started.fail(at(2), "boom".into()).unwrap();
        assert!(failed.start(at(3)).is_err());
        assert!(failed.finish(at(3), PathBuf::from("x")).is_err());
        assert!(failed.fail(at(3), "again".into()).is_err());

        assert!(JobRecord::Waiting.finish(at(0), PathBuf::from("x")).is_err());
    }

    #[test]
    fn test_fail_before_start_has_no_duration() {
        let failed = JobRecord::Waiting.fail(at(0), "bad header".into()).unwrap();
        assert_eq!(failed.started_at(), None);
        assert_eq!(failed.ended_at(), Some(at(0)));
        assert_eq!(failed.error(), Some("bad header"));
        assert_eq!(failed.elapsed(at(10)), None);
    }

    #[test]
    fn test_running_job_elapsed_uses_now() {
        let started = JobRecord::Waiting.start(at(0)).unwrap();
        assert_eq!(started.elapsed(at(7)), Some(chrono::Duration::seconds(7)));
    }

    #[test]
    fn test_snapshot_download_links_only_when_finished() {
        let waiting = JobSnapshot::new("a", &JobRecord::Waiting, at(0));
        assert_eq!(waiting.download_url, None);
        assert_eq!(waiting.processing_time, None);

        let finished = JobRecord::Waiting
            .start(at(0))
            .unwrap()
            .finish(at(2), PathBuf::from("/out/r.csv"))
            .unwrap();
        let snapshot = JobSnapshot::new("a", &finished, at(9));
        assert_eq!(snapshot.download_url.as_deref(), Some("/download/a/r.csv"));
        assert_eq!(snapshot.direct_download_url.as_deref(), Some("/download/a"));
        assert_eq!(snapshot.processing_time, Some(2.0));
    }

    #[test]
    fn test_status_serializes_upper_case() {
        assert_eq!(serde_json::to_string(&JobStatus::Waiting).unwrap(), "\"WAITING\"");
        assert_eq!(JobStatus::Failed.to_string(), "FAILED");
    }

    #[test]
    fn test_output_path_naming() {
        let path = build_output_path(Path::new("/out"), at(0));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("department_sales_2023"));
        assert!(name.ends_with(".csv"));
        assert_ne!(path, build_output_path(Path::new("/out"), at(0)));
    }

    #[test]
    fn test_upload_path_is_sanitized() {
        let path = build_upload_path(Path::new("/up"), "../../etc/pass wd.csv");
        assert_eq!(path.parent(), Some(Path::new("/up")));
        assert!(path.to_string_lossy().ends_with("_pass_wd.csv"));

        let fallback = build_upload_path(Path::new("/up"), "..");
        assert!(fallback.to_string_lossy().ends_with("_upload.csv"));
    }
}
