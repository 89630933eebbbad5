//! Job models and state management for the subtitle queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Unit of work admitted from an external trigger.
///
/// A `Job` is an owned value: whichever task currently processes it (the
/// queue worker or a light-job task) holds it by value and is the only
/// writer. Readers only ever see clones published back to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    /// Original path handed to admission (torrent payload, staging file, ...).
    pub source_path: PathBuf,
    pub file_name: String,
    pub batch_name: String,
    pub category: String,
    pub status: JobStatus,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    is_light: bool,

    pub staging_path: Option<PathBuf>,
    pub processing_path: Option<PathBuf>,
    pub subtitle_path: Option<PathBuf>,
    pub translated_path: Option<PathBuf>,
    /// Where a failed attempt parked the artifact; the next attempt resumes
    /// from here.
    pub failed_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Which execution path a job takes, fixed at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Light,
    Heavy,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Light => write!(f, "light"),
            JobKind::Heavy => write!(f, "heavy"),
        }
    }
}

/// What the queue should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `Pending`; redeliver after the retry delay.
    Retry,
    /// Retry budget exhausted; the job is now `Failed`.
    GiveUp,
}

/// Generates the short opaque id used in logs and the query interface.
pub fn new_job_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

impl Job {
    pub fn new(
        source_path: impl Into<PathBuf>,
        file_name: impl Into<String>,
        batch_name: impl Into<String>,
        category: impl Into<String>,
        kind: JobKind,
    ) -> Self {
        Self {
            id: new_job_id(),
            source_path: source_path.into(),
            file_name: file_name.into(),
            batch_name: batch_name.into(),
            category: category.into(),
            status: JobStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            is_light: kind == JobKind::Light,
            staging_path: None,
            processing_path: None,
            subtitle_path: None,
            translated_path: None,
            failed_path: None,
        }
    }

    /// Creates a heavy job for a file that already sits in the staging folder.
    pub fn from_staging(staging_path: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        let staging_path = staging_path.into();
        let mut job = Self::new(staging_path.clone(), file_name, "", "", JobKind::Heavy);
        job.staging_path = Some(staging_path);
        job
    }

    pub fn is_light(&self) -> bool {
        self.is_light
    }

    pub fn kind(&self) -> JobKind {
        if self.is_light {
            JobKind::Light
        } else {
            JobKind::Heavy
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn start_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_complete(&mut self) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.last_error = None;
    }

    /// Terminal failure without consuming the retry budget (light jobs).
    pub fn mark_failed(&mut self, error: String) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.last_error = Some(error);
    }

    /// Records a failed attempt and decides whether another one is allowed.
    ///
    /// `retries` is incremented exactly once per failed attempt. While it is
    /// below `max_retries` the job goes back to `Pending`; once it reaches the
    /// bound the job becomes `Failed` and stays there.
    ///
    /// A bound of zero is treated as one: every job gets at least one attempt.
    pub fn record_failure(&mut self, error: String, max_retries: u32) -> RetryDecision {
        let max_retries = max_retries.max(1);
        self.retries += 1;
        self.last_error = Some(error);

        if self.retries < max_retries {
            self.status = JobStatus::Pending;
            RetryDecision::Retry
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(Utc::now());
            RetryDecision::GiveUp
        }
    }

    pub fn processing_duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) if self.is_terminal() => {
                Some(completed.signed_duration_since(started).num_milliseconds())
            }
            _ => None,
        }
    }
}
