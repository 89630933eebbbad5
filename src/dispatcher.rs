//! Admission of new work and the manual retry interface.
//!
//! Every submission is classified once, here. Heavy jobs go to the queue;
//! light jobs run immediately on their own task and only report back to the
//! queue for listing and stats.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::classifier;
use crate::error::AdmissionError;
use crate::job::{Job, JobKind};
use crate::pipeline::SubtitlePipeline;
use crate::queue::JobQueue;
use crate::stage;

/// Accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: String,
    pub kind: JobKind,
}

/// Outcome of a bulk retry: the jobs created plus one message per file that
/// could not be re-queued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkRetry {
    pub job_ids: Vec<String>,
    pub errors: Vec<String>,
}

pub struct Dispatcher {
    queue: JobQueue,
    pipeline: Arc<SubtitlePipeline>,
    min_video_size: u64,
}

impl Dispatcher {
    pub fn new(queue: JobQueue, pipeline: Arc<SubtitlePipeline>) -> Self {
        Self {
            queue,
            pipeline,
            min_video_size: stage::MIN_VIDEO_SIZE,
        }
    }

    /// Size floor used when resolving a download directory to one video.
    pub fn with_min_video_size(mut self, bytes: u64) -> Self {
        self.min_video_size = bytes;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Admits a finished download.
    ///
    /// `path` is either a video file, used as is, or a directory that is
    /// searched for the single valid video it contains.
    pub async fn submit(
        &self,
        path: &Path,
        batch_name: &str,
        category: &str,
    ) -> Result<Submission, AdmissionError> {
        info!("Submission received: {}", path.display());

        let video = self.resolve(path).await?;
        let file_name = video
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AdmissionError::PathNotFound(video.clone()))?;

        let kind = classifier::classify(&file_name);
        let job = Job::new(&video, file_name, batch_name, category, kind);
        let submission = Submission {
            job_id: job.id.clone(),
            kind,
        };

        match kind {
            JobKind::Light => {
                info!(
                    "Light job detected (subtitles already present): {} (job: {})",
                    job.file_name, job.id
                );
                self.queue.register_light_job(&job);
                tokio::spawn(run_light_job(
                    self.queue.clone(),
                    Arc::clone(&self.pipeline),
                    job,
                ));
            }
            JobKind::Heavy => {
                info!("Heavy job queued: {} (job: {})", job.file_name, job.id);
                self.queue.enqueue(job);
            }
        }

        Ok(submission)
    }

    async fn resolve(&self, path: &Path) -> Result<PathBuf, AdmissionError> {
        if !stage::exists(path).await {
            return Err(AdmissionError::PathNotFound(path.to_path_buf()));
        }

        if stage::is_video_file(path) {
            return Ok(path.to_path_buf());
        }

        match stage::find_valid_video_file(path, self.min_video_size).await? {
            Some(video) => Ok(video),
            None => {
                warn!("No valid video file found in: {}", path.display());
                Err(AdmissionError::NoValidVideo(path.to_path_buf()))
            }
        }
    }

    /// Re-queues every video currently sitting in the staging folder.
    pub async fn retry_staging(&self) -> Result<Vec<String>, AdmissionError> {
        let files = self.pipeline.staging_files().await?;
        if files.is_empty() {
            info!("No files in staging");
        }

        Ok(files
            .into_iter()
            .map(|path| {
                let id = self.enqueue_staged(path);
                info!("Re-queued from staging (job: {})", id);
                id
            })
            .collect())
    }

    /// Moves one file from `failed/` back to staging and queues it.
    pub async fn retry_failed(&self, file_name: &str) -> Result<String, AdmissionError> {
        let staged = self.pipeline.retry_from_failed(file_name).await?;
        let id = self.enqueue_staged(staged);
        info!("Re-queued from failed: {} (job: {})", file_name, id);
        Ok(id)
    }

    /// Retries everything in `failed/`, collecting per-file errors instead of
    /// stopping at the first one.
    pub async fn retry_all_failed(&self) -> Result<BulkRetry, AdmissionError> {
        let files = self.pipeline.failed_files().await?;
        let mut outcome = BulkRetry::default();

        for path in files {
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            match self.retry_failed(&name).await {
                Ok(id) => outcome.job_ids.push(id),
                Err(e) => outcome.errors.push(format!("{}: {}", name, e)),
            }
        }

        Ok(outcome)
    }

    fn enqueue_staged(&self, staged: PathBuf) -> String {
        let file_name = staged
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let job = Job::from_staging(staged, file_name);
        let id = job.id.clone();
        self.queue.enqueue(job);
        id
    }
}

/// Light path runner. Owns the job for its whole lifetime and publishes the
/// final state back to the queue.
async fn run_light_job(queue: JobQueue, pipeline: Arc<SubtitlePipeline>, mut job: Job) {
    job.start_processing();
    queue.register_light_job(&job);

    match pipeline.process_light(&mut job).await {
        Ok(()) => job.mark_complete(),
        Err(e) => {
            error!("Light job {} failed: {:#}", job.id, e);
            job.mark_failed(format!("{:#}", e));
        }
    }

    queue.finish_light_job(&job);
}
