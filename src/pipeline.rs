//! Step sequencing for one job attempt.
//!
//! Heavy jobs: stage → processing → transcribe → translate → subtitle to
//! `subtitles/` → video to `finished/` → notify. Light jobs: stage → clean
//! name → straight to `finished/`.
//!
//! A failure in a tool step moves the artifact to `failed/` before the error
//! is returned; a failure in a file-stage step leaves the artifact where it
//! is. Either way the attempt ends with a single error for the queue's retry
//! logic.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::AdmissionError;
use crate::job::Job;
use crate::notify::{self, Notifier, NotifyLevel};
use crate::stage::{self, FolderLayout};
use crate::tools::{Transcribe, Translate};

/// Executes one attempt of a queued job.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, job: &mut Job, cancel: &CancellationToken) -> Result<()>;
}

/// Times one step and logs its duration when done.
pub struct StepTimer {
    name: &'static str,
    start: Instant,
}

impl StepTimer {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    pub fn done(self, timings: &mut StepTimings) -> Duration {
        let elapsed = self.start.elapsed();
        info!("   {}: {}", self.name, format_duration(elapsed));
        timings.record(self.name, elapsed);
        elapsed
    }
}

/// Per-step durations of one attempt, in execution order.
#[derive(Debug, Default, Clone)]
pub struct StepTimings {
    steps: Vec<(&'static str, Duration)>,
}

impl StepTimings {
    pub fn record(&mut self, name: &'static str, elapsed: Duration) {
        self.steps.push((name, elapsed));
    }

    pub fn get(&self, name: &str) -> Duration {
        self.steps
            .iter()
            .find(|(step, _)| *step == name)
            .map(|(_, d)| *d)
            .unwrap_or_default()
    }

    pub fn steps(&self) -> &[(&'static str, Duration)] {
        &self.steps
    }
}

/// Human-readable duration: `850ms`, `12.3s`, `4m5s`, `1h2m`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m", secs / 3600, (secs / 60) % 60)
    }
}

/// The subtitle pipeline: folder moves plus the two tool invocations.
pub struct SubtitlePipeline {
    folders: FolderLayout,
    transcriber: Arc<dyn Transcribe>,
    translator: Arc<dyn Translate>,
    notifier: Arc<dyn Notifier>,
    dry_run: bool,
}

impl SubtitlePipeline {
    pub fn new(
        folders: FolderLayout,
        transcriber: Arc<dyn Transcribe>,
        translator: Arc<dyn Translate>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            folders,
            transcriber,
            translator,
            notifier,
            dry_run: false,
        }
    }

    /// Skip the tools and write a placeholder subtitle instead.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn folders(&self) -> &FolderLayout {
        &self.folders
    }

    /// Runs a light job: stage, then straight to `finished/`.
    ///
    /// On failure after staging, the staged copy is moved to `failed/`.
    pub async fn process_light(&self, job: &mut Job) -> Result<()> {
        let started = Instant::now();
        let mut timings = StepTimings::default();
        info!("Light job started: {} ({})", job.file_name, job.id);

        let t = StepTimer::start("staging");
        let staged = match stage::place_at_stage(&job.source_path, &self.folders.staging).await {
            Ok(path) => path,
            Err(e) => return Err(self.step_failed(job, "staging", e.into())),
        };
        job.staging_path = Some(staged.clone());
        t.done(&mut timings);

        self.clean_file_name(job);

        let t = StepTimer::start("move_to_finished");
        let finished = self.folders.finished.join(&job.file_name);
        if let Err(e) = stage::advance_to(&staged, &finished).await {
            self.move_to_failed(job, &staged).await;
            return Err(self.step_failed(job, "move to finished", e.into()));
        }
        job.staging_path = None;
        t.done(&mut timings);

        info!(
            "Light job completed: {} in {}",
            job.file_name,
            format_duration(started.elapsed())
        );
        Ok(())
    }

    /// Moves a file from `failed/` back to `staging/` for a manual retry.
    pub async fn retry_from_failed(&self, file_name: &str) -> Result<PathBuf, AdmissionError> {
        if Path::new(file_name).file_name().and_then(|n| n.to_str()) != Some(file_name) {
            return Err(AdmissionError::InvalidFileName(file_name.to_string()));
        }

        let failed = self.folders.failed.join(file_name);
        if !stage::exists(&failed).await {
            return Err(AdmissionError::NotInFailedFolder(file_name.to_string()));
        }

        let staging = self.folders.staging.join(file_name);
        stage::advance_to(&failed, &staging).await?;
        Ok(staging)
    }

    pub async fn staging_files(&self) -> std::io::Result<Vec<PathBuf>> {
        stage::find_video_files(&self.folders.staging).await
    }

    pub async fn failed_files(&self) -> std::io::Result<Vec<PathBuf>> {
        stage::find_video_files(&self.folders.failed).await
    }

    /// Steps 1-2: get the artifact into `processing/`.
    ///
    /// Reuses whatever an earlier attempt left behind, in order: a file
    /// already in processing, the copy parked in `failed/`, an existing
    /// staged copy. Only when none is left is the source staged again.
    async fn enter_processing(&self, job: &mut Job, timings: &mut StepTimings) -> Result<PathBuf> {
        if let Some(processing) = job.processing_path.clone() {
            if stage::exists(&processing).await {
                info!("Step 1-2: Resuming from processing folder (skipped)");
                return Ok(processing);
            }
            job.processing_path = None;
        }

        if let Some(parked) = job.failed_path.take() {
            if stage::exists(&parked).await {
                info!("Step 1-2: Resuming from failed folder");
                let t = StepTimer::start("move_to_processing");
                let processing = self.folders.processing.join(&job.file_name);
                if let Err(e) = stage::advance_to(&parked, &processing).await {
                    job.failed_path = Some(parked);
                    return Err(self.step_failed(job, "move to processing", e.into()));
                }
                job.processing_path = Some(processing.clone());
                t.done(timings);
                return Ok(processing);
            }
            debug!("Parked copy {} is gone, staging again", parked.display());
        }

        let staged = match job.staging_path.clone() {
            Some(path) => {
                info!("Step 1: Using existing staging file (skipped)");
                path
            }
            None => {
                info!("Step 1: Staging file...");
                let t = StepTimer::start("staging");
                let path = stage::place_at_stage(&job.source_path, &self.folders.staging)
                    .await
                    .map_err(|e| self.step_failed(job, "staging", e.into()))?;
                job.staging_path = Some(path.clone());
                t.done(timings);
                path
            }
        };

        self.clean_file_name(job);

        info!("Step 2: Moving to processing...");
        let t = StepTimer::start("move_to_processing");
        let processing = self.folders.processing.join(&job.file_name);
        stage::advance_to(&staged, &processing)
            .await
            .map_err(|e| self.step_failed(job, "move to processing", e.into()))?;
        job.processing_path = Some(processing.clone());
        job.staging_path = None;
        t.done(timings);

        Ok(processing)
    }

    /// Steps 3-4. Returns `(subtitle, translated)`.
    async fn run_tools(
        &self,
        job: &mut Job,
        processing: &Path,
        cancel: &CancellationToken,
        timings: &mut StepTimings,
    ) -> Result<(PathBuf, PathBuf)> {
        if self.dry_run {
            info!("Step 3-4: Skipping transcription & translation (dry run)");
            let placeholder = processing.with_extension("srt");
            if let Err(e) = stage::write_placeholder_subtitle(&placeholder).await {
                self.move_to_failed(job, processing).await;
                return Err(self.step_failed(job, "create dummy subtitle", e.into()));
            }
            return Ok((placeholder.clone(), placeholder));
        }

        info!("Step 3: Transcribing...");
        let t = StepTimer::start("transcription");
        let subtitle = match self.transcriber.transcribe(processing, cancel).await {
            Ok(path) => path,
            Err(e) => {
                self.move_to_failed(job, processing).await;
                return Err(self.step_failed(job, "transcription", e.into()));
            }
        };
        job.subtitle_path = Some(subtitle.clone());
        t.done(timings);

        info!("Step 4: Translating subtitle...");
        let t = StepTimer::start("translation");
        let translated = match self.translator.translate(&subtitle, cancel).await {
            Ok(path) => path,
            Err(e) => {
                self.move_to_failed(job, processing).await;
                return Err(self.step_failed(job, "translation", e.into()));
            }
        };
        job.translated_path = Some(translated.clone());
        t.done(timings);

        Ok((subtitle, translated))
    }

    fn clean_file_name(&self, job: &mut Job) {
        let cleaned = stage::clean_video_filename(&job.file_name);
        if cleaned != job.file_name {
            info!("Cleaned filename: {} -> {}", job.file_name, cleaned);
            job.file_name = cleaned;
        }
    }

    /// Parks the artifact in `failed/` for manual inspection.
    async fn move_to_failed(&self, job: &mut Job, current: &Path) {
        if !stage::exists(current).await {
            return;
        }

        let failed = self.folders.failed.join(&job.file_name);
        match stage::advance_to(current, &failed).await {
            Ok(()) => {
                info!("Moved to failed folder: {}", failed.display());
                job.failed_path = Some(failed);
                if job.processing_path.as_deref() == Some(current) {
                    job.processing_path = None;
                }
                if job.staging_path.as_deref() == Some(current) {
                    job.staging_path = None;
                }
            }
            Err(e) => warn!("Failed to move to failed folder: {}", e),
        }
    }

    fn step_failed(&self, job: &Job, step: &str, err: anyhow::Error) -> anyhow::Error {
        let err = err.context(format!("{} failed", step));
        error!("Job {} failed: {:#}", job.id, err);

        let body = format!("**{}**\nFailed at: {}\nError: {:#}", job.file_name, step, err);
        notify::send(
            self.notifier.as_ref(),
            NotifyLevel::Failure,
            "Subtitle Processing Failed",
            &body,
        );
        err
    }

    fn notify_success(&self, job: &Job, timings: &StepTimings) {
        let body = format!(
            "**{}**\n\nTranscription: {}\nTranslation: {}",
            job.file_name,
            format_duration(timings.get("transcription")),
            format_duration(timings.get("translation")),
        );
        notify::send(self.notifier.as_ref(), NotifyLevel::Success, "Subtitle Ready", &body);
    }
}

#[async_trait]
impl Processor for SubtitlePipeline {
    async fn process(&self, job: &mut Job, cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let mut timings = StepTimings::default();
        info!("Starting job: {} ({})", job.file_name, job.id);

        let processing = self.enter_processing(job, &mut timings).await?;
        let (subtitle, translated) = self
            .run_tools(job, &processing, cancel, &mut timings)
            .await?;

        if self.dry_run {
            info!("Step 5: Skipping subtitle move (dry run)");
            if let Err(e) = tokio::fs::remove_file(&subtitle).await {
                warn!("Failed to remove dummy subtitle: {}", e);
            }
        } else {
            info!("Step 5: Moving translated subtitle to subtitles folder...");
            let t = StepTimer::start("move_subtitle");
            let final_sub = self
                .folders
                .subtitles
                .join(stage::with_extension(&job.file_name, ".srt"));
            stage::advance_to(&translated, &final_sub)
                .await
                .map_err(|e| self.step_failed(job, "move subtitle", e.into()))?;
            job.translated_path = Some(final_sub);
            t.done(&mut timings);

            if subtitle != translated && stage::exists(&subtitle).await {
                if let Err(e) = tokio::fs::remove_file(&subtitle).await {
                    warn!("Failed to remove intermediate subtitle: {}", e);
                }
            }
        }

        info!("Step 6: Moving video to finished...");
        let t = StepTimer::start("move_to_finished");
        stage::advance_stage(&processing, &self.folders.finished)
            .await
            .map_err(|e| self.step_failed(job, "move video to finished", e.into()))?;
        t.done(&mut timings);

        info!("Step 7: Sending notification...");
        self.notify_success(job, &timings);

        info!(
            "Job completed: {} in {} (transcription {}, translation {})",
            job.file_name,
            format_duration(started.elapsed()),
            format_duration(timings.get("transcription")),
            format_duration(timings.get("translation")),
        );
        Ok(())
    }
}
