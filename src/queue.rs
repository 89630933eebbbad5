//! In-memory sequential job queue with fixed-delay retries.
//!
//! Heavy jobs travel through a bounded channel as owned values and are
//! processed one at a time by a single worker. The queue also keeps a
//! snapshot of every admitted job (heavy and light) for inspection; the
//! snapshot is refreshed on every state transition and never removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::job::{Job, JobStatus, RetryDecision};
use crate::pipeline::Processor;
use crate::telemetry;

/// Aggregate counters over every admitted job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub heavy_pending: usize,
    pub heavy_processing: usize,
    pub heavy_completed: usize,
    pub heavy_failed: usize,
    pub light_completed: usize,
    pub light_failed: usize,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    order: Vec<String>,
    /// Heavy jobs currently in the channel, being processed, or waiting on a
    /// retry timer.
    in_flight: HashSet<String>,
    light_completed: usize,
    light_failed: usize,
}

impl QueueState {
    fn publish(&mut self, job: &Job) {
        if self.jobs.insert(job.id.clone(), job.clone()).is_none() {
            self.order.push(job.id.clone());
        }
    }
}

struct Inner {
    state: Mutex<QueueState>,
    tx: mpsc::Sender<Job>,
    rx: Mutex<Option<mpsc::Receiver<Job>>>,
    processor: Arc<dyn Processor>,
    config: QueueConfig,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the queue. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(processor: Arc<dyn Processor>, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                tx,
                rx: Mutex::new(Some(rx)),
                processor,
                config,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawns the worker (and the pending sweep, when configured).
    ///
    /// Calling `start` a second time only logs a warning.
    pub fn start(&self) {
        let Some(rx) = self.inner.rx.lock().take() else {
            warn!("Job queue already started");
            return;
        };

        let mut tasks = self.inner.tasks.lock();
        tasks.push(tokio::spawn(worker_loop(Arc::clone(&self.inner), rx)));
        if let Some(interval) = self.inner.config.sweep_interval {
            tasks.push(tokio::spawn(sweep_loop(Arc::clone(&self.inner), interval)));
        }

        info!(
            "Job queue started (sequential processing, max_retries={}, retry_delay={:?})",
            self.inner.config.max_retries, self.inner.config.retry_delay
        );
    }

    /// Cancels all work and waits for the worker to finish its current job.
    pub async fn stop(&self) {
        info!("Stopping job queue...");
        self.inner.cancel.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Queue task ended abnormally: {}", e);
            }
        }
        info!("Job queue stopped");
    }

    /// Token cancelled by `stop`; light-job tasks share it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Records a heavy job and tries to hand it to the worker.
    ///
    /// When the channel is full the job stays `Pending` in the snapshot list
    /// and the sweep delivers it later.
    pub fn enqueue(&self, job: Job) {
        let id = job.id.clone();
        let file_name = job.file_name.clone();

        let mut state = self.inner.state.lock();
        state.publish(&job);
        match self.inner.tx.try_send(job) {
            Ok(()) => {
                state.in_flight.insert(id.clone());
                info!("Job queued: {} ({})", id, file_name);
            }
            Err(TrySendError::Full(_)) => {
                warn!("Job channel full, job {} will be processed later", id);
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Job channel closed, job {} left pending", id);
            }
        }
    }

    /// Records a light job for listing and stats. It never enters the channel.
    pub fn register_light_job(&self, job: &Job) {
        self.inner.state.lock().publish(job);
    }

    /// Publishes a light job's final state and bumps the matching counter.
    pub fn finish_light_job(&self, job: &Job) {
        {
            let mut state = self.inner.state.lock();
            state.publish(job);
            match job.status {
                JobStatus::Completed => state.light_completed += 1,
                JobStatus::Failed => state.light_failed += 1,
                status => warn!("Light job {} finished in state {}", job.id, status),
            }
        }
        telemetry::record_job_telemetry(job);
    }

    pub fn get_job(&self, id: &str) -> Option<Job> {
        self.inner.state.lock().jobs.get(id).cloned()
    }

    /// Every admitted job, in admission order.
    pub fn get_all_jobs(&self) -> Vec<Job> {
        let state = self.inner.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    pub fn get_pending_jobs(&self) -> Vec<Job> {
        self.get_all_jobs()
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending)
            .collect()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        let mut stats = QueueStats {
            total: state.order.len(),
            light_completed: state.light_completed,
            light_failed: state.light_failed,
            ..QueueStats::default()
        };

        for job in state.jobs.values().filter(|job| !job.is_light()) {
            match job.status {
                JobStatus::Pending => stats.heavy_pending += 1,
                JobStatus::Processing => stats.heavy_processing += 1,
                JobStatus::Completed => stats.heavy_completed += 1,
                JobStatus::Failed => stats.heavy_failed += 1,
            }
        }
        stats
    }

    /// Re-dispatches pending heavy jobs that nothing is currently carrying.
    /// Returns how many were handed to the channel.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }
}

impl Inner {
    fn publish(&self, job: &Job) {
        self.state.lock().publish(job);
    }

    fn publish_and_release(&self, job: &Job) {
        let mut state = self.state.lock();
        state.publish(job);
        state.in_flight.remove(&job.id);
    }

    fn release(&self, id: &str) {
        self.state.lock().in_flight.remove(id);
    }

    fn sweep(&self) -> usize {
        let mut state = self.state.lock();
        let stranded: Vec<Job> = state
            .order
            .iter()
            .filter(|id| !state.in_flight.contains(*id))
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| !job.is_light() && job.status == JobStatus::Pending)
            .cloned()
            .collect();

        let mut sent = 0;
        for job in stranded {
            let id = job.id.clone();
            if self.tx.try_send(job).is_err() {
                break;
            }
            state.in_flight.insert(id);
            sent += 1;
        }
        sent
    }

    async fn process_job(self: &Arc<Self>, mut job: Job) {
        job.start_processing();
        self.publish(&job);
        info!("Processing job: {} ({})", job.id, job.file_name);

        let result = self.processor.process(&mut job, &self.cancel).await;

        match result {
            Ok(()) => {
                job.mark_complete();
                info!("Job completed: {}", job.id);
                self.publish_and_release(&job);
            }
            Err(e) => {
                let message = format!("{:#}", e);
                match job.record_failure(message, self.config.max_retries) {
                    RetryDecision::Retry => {
                        warn!(
                            "Job {} failed (attempt {}/{}): {:#}",
                            job.id, job.retries, self.config.max_retries, e
                        );
                        self.publish(&job);
                        telemetry::record_job_telemetry(&job);
                        self.schedule_retry(job);
                        return;
                    }
                    RetryDecision::GiveUp => {
                        error!(
                            "Job {} failed after {} attempts: {:#}",
                            job.id, job.retries, e
                        );
                        self.publish_and_release(&job);
                    }
                }
            }
        }

        telemetry::record_job_telemetry(&job);
    }

    /// Redelivers `job` after the retry delay unless the queue is stopped
    /// first. The job stays in flight for the whole wait.
    fn schedule_retry(self: &Arc<Self>, job: Job) {
        let inner = Arc::clone(self);
        let delay = self.config.retry_delay;

        tokio::spawn(async move {
            let id = job.id.clone();
            tokio::select! {
                _ = inner.cancel.cancelled() => {
                    debug!("Retry of job {} abandoned on shutdown", id);
                    inner.release(&id);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            tokio::select! {
                _ = inner.cancel.cancelled() => inner.release(&id),
                sent = inner.tx.send(job) => {
                    if sent.is_err() {
                        inner.release(&id);
                    }
                }
            }
        });
    }
}

async fn worker_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Job>) {
    debug!("Queue worker started");

    loop {
        let job = tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        inner.process_job(job).await;
    }

    debug!("Queue worker exited");
}

async fn sweep_loop(inner: Arc<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let redispatched = inner.sweep();
        if redispatched > 0 {
            info!("Sweep re-dispatched {} pending job(s)", redispatched);
        }

        let pending = {
            let state = inner.state.lock();
            state
                .jobs
                .values()
                .filter(|job| job.status == JobStatus::Pending)
                .count()
        };
        telemetry::record_worker_heartbeat(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobKind;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Pops one scripted outcome per attempt; succeeds once the script runs
    /// out.
    #[derive(Default)]
    struct ScriptedProcessor {
        outcomes: Mutex<VecDeque<bool>>,
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        hold: Duration,
    }

    impl ScriptedProcessor {
        fn failing(times: usize) -> Self {
            Self {
                outcomes: Mutex::new(std::iter::repeat(false).take(times).collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        async fn process(&self, _job: &mut Job, _cancel: &CancellationToken) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.outcomes.lock().pop_front().unwrap_or(true) {
                Ok(())
            } else {
                Err(anyhow::anyhow!("tool exploded").context("transcription failed"))
            }
        }
    }

    /// Waits for the tool call and then blocks until cancellation.
    #[derive(Default)]
    struct BlockingProcessor {
        calls: AtomicUsize,
        started: tokio::sync::Notify,
    }

    #[async_trait]
    impl Processor for BlockingProcessor {
        async fn process(&self, _job: &mut Job, cancel: &CancellationToken) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            cancel.cancelled().await;
            anyhow::bail!("transcription failed: python3 cancelled")
        }
    }

    fn config(max_retries: u32) -> QueueConfig {
        QueueConfig {
            max_retries,
            retry_delay: Duration::from_millis(10),
            capacity: 100,
            sweep_interval: None,
        }
    }

    fn heavy(name: &str) -> Job {
        Job::new(format!("/data/input/{}", name), name, "", "", JobKind::Heavy)
    }

    async fn wait_terminal(queue: &JobQueue, id: &str) -> Job {
        for _ in 0..500 {
            if let Some(job) = queue.get_job(id) {
                if job.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached a terminal state", id);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let processor = Arc::new(ScriptedProcessor::failing(2));
        let queue = JobQueue::new(processor.clone(), config(3));
        queue.start();

        let job = heavy("SONE-269.mp4");
        let id = job.id.clone();
        queue.enqueue(job);

        let done = wait_terminal(&queue, &id).await;
        queue.stop().await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.retries, 2);
        assert_eq!(done.last_error, None);
        assert!(done.completed_at.is_some());
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_at_max_retries() {
        let processor = Arc::new(ScriptedProcessor::failing(5));
        let queue = JobQueue::new(processor.clone(), config(1));
        queue.start();

        let job = heavy("SONE-269.mp4");
        let id = job.id.clone();
        queue.enqueue(job);

        let done = wait_terminal(&queue, &id).await;
        // Give a stray retry timer the chance to misbehave.
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.stop().await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.retries, 1);
        assert_eq!(
            done.last_error.as_deref(),
            Some("transcription failed: tool exploded")
        );
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_one_heavy_job_at_a_time() {
        let processor = Arc::new(ScriptedProcessor {
            hold: Duration::from_millis(20),
            ..ScriptedProcessor::default()
        });
        let queue = JobQueue::new(processor.clone(), config(3));
        queue.start();

        let ids: Vec<String> = (0..4)
            .map(|i| {
                let job = heavy(&format!("ABC-00{}.mp4", i));
                let id = job.id.clone();
                queue.enqueue(job);
                id
            })
            .collect();

        for id in &ids {
            wait_terminal(&queue, id).await;
        }
        queue.stop().await;

        assert_eq!(processor.max_active.load(Ordering::SeqCst), 1);
        let listed: Vec<String> = queue.get_all_jobs().into_iter().map(|j| j.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_shutdown_mid_job_dispatches_nothing_else() {
        let processor = Arc::new(BlockingProcessor::default());
        let queue = JobQueue::new(processor.clone(), config(3));
        queue.start();

        let first = heavy("ABC-001.mp4");
        let second = heavy("ABC-002.mp4");
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        queue.enqueue(first);
        queue.enqueue(second);

        processor.started.notified().await;
        tokio::time::timeout(Duration::from_secs(5), queue.stop())
            .await
            .expect("stop must not hang");

        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        let first = queue.get_job(&first_id).unwrap();
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.retries, 1);
        assert!(first.last_error.unwrap().contains("cancelled"));
        assert_eq!(queue.get_job(&second_id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_full_channel_is_recovered_by_sweep() {
        let processor = Arc::new(ScriptedProcessor::default());
        let queue = JobQueue::new(
            processor.clone(),
            QueueConfig {
                capacity: 1,
                ..config(3)
            },
        );

        let first = heavy("ABC-001.mp4");
        let second = heavy("ABC-002.mp4");
        let second_id = second.id.clone();
        queue.enqueue(first);
        queue.enqueue(second);

        // Nothing new fits while the channel is full and both are tracked.
        assert_eq!(queue.sweep(), 0);
        assert_eq!(queue.get_pending_jobs().len(), 2);

        queue.start();
        for _ in 0..500 {
            if queue.sweep() > 0 || queue.get_job(&second_id).unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let done = wait_terminal(&queue, &second_id).await;
        queue.stop().await;
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_sweep_timer_redelivers_stranded_job() {
        let processor = Arc::new(ScriptedProcessor::default());
        let queue = JobQueue::new(
            processor.clone(),
            QueueConfig {
                capacity: 1,
                sweep_interval: Some(Duration::from_millis(20)),
                ..config(3)
            },
        );

        let first = heavy("ABC-001.mp4");
        let second = heavy("ABC-002.mp4");
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        queue.enqueue(first);
        queue.enqueue(second);

        // Only the periodic sweep can pick up the job the full channel rejected.
        queue.start();
        let first = wait_terminal(&queue, &first_id).await;
        let second = wait_terminal(&queue, &second_id).await;
        queue.stop().await;

        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stats_partition_heavy_and_light() {
        let processor = Arc::new(ScriptedProcessor::failing(1));
        let queue = JobQueue::new(processor, config(1));
        queue.start();

        let failing = heavy("ABC-001.mp4");
        let passing = heavy("ABC-002.mp4");
        let (failing_id, passing_id) = (failing.id.clone(), passing.id.clone());
        queue.enqueue(failing);
        queue.enqueue(passing);

        let mut light_ok = Job::new("/data/input/a-C.mp4", "a-C.mp4", "", "", JobKind::Light);
        let mut light_bad = Job::new("/data/input/b-C.mp4", "b-C.mp4", "", "", JobKind::Light);
        queue.register_light_job(&light_ok);
        queue.register_light_job(&light_bad);
        light_ok.mark_complete();
        light_bad.mark_failed("staging failed".to_string());
        queue.finish_light_job(&light_ok);
        queue.finish_light_job(&light_bad);

        wait_terminal(&queue, &failing_id).await;
        wait_terminal(&queue, &passing_id).await;
        queue.stop().await;

        assert_eq!(
            queue.stats(),
            QueueStats {
                total: 4,
                heavy_pending: 0,
                heavy_processing: 0,
                heavy_completed: 1,
                heavy_failed: 1,
                light_completed: 1,
                light_failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_get_all_jobs_returns_copies() {
        let queue = JobQueue::new(Arc::new(ScriptedProcessor::default()), config(1));
        let job = heavy("ABC-001.mp4");
        let id = job.id.clone();
        queue.enqueue(job);

        let mut listed = queue.get_all_jobs();
        listed[0].status = JobStatus::Failed;

        assert_eq!(queue.get_job(&id).unwrap().status, JobStatus::Pending);
        assert!(queue.get_job("missing").is_none());
    }
}
