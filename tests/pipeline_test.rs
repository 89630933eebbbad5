//! End-to-end scenarios: dispatcher → queue → pipeline → harness, with the
//! external tools replaced by small shell scripts.

#![cfg(unix)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use subtitle_worker::config::Config;
use subtitle_worker::dispatcher::Dispatcher;
use subtitle_worker::harness::Harness;
use subtitle_worker::job::{Job, JobKind, JobStatus};
use subtitle_worker::notify::LogNotifier;
use subtitle_worker::pipeline::SubtitlePipeline;
use subtitle_worker::queue::JobQueue;
use subtitle_worker::tools::{Transcriber, Translator};
use tempfile::TempDir;

const TRANSCRIBE_OK: &str = "printf '1\\n00:00:00,000 --> 00:00:01,000\\nhi\\n' > \"$2\"\n";
const TRANSLATE_OK: &str =
    "while [ $# -gt 0 ]; do if [ \"$1\" = \"-o\" ]; then printf 'ni hao' > \"$2\"; fi; shift; done\n";

struct Worker {
    dir: TempDir,
    queue: JobQueue,
    dispatcher: Dispatcher,
}

impl Worker {
    fn start(transcribe_script: &str, max_retries: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let transcribe = write(dir.path(), "tools/transcribe.sh", transcribe_script.as_bytes());
        let translate = write(dir.path(), "tools/translate.sh", TRANSLATE_OK.as_bytes());

        let env: HashMap<&str, String> = HashMap::from([
            ("DATA_ROOT", dir.path().join("data").display().to_string()),
            ("HARNESS_INTERPRETER", "sh".to_string()),
            ("WHISPER_SCRIPT", transcribe.display().to_string()),
            ("TRANSLATE_SCRIPT", translate.display().to_string()),
            ("QUEUE_MAX_RETRIES", max_retries.to_string()),
            ("QUEUE_RETRY_DELAY_MS", "20".to_string()),
            ("QUEUE_SWEEP_INTERVAL_MS", "0".to_string()),
        ]);
        let config = Config::from_lookup(|key| env.get(key).cloned());

        let harness = Harness::new(&config.harness).with_console_echo(false);
        let interpreter = config.harness.interpreter.clone();
        let pipeline = Arc::new(SubtitlePipeline::new(
            config.folders(),
            Arc::new(Transcriber::new(
                harness.clone(),
                interpreter.clone(),
                config.whisper.clone(),
                config.translate.clone(),
            )),
            Arc::new(Translator::new(harness, interpreter, config.translate.clone())),
            Arc::new(LogNotifier),
        ));

        let queue = JobQueue::new(pipeline.clone(), config.queue.clone());
        queue.start();
        let dispatcher = Dispatcher::new(queue.clone(), pipeline).with_min_video_size(1);

        Self {
            dir,
            queue,
            dispatcher,
        }
    }

    fn data(&self, rel: &str) -> PathBuf {
        self.dir.path().join("data").join(rel)
    }

    fn download(&self, name: &str) -> PathBuf {
        write(self.dir.path(), &format!("downloads/{}", name), b"video bytes")
    }

    async fn wait_until(&self, id: &str, done: impl Fn(&Job) -> bool) -> Job {
        for _ in 0..1000 {
            if let Some(job) = self.queue.get_job(id) {
                if done(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not reach the expected state", id);
    }
}

fn write(root: &Path, rel: &str, bytes: &[u8]) -> PathBuf {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, bytes).unwrap();
    path
}

#[tokio::test]
async fn test_heavy_job_end_to_end() {
    let worker = Worker::start(TRANSCRIBE_OK, "3");
    let source = worker.download("site.com@sone-269.mp4");

    let submission = worker.dispatcher.submit(&source, "batch", "av").await.unwrap();
    assert_eq!(submission.kind, JobKind::Heavy);

    let job = worker.wait_until(&submission.job_id, Job::is_terminal).await;
    worker.queue.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retries, 0);
    assert!(source.exists());
    assert!(worker.data("finished/SONE-269.mp4").exists());
    assert_eq!(
        std::fs::read_to_string(worker.data("subtitles/SONE-269.srt")).unwrap(),
        "ni hao"
    );
    assert!(!worker.data("processing/SONE-269.srt").exists());
    assert!(!worker.data("processing/SONE-269.mp4").exists());
}

#[tokio::test]
async fn test_failure_marker_exhausts_retries() {
    let script = "echo 'Traceback (most recent call last):' >&2\nprintf '1\\n' > \"$2\"\n";
    let worker = Worker::start(script, "1");
    let source = worker.download("SONE-269.mp4");

    let submission = worker.dispatcher.submit(&source, "", "").await.unwrap();
    let job = worker.wait_until(&submission.job_id, Job::is_terminal).await;
    worker.queue.stop().await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retries, 1);
    assert!(job.last_error.unwrap().starts_with("transcription failed"));
    assert!(worker.data("failed/SONE-269.mp4").exists());
    assert_eq!(worker.queue.stats().heavy_failed, 1);
}

#[tokio::test]
async fn test_light_job_never_runs_tools() {
    let script = "touch \"$(dirname \"$0\")/invoked\"\nprintf '1\\n' > \"$2\"\n";
    let worker = Worker::start(script, "3");
    let source = worker.download("SONE-269-C.mp4");

    let submission = worker.dispatcher.submit(&source, "", "").await.unwrap();
    assert_eq!(submission.kind, JobKind::Light);

    let job = worker.wait_until(&submission.job_id, Job::is_terminal).await;
    worker.queue.stop().await;

    assert_eq!(job.status, JobStatus::Completed);
    assert!(worker.data("finished/SONE-269.mp4").exists());
    assert!(!worker.dir.path().join("tools/invoked").exists());
    assert_eq!(worker.queue.stats().light_completed, 1);
}

#[tokio::test]
async fn test_shutdown_cancels_running_tool() {
    let worker = Worker::start("exec sleep 30\n", "3");
    let first = worker.download("ABC-001.mp4");
    let second = worker.download("ABC-002.mp4");

    let first = worker.dispatcher.submit(&first, "", "").await.unwrap();
    let second = worker.dispatcher.submit(&second, "", "").await.unwrap();
    worker
        .wait_until(&first.job_id, |job| job.status == JobStatus::Processing)
        .await;

    tokio::time::timeout(Duration::from_secs(10), worker.queue.stop())
        .await
        .expect("stop must return once the tool is killed");

    let first = worker.queue.get_job(&first.job_id).unwrap();
    assert_eq!(first.status, JobStatus::Pending);
    assert_eq!(first.retries, 1);
    assert!(first.last_error.unwrap().contains("cancelled"));
    assert!(worker.data("failed/ABC-001.mp4").exists());

    let second = worker.queue.get_job(&second.job_id).unwrap();
    assert_eq!(second.status, JobStatus::Pending);
    assert_eq!(second.started_at, None);
}
